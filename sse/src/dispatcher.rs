use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};

use crate::channel::{Channel, Subscriber, SWEEP_INTERVAL};
use crate::client::{ClientId, ClientInfo};
use crate::hooks::EventHooks;

/// Commands serviced by the dispatch loop. All registry mutations happen by
/// posting one of these; read queries carry a reply slot so each query
/// observes a consistent snapshot.
enum Command {
    AddClient {
        info: ClientInfo,
        queue: mpsc::Sender<String>,
    },
    RemoveClient {
        id: ClientId,
        channel: String,
    },
    SendMessage {
        channel: String,
        payload: String,
    },
    CloseChannel {
        channel: String,
    },
    CloseAllChannels,
    Shutdown {
        done: oneshot::Sender<()>,
    },
    Channels {
        reply: oneshot::Sender<Vec<String>>,
    },
    ConnectionCount {
        reply: oneshot::Sender<usize>,
    },
    ConnectionCountPerChannel {
        channel: String,
        reply: oneshot::Sender<usize>,
    },
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Keep the last broadcast of a channel for late joiners, let empty
    /// channels linger, and sweep them once idle for a day.
    pub retention: bool,
}

/// Cloneable handle to the Event Source dispatch loop.
///
/// The loop is the single writer of the channel registry: every mutation
/// goes through the command stream, and the spawned task applies them one at
/// a time. Handles only post commands (or await a reply), so they are cheap
/// to clone and safe to use from any task.
#[derive(Clone)]
pub struct EventSource {
    commands: mpsc::UnboundedSender<Command>,
}

impl EventSource {
    /// Spawns the dispatch loop and returns a handle to it.
    pub fn spawn(settings: Settings, hooks: Arc<dyn EventHooks>) -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            channels: HashMap::new(),
            settings,
            hooks,
        };

        tokio::spawn(dispatcher.dispatch(inbox));

        Self { commands }
    }

    /// Registers a subscriber handle. `queue` is the sending half of the
    /// subscriber's outbound queue; the dispatcher owns it from here on and
    /// closing it is how the subscriber's stream is ended.
    ///
    /// Returns false when the dispatcher has shut down.
    pub fn add_client(&self, info: ClientInfo, queue: mpsc::Sender<String>) -> bool {
        self.commands
            .send(Command::AddClient { info, queue })
            .is_ok()
    }

    /// Removes a subscriber handle. Safe to call for a handle that is
    /// already gone.
    pub fn remove_client(&self, id: ClientId, channel: String) {
        let _ = self.commands.send(Command::RemoveClient { id, channel });
    }

    /// Broadcasts a payload to every subscriber of a channel. Messages for
    /// channels nobody has ever subscribed to are dropped.
    pub fn send_message(&self, channel: String, payload: String) {
        let _ = self.commands.send(Command::SendMessage { channel, payload });
    }

    /// Closes one channel and every subscriber in it.
    pub fn close_channel(&self, channel: String) {
        let _ = self.commands.send(Command::CloseChannel { channel });
    }

    /// Closes all channels and every subscriber in them. The registry stays
    /// usable; new subscribers recreate their channels.
    pub fn close_all_channels(&self) {
        let _ = self.commands.send(Command::CloseAllChannels);
    }

    /// Closes every channel and stops the dispatch loop. Returns once the
    /// loop has drained; calling it again is a no-op.
    pub async fn shutdown(&self) {
        let (done, ack) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).is_ok() {
            let _ = ack.await;
        }
    }

    /// Returns all opened channels name, or an empty vec if none open.
    pub async fn channels(&self) -> Vec<String> {
        let (reply, answer) = oneshot::channel();
        if self.commands.send(Command::Channels { reply }).is_err() {
            return Vec::new();
        }
        answer.await.unwrap_or_default()
    }

    /// Returns the connection count in the Event Source.
    pub async fn connection_count(&self) -> usize {
        let (reply, answer) = oneshot::channel();
        if self.commands.send(Command::ConnectionCount { reply }).is_err() {
            return 0;
        }
        answer.await.unwrap_or_default()
    }

    /// Returns the connection count in the selected channel.
    pub async fn connection_count_per_channel(&self, channel: &str) -> usize {
        let (reply, answer) = oneshot::channel();
        let query = Command::ConnectionCountPerChannel {
            channel: channel.to_string(),
            reply,
        };
        if self.commands.send(query).is_err() {
            return 0;
        }
        answer.await.unwrap_or_default()
    }
}

/// The dispatch loop state: owned by exactly one task, mutated nowhere else.
struct Dispatcher {
    channels: HashMap<String, Channel>,
    settings: Settings,
    hooks: Arc<dyn EventHooks>,
}

impl Dispatcher {
    /// Holds all Event Source channel logic.
    async fn dispatch(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut sweep = interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        sweep.tick().await;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { return };
                    if self.handle(command).await.is_break() {
                        commands.close();
                        return;
                    }
                }
                _ = sweep.tick(), if self.settings.retention => {
                    self.close_expired(Instant::now());
                }
            }
        }
    }

    async fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::AddClient { info, queue } => self.add_client(info, queue).await,
            Command::RemoveClient { id, channel } => self.remove_client(&id, &channel).await,
            Command::SendMessage { channel, payload } => self.broadcast(&channel, payload).await,
            Command::CloseChannel { channel } => self.close_channel(&channel),
            Command::CloseAllChannels => self.close_all_channels(),
            Command::Shutdown { done } => {
                self.close_all_channels();
                info!("Event Source stopped.");
                let _ = done.send(());
                return ControlFlow::Break(());
            }
            Command::Channels { reply } => {
                let _ = reply.send(self.channels.keys().cloned().collect());
            }
            Command::ConnectionCount { reply } => {
                let count = self.channels.values().map(|c| c.subscribers.len()).sum();
                let _ = reply.send(count);
            }
            Command::ConnectionCountPerChannel { channel, reply } => {
                let count = self
                    .channels
                    .get(&channel)
                    .map_or(0, |c| c.subscribers.len());
                let _ = reply.send(count);
            }
        }

        ControlFlow::Continue(())
    }

    async fn add_client(&mut self, info: ClientInfo, queue: mpsc::Sender<String>) {
        if !self.channels.contains_key(&info.channel) {
            self.channels.insert(info.channel.clone(), Channel::new());
            info!("New channel '{}' created.", info.channel);

            let seed = self.hooks.on_channel_create(&info.channel).await;
            if self.settings.retention {
                if let (Some(seed), Some(channel)) = (seed, self.channels.get_mut(&info.channel)) {
                    channel.last_message = Some(seed);
                }
            }
        }

        let Some(channel) = self.channels.get_mut(&info.channel) else {
            return;
        };

        channel.subscribers.insert(
            info.id.clone(),
            Subscriber {
                info: info.clone(),
                queue,
            },
        );
        channel.touch();
        info!("Client '{}' connected to channel '{}'.", info.ip, info.channel);

        self.hooks.on_client_connect(&info).await;

        if self.settings.retention {
            if let Some(last) = channel.last_message.clone() {
                if let Some(subscriber) = channel.subscribers.get(&info.id) {
                    if subscriber.queue.send(last).await.is_err() {
                        debug!(
                            "Client '{}' went away before the replay was delivered.",
                            info.ip
                        );
                    }
                }
            }
        }
    }

    async fn remove_client(&mut self, id: &ClientId, channel_name: &str) {
        let Some(channel) = self.channels.get_mut(channel_name) else {
            return;
        };
        let Some(subscriber) = channel.subscribers.remove(id) else {
            return;
        };

        channel.touch();
        info!(
            "Client '{}' disconnected from channel '{}'.",
            subscriber.info.ip, channel_name
        );

        // Closing the outbound queue ends the subscriber's stream. The
        // dispatcher holds the only sender, so this close happens exactly
        // once.
        drop(subscriber.queue);

        if channel.subscribers.is_empty() && !self.settings.retention {
            self.channels.remove(channel_name);
            info!("Channel '{channel_name}' has no clients. Channel closed.");
            self.hooks.on_channel_close(channel_name).await;
        }

        self.hooks.on_client_disconnect(&subscriber.info).await;
    }

    async fn broadcast(&mut self, channel_name: &str, payload: String) {
        let Some(channel) = self.channels.get_mut(channel_name) else {
            info!("Channel '{channel_name}' doesn't exist. Message not sent.");
            return;
        };

        channel.last_message = Some(payload.clone());
        channel.touch();

        let mut delivered = 0;
        for subscriber in channel.subscribers.values() {
            // A full queue blocks here until the subscriber drains; a
            // dropped receiver fails immediately and that copy is skipped.
            if subscriber.queue.send(payload.clone()).await.is_ok() {
                delivered += 1;
            } else {
                debug!("Client '{}' is gone. Skipping its copy.", subscriber.info.ip);
            }
        }

        info!("Message sent to {delivered} clients on channel '{channel_name}'.");
    }

    fn close_channel(&mut self, channel_name: &str) {
        // Removing the channel drops every subscriber's queue sender, which
        // ends each attached stream, and discards the last-message slot.
        if self.channels.remove(channel_name).is_some() {
            info!("Channel '{channel_name}' closed.");
        } else {
            debug!("Requested to close channel '{channel_name}', but it was already closed.");
        }
    }

    fn close_all_channels(&mut self) {
        let names: Vec<String> = self.channels.keys().cloned().collect();
        for name in names {
            self.close_channel(&name);
        }
    }

    fn close_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.expired_at(now))
            .map(|(name, _)| name.clone())
            .collect();

        for name in expired {
            info!("Channel '{name}' has been idle for too long. Closing.");
            self.close_channel(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CHANNEL_IDLE_EXPIRATION;
    use crate::client::outbound_queue;
    use crate::hooks::NoopHooks;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    fn spawn(retention: bool) -> EventSource {
        EventSource::spawn(Settings { retention }, Arc::new(NoopHooks))
    }

    fn client(channel: &str) -> ClientInfo {
        ClientInfo {
            id: ClientId::new(),
            channel: channel.to_string(),
            ip: "10.0.0.1".to_string(),
        }
    }

    async fn recv(queue: &mut mpsc::Receiver<String>) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), queue.recv())
            .await
            .expect("timed out waiting on an outbound queue")
    }

    struct SeedHooks;

    #[async_trait]
    impl EventHooks for SeedHooks {
        async fn on_channel_create(&self, _channel: &str) -> Option<String> {
            Some(r#"{"seeded":true}"#.to_string())
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        events: Mutex<Vec<String>>,
    }

    impl RecordingHooks {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    #[async_trait]
    impl EventHooks for RecordingHooks {
        async fn on_channel_create(&self, channel: &str) -> Option<String> {
            self.events.lock().unwrap().push(format!("create {channel}"));
            None
        }

        async fn on_client_connect(&self, client: &ClientInfo) {
            self.events
                .lock()
                .unwrap()
                .push(format!("connect {}", client.channel));
        }

        async fn on_client_disconnect(&self, client: &ClientInfo) {
            self.events
                .lock()
                .unwrap()
                .push(format!("disconnect {}", client.channel));
        }

        async fn on_channel_close(&self, channel: &str) {
            self.events.lock().unwrap().push(format!("close {channel}"));
        }
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_subscriber() {
        let es = spawn(false);
        let mut queues = Vec::new();

        for _ in 0..3 {
            let (tx, rx) = outbound_queue();
            assert!(es.add_client(client("/t/2"), tx));
            queues.push(rx);
        }

        es.send_message("/t/2".to_string(), "42".to_string());

        for queue in &mut queues {
            assert_eq!(recv(queue).await.as_deref(), Some("42"));
        }
    }

    #[tokio::test]
    async fn test_single_subscriber_sees_broadcast_order() {
        let es = spawn(false);
        let (tx, mut rx) = outbound_queue();
        assert!(es.add_client(client("/t/1"), tx));

        es.send_message("/t/1".to_string(), "first".to_string());
        es.send_message("/t/1".to_string(), "second".to_string());

        assert_eq!(recv(&mut rx).await.as_deref(), Some("first"));
        assert_eq!(recv(&mut rx).await.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_late_join_replays_last_message() {
        let es = spawn(true);

        let first = client("/t/3");
        let (tx, mut rx) = outbound_queue();
        assert!(es.add_client(first.clone(), tx));

        es.send_message("/t/3".to_string(), r#"{"k":1}"#.to_string());
        assert_eq!(recv(&mut rx).await.as_deref(), Some(r#"{"k":1}"#));

        es.remove_client(first.id, first.channel);

        // The channel is retained, so a late joiner is seeded first.
        let (tx, mut rx) = outbound_queue();
        assert!(es.add_client(client("/t/3"), tx));
        assert_eq!(recv(&mut rx).await.as_deref(), Some(r#"{"k":1}"#));
    }

    #[tokio::test]
    async fn test_no_replay_without_retention() {
        let es = spawn(false);

        let (tx, mut rx) = outbound_queue();
        assert!(es.add_client(client("/t/3"), tx));
        es.send_message("/t/3".to_string(), "old".to_string());
        assert_eq!(recv(&mut rx).await.as_deref(), Some("old"));

        let (tx, mut late) = outbound_queue();
        assert!(es.add_client(client("/t/3"), tx));
        es.send_message("/t/3".to_string(), "new".to_string());

        // The late joiner sees only broadcasts made after it subscribed.
        assert_eq!(recv(&mut late).await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_channel_create_hook_seeds_the_slot() {
        let es = EventSource::spawn(Settings { retention: true }, Arc::new(SeedHooks));

        let (tx, mut rx) = outbound_queue();
        assert!(es.add_client(client("/t/s"), tx));

        assert_eq!(recv(&mut rx).await.as_deref(), Some(r#"{"seeded":true}"#));
    }

    #[tokio::test]
    async fn test_hook_seed_is_ignored_without_retention() {
        let es = EventSource::spawn(Settings { retention: false }, Arc::new(SeedHooks));

        let (tx, mut rx) = outbound_queue();
        assert!(es.add_client(client("/t/s"), tx));
        es.send_message("/t/s".to_string(), "live".to_string());

        assert_eq!(recv(&mut rx).await.as_deref(), Some("live"));
    }

    #[tokio::test]
    async fn test_broadcast_to_unknown_channel_is_dropped() {
        let es = spawn(true);

        es.send_message("/nobody".to_string(), "lost".to_string());

        // No channel was created by the dropped broadcast.
        assert!(es.channels().await.is_empty());
        assert_eq!(es.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_last_disconnect_destroys_channel_without_retention() {
        let es = spawn(false);
        let info = client("/t/d");
        let (tx, mut rx) = outbound_queue();
        assert!(es.add_client(info.clone(), tx));

        es.remove_client(info.id, info.channel);

        assert!(es.channels().await.is_empty());
        // The dispatcher closed the outbound queue.
        assert_eq!(recv(&mut rx).await, None);
    }

    #[tokio::test]
    async fn test_retained_channel_survives_last_disconnect() {
        let es = spawn(true);
        let info = client("/t/r");
        let (tx, _rx) = outbound_queue();
        assert!(es.add_client(info.clone(), tx));

        es.remove_client(info.id, info.channel);

        assert_eq!(es.channels().await, vec!["/t/r".to_string()]);
        assert_eq!(es.connection_count_per_channel("/t/r").await, 0);
    }

    #[tokio::test]
    async fn test_connection_counts() {
        let es = spawn(false);
        let (tx_a, _rx_a) = outbound_queue();
        let (tx_b, _rx_b) = outbound_queue();
        let (tx_c, _rx_c) = outbound_queue();

        assert!(es.add_client(client("/t/a"), tx_a));
        assert!(es.add_client(client("/t/a"), tx_b));
        assert!(es.add_client(client("/t/b"), tx_c));

        assert_eq!(es.connection_count().await, 3);
        assert_eq!(es.connection_count_per_channel("/t/a").await, 2);
        assert_eq!(es.connection_count_per_channel("/t/b").await, 1);
        assert_eq!(es.connection_count_per_channel("/t/missing").await, 0);

        let mut channels = es.channels().await;
        channels.sort();
        assert_eq!(channels, vec!["/t/a".to_string(), "/t/b".to_string()]);
    }

    #[tokio::test]
    async fn test_close_channel_terminates_subscribers() {
        let es = spawn(false);
        let (tx, mut rx) = outbound_queue();
        assert!(es.add_client(client("/t/c"), tx));

        es.close_channel("/t/c".to_string());

        assert_eq!(recv(&mut rx).await, None);
        assert!(es.channels().await.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_channels_drains_everything() {
        let es = spawn(true);
        let (tx_a, mut rx_a) = outbound_queue();
        let (tx_b, mut rx_b) = outbound_queue();
        assert!(es.add_client(client("/t/1"), tx_a));
        assert!(es.add_client(client("/t/2"), tx_b));

        es.close_all_channels();

        assert_eq!(recv(&mut rx_a).await, None);
        assert_eq!(recv(&mut rx_b).await, None);
        assert!(es.channels().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_terminates_streams_and_is_idempotent() {
        let es = spawn(false);
        let mut queues = Vec::new();
        for name in ["/t/x", "/t/y", "/t/z"] {
            let (tx, rx) = outbound_queue();
            assert!(es.add_client(client(name), tx));
            queues.push(rx);
        }

        es.shutdown().await;

        for queue in &mut queues {
            assert_eq!(recv(queue).await, None);
        }
        assert_eq!(es.connection_count().await, 0);
        assert!(es.channels().await.is_empty());

        // A second shutdown finds the loop gone and returns immediately.
        es.shutdown().await;

        // Registrations after shutdown are refused.
        let (tx, _rx) = outbound_queue();
        assert!(!es.add_client(client("/t/late"), tx));
    }

    #[tokio::test]
    async fn test_gone_subscriber_does_not_wedge_broadcasts() {
        let es = spawn(false);

        let (tx_dead, rx_dead) = outbound_queue();
        assert!(es.add_client(client("/t/w"), tx_dead));
        // Peer vanished without a RemoveClient yet.
        drop(rx_dead);

        let (tx_live, mut rx_live) = outbound_queue();
        assert!(es.add_client(client("/t/w"), tx_live));

        es.send_message("/t/w".to_string(), "still flowing".to_string());
        assert_eq!(recv(&mut rx_live).await.as_deref(), Some("still flowing"));
    }

    #[tokio::test]
    async fn test_remove_client_tolerates_unknown_handles() {
        let es = spawn(false);
        es.remove_client(ClientId::new(), "/t/ghost".to_string());

        // The loop is still alive and serving.
        let (tx, mut rx) = outbound_queue();
        assert!(es.add_client(client("/t/alive"), tx));
        es.send_message("/t/alive".to_string(), "ok".to_string());
        assert_eq!(recv(&mut rx).await.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_hooks_fire_in_lifecycle_order() {
        let hooks = Arc::new(RecordingHooks::default());
        let es = EventSource::spawn(Settings { retention: false }, hooks.clone());

        let info = client("/t/h");
        let (tx, _rx) = outbound_queue();
        assert!(es.add_client(info.clone(), tx));
        es.remove_client(info.id, info.channel);

        // Queries are serialized behind the commands above.
        let _ = es.channels().await;

        assert_eq!(
            hooks.take(),
            vec![
                "create /t/h".to_string(),
                "connect /t/h".to_string(),
                "close /t/h".to_string(),
                "disconnect /t/h".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_close_expired_reaps_idle_channels() {
        let mut dispatcher = Dispatcher {
            channels: HashMap::new(),
            settings: Settings { retention: true },
            hooks: Arc::new(NoopHooks),
        };

        let info = client("/t/idle");
        let (tx, mut rx) = outbound_queue();
        let mut channel = Channel::new();
        channel.subscribers.insert(
            info.id.clone(),
            Subscriber {
                info,
                queue: tx,
            },
        );
        let opened = channel.last_active;
        dispatcher.channels.insert("/t/idle".to_string(), channel);

        // Not yet expired: nothing happens.
        dispatcher.close_expired(opened + CHANNEL_IDLE_EXPIRATION);
        assert!(dispatcher.channels.contains_key("/t/idle"));

        // One second past the idle window: the sweep closes the channel.
        dispatcher.close_expired(opened + CHANNEL_IDLE_EXPIRATION + Duration::from_secs(1));
        assert!(dispatcher.channels.is_empty());
        assert_eq!(recv(&mut rx).await, None);
    }
}
