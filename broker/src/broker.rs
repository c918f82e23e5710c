use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, ExchangeKind};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex};

use crate::envelope::{decode, Envelope};
use crate::error::Result;

/// First reconnection delay after a lost connection.
const RECONNECT_BACKOFF_MIN: Duration = Duration::from_secs(1);

/// Ceiling for the doubling reconnection delay.
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// The streams the core consumes from the subscriber: decoded envelopes and
/// connection-loss notifications (at most one per disconnect).
pub struct BrokerStreams {
    pub messages: mpsc::UnboundedReceiver<Envelope>,
    pub connection_lost: mpsc::UnboundedReceiver<()>,
}

/// The live half of a bus subscription. Replaced wholesale on reconnect.
struct Active {
    connection: Connection,
    channel: lapin::Channel,
    queue: String,
}

struct Inner {
    url: String,
    exchange: String,
    active: Mutex<Option<Active>>,
    messages: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    connection_lost: Mutex<Option<mpsc::UnboundedSender<()>>>,
    reconnecting: AtomicBool,
    closed: AtomicBool,
}

/// A durable subscription to a fan-out exchange.
///
/// The subscriber owns the bus connection, a durable fan-out exchange, an
/// anonymous exclusive auto-delete queue bound to it, and a consumer. Every
/// `application/json` delivery that decodes as an [`Envelope`] is pushed to
/// the `messages` stream; everything else is dropped with a warning.
///
/// Connection loss is detected by [`Broker::ping`], which emits one value on
/// the `connection_lost` stream per disconnect and keeps retrying the whole
/// setup in the background until the bus is back.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    /// Connects to the bus and declares the exchange, queue, and binding.
    pub async fn open(url: &str, exchange: &str) -> Result<(Broker, BrokerStreams)> {
        let active = open_bus(url, exchange).await?;

        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();

        let broker = Broker {
            inner: Arc::new(Inner {
                url: url.to_string(),
                exchange: exchange.to_string(),
                active: Mutex::new(Some(active)),
                messages: Mutex::new(Some(messages_tx)),
                connection_lost: Mutex::new(Some(lost_tx)),
                reconnecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        };

        let streams = BrokerStreams {
            messages: messages_rx,
            connection_lost: lost_rx,
        };

        Ok((broker, streams))
    }

    /// Begins consumption. Deliveries are decoded and pushed onto the
    /// `messages` stream by a background task until the consumer ends.
    pub async fn start_listen(&self) -> Result<()> {
        let Some(messages) = self.inner.messages.lock().await.clone() else {
            debug!("Bus subscriber is closed; not starting a consumer.");
            return Ok(());
        };

        let consumer = {
            let guard = self.inner.active.lock().await;
            let Some(active) = guard.as_ref() else {
                debug!("Bus connection is down; not starting a consumer.");
                return Ok(());
            };

            // Auto-acknowledge: losing an in-flight delivery is fine, only
            // the most recent message per channel matters.
            active
                .channel
                .basic_consume(
                    &active.queue,
                    "",
                    BasicConsumeOptions {
                        no_ack: true,
                        ..BasicConsumeOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?
        };

        tokio::spawn(pump(consumer, messages));

        Ok(())
    }

    /// Returns true iff a fresh side channel can be opened on the existing
    /// connection. A failed ping reports the connection as lost (once per
    /// disconnect) and starts reconnecting in the background; pings keep
    /// returning false until the bus is back.
    pub async fn ping(&self) -> bool {
        if self.inner.closed.load(Ordering::SeqCst)
            || self.inner.reconnecting.load(Ordering::SeqCst)
        {
            return false;
        }

        let probe = {
            let guard = self.inner.active.lock().await;
            let Some(active) = guard.as_ref() else {
                return false;
            };
            active.connection.create_channel().await
        };

        match probe {
            Ok(channel) => {
                let _ = channel.close(200, "ping").await;
                true
            }
            Err(err) => {
                warn!("Bus ping failed: {err}");
                self.connection_lost().await;
                false
            }
        }
    }

    /// Tears down the consumer, queue, and connection, and closes both
    /// streams. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.messages.lock().await.take();
        self.inner.connection_lost.lock().await.take();

        if let Some(active) = self.inner.active.lock().await.take() {
            if let Err(err) = active.connection.close(200, "bye").await {
                warn!("Bus connection close failed: {err}");
            }
        }

        info!("Bus subscriber closed.");
    }

    /// Reports the current disconnect, coalescing concurrent pings: exactly
    /// one signal and one reconnect task per disconnect.
    async fn connection_lost(&self) {
        if self
            .inner
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        error!("Bus connection lost. Reconnecting...");

        if let Some(lost) = self.inner.connection_lost.lock().await.as_ref() {
            let _ = lost.send(());
        }

        let broker = self.clone();
        tokio::spawn(async move { broker.reconnect().await });
    }

    /// Reopens connection, exchange, queue, binding, and consumer, retrying
    /// forever with a doubling backoff.
    async fn reconnect(&self) {
        self.inner.active.lock().await.take();

        let mut backoff = RECONNECT_BACKOFF_MIN;
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return;
            }

            tokio::time::sleep(backoff).await;

            match open_bus(&self.inner.url, &self.inner.exchange).await {
                Ok(active) => {
                    *self.inner.active.lock().await = Some(active);
                    match self.start_listen().await {
                        Ok(()) => {
                            self.inner.reconnecting.store(false, Ordering::SeqCst);
                            info!("Bus connection reestablished.");
                            return;
                        }
                        Err(err) => {
                            warn!("Can't resume bus consumption: {err}");
                            self.inner.active.lock().await.take();
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        "Bus reconnection failed: {err}. Retrying in {}s.",
                        backoff.as_secs()
                    );
                }
            }

            backoff = next_backoff(backoff);
        }
    }
}

/// Dials the bus and sets up the fan-out subscription: durable exchange,
/// server-named exclusive auto-delete queue, empty routing key.
async fn open_bus(url: &str, exchange: &str) -> core::result::Result<Active, lapin::Error> {
    let connection = Connection::connect(url, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;

    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;

    let queue = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_bind(
            queue.name().as_str(),
            exchange,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    Ok(Active {
        connection,
        channel,
        queue: queue.name().as_str().to_string(),
    })
}

/// Drains the consumer, forwarding every decodable envelope. Ends when the
/// consumer stream does (connection closed or lost) or when the message
/// stream has no more readers.
async fn pump(mut consumer: lapin::Consumer, messages: mpsc::UnboundedSender<Envelope>) {
    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(err) => {
                warn!("Bus delivery failed: {err}");
                break;
            }
        };

        debug!("Got new message from broker.");

        let content_type = delivery
            .properties
            .content_type()
            .as_ref()
            .map(|value| value.as_str());

        if let Some(envelope) = decode(content_type, &delivery.data) {
            if messages.send(envelope).is_err() {
                return;
            }
        }
    }

    info!("Bus consumer stopped.");
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(RECONNECT_BACKOFF_MAX)
}
