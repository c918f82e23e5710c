use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use broker::{Broker, BrokerStreams};
use log::{error, info};
use service::{AppState, Config, Logger};
use sse::{EventHooks, EventSource, NoopHooks, Settings};
use storage::Store;
use web::define_routes;

mod hooks;

use hooks::StoreHooks;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::new();
    let _sentry_guard = Logger::init_logger(&config);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    // The last-message cache is optional, but when configured it has to be
    // reachable before we accept any subscribers.
    let store = match config.cache() {
        Some(url) => {
            let store = Store::connect(url, config.ttl)
                .await
                .context("can't connect to cache")?;
            info!("Connected to cache.");
            Some(store)
        }
        None => None,
    };

    let (broker, streams) = Broker::open(&config.broker, &config.appname)
        .await
        .context("can't connect to broker")?;
    info!("Connected to broker.");

    let hooks: Arc<dyn EventHooks> = match &store {
        Some(store) => Arc::new(StoreHooks::new(store.clone())),
        None => Arc::new(NoopHooks),
    };
    let event_source = EventSource::spawn(
        Settings {
            retention: config.retention(),
        },
        hooks,
    );
    info!("Event Source started.");

    let BrokerStreams {
        mut messages,
        mut connection_lost,
    } = streams;

    // Bus → dispatcher bridge. The cache is written for every envelope, not
    // just ones with a live channel, so future joiners can be seeded.
    {
        let event_source = event_source.clone();
        let store = store.clone();
        tokio::spawn(async move {
            while let Some(envelope) = messages.recv().await {
                if let Some(store) = &store {
                    store.set(&envelope.channel, envelope.payload()).await;
                }
                let payload = envelope.payload().to_string();
                event_source.send_message(envelope.channel, payload);
            }
        });
    }

    // A lost bus connection makes every subscriber's state suspect: drain
    // them all and let clients resubscribe once the bus is back.
    {
        let event_source = event_source.clone();
        tokio::spawn(async move {
            while connection_lost.recv().await.is_some() {
                info!("Broker connection lost. Closing channels...");
                event_source.close_all_channels();
            }
        });
    }

    broker
        .start_listen()
        .await
        .context("can't receive messages from broker")?;

    let app_state = AppState::new(
        config.clone(),
        event_source.clone(),
        broker.clone(),
        store.clone(),
    );
    let router = define_routes(app_state);

    let bind = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("can't bind {bind}"))?;
    info!("Server started at {}.", config.bind);

    // Graceful shutdown waits for in-flight responses, and the event
    // streams only end once the dispatcher closes their queues. Shutting
    // the dispatcher down inside the future axum waits on is what bounds
    // the wait: every open stream terminates, then serve returns.
    let shutdown = {
        let event_source = event_source.clone();
        async move {
            shutdown_signal().await;
            info!("Shutting down...");
            event_source.shutdown().await;
        }
    };

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server error")?;

    broker.close().await;
    if let Some(store) = &store {
        store.close();
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Can't listen for the shutdown signal: {err}");
    }
}
