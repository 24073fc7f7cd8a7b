//! calld_transfers service entry point
//!
//! ```text
//! switch websocket ─▶ SwitchEventStream ─┐
//!                                        ├─▶ EventDispatcher ─▶ StateFactory
//! POST /bus/events ──────────────────────┘          ▲
//! HTTP /transfers ─────────▶ TransfersService ──────┘
//! ```

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use calld_transfers::bus::{BusMessage, LocalBus};
use calld_transfers::config::{AppConfig, StoreBackend};
use calld_transfers::switch::SwitchClient;
use calld_transfers::switch::ari::AriClient;
use calld_transfers::switch::events::SwitchEventStream;
use calld_transfers::transfer::api::{self, ApiState};
use calld_transfers::transfer::{
    EventDispatcher, FileKvStore, KvStore, Notifier, StateFactory, StatePersistor, SwitchVarStore,
    TransferLock, TransfersService,
};

const EVENT_QUEUE_SIZE: usize = 1024;
const BUS_CAPACITY: usize = 256;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Get port override from command line (--port argument)
fn get_port_override() -> Option<u16> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            return args[i + 1].parse().ok();
        }
    }
    None
}

/// Outbound milestones stay visible in the service log
fn spawn_milestone_log(mut rx: broadcast::Receiver<BusMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => tracing::info!(
                    name = %message.name,
                    routing_key = %message.routing_key,
                    "Transfer milestone published"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Milestone log fell behind")
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = calld_transfers::logging::init_logging(&app_config);

    tracing::info!("Starting calld_transfers in {} mode", env);

    let switch: Arc<dyn SwitchClient> = Arc::new(
        AriClient::new(&app_config.switch).context("Failed to build switch client")?,
    );

    let store: Arc<dyn KvStore> = match app_config.store.backend {
        StoreBackend::File => Arc::new(
            FileKvStore::open(&app_config.store.path)
                .await
                .with_context(|| format!("Failed to open store {}", app_config.store.path))?,
        ),
        StoreBackend::Switch => Arc::new(SwitchVarStore::new(switch.clone())),
    };
    tracing::info!(backend = ?app_config.store.backend, "Transfer store ready");

    let bus = Arc::new(LocalBus::new(BUS_CAPACITY));
    let _milestone_task = spawn_milestone_log(bus.subscribe());
    let factory = Arc::new(StateFactory::new(
        switch.clone(),
        StatePersistor::new(store),
        Notifier::new(bus),
        Arc::new(TransferLock::new()),
        app_config.transfer.clone(),
    ));
    factory
        .restore_locks()
        .await
        .context("Failed to restore transfer locks")?;
    let service = Arc::new(TransfersService::new(factory.clone()));
    let dispatcher = Arc::new(EventDispatcher::new(factory, service.clone()));

    let (switch_tx, switch_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
    let (bus_tx, bus_rx) = mpsc::channel(EVENT_QUEUE_SIZE);

    let _switch_task = dispatcher.clone().spawn_switch(switch_rx);
    let _bus_task = dispatcher.spawn_bus(bus_rx);
    let _stream_task = SwitchEventStream::new(&app_config.switch).spawn(switch_tx);

    let port = get_port_override().unwrap_or(app_config.api.port);
    let addr = format!("{}:{}", app_config.api.host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!("Transfer API listening on http://{}", addr);

    let app = api::router(Arc::new(ApiState { service, bus_tx }));
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
