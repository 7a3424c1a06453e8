use cafe_payments::application::dispatcher::WebhookDispatcher;
use cafe_payments::application::orchestrator::PaymentOrchestrator;
use cafe_payments::application::registry::GatewayRegistry;
use cafe_payments::config::Settings;
use cafe_payments::domain::ports::{
    NotificationSinkRef, OrderStatusSinkRef, TransactionStoreRef, WebhookEventStoreRef,
};
use cafe_payments::infrastructure::in_memory::{
    InMemoryTransactionStore, InMemoryWebhookEventStore,
};
use cafe_payments::infrastructure::sinks::{HttpCallbackSink, TracingSink};
use cafe_payments::interfaces::http::{AppState, router};
use cafe_payments::telemetry;
use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const RETRY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML). A missing file is ignored.
    #[arg(long, global = true, default_value = "cafe-payments.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the payment API (default).
    Serve(ServeArgs),
    /// Validate configuration and list the enabled gateways.
    CheckConfig,
}

#[derive(Args, Default)]
struct ServeArgs {
    /// Address to listen on, overrides `server.bind`.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(Some(&cli.config)).into_diagnostic()?;
    telemetry::init(&settings.logging);

    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::CheckConfig => check_config(&settings),
        Command::Serve(args) => {
            if let Some(bind) = args.bind {
                settings.server.bind = bind;
            }
            if args.db_path.is_some() {
                settings.storage.db_path = args.db_path;
            }
            serve(settings).await
        }
    }
}

fn check_config(settings: &Settings) -> Result<()> {
    settings.validate().into_diagnostic()?;
    println!("configuration ok");
    for kind in settings.enabled_gateways() {
        println!("enabled gateway: {kind}");
    }
    Ok(())
}

async fn serve(settings: Settings) -> Result<()> {
    settings.validate().into_diagnostic()?;

    let gateways = GatewayRegistry::from_settings(&settings).into_diagnostic()?;
    let (transactions, events) = open_stores(&settings)?;
    let (order_sink, notifications) = build_sinks(&settings)?;

    let orchestrator = Arc::new(
        PaymentOrchestrator::new(gateways, transactions, order_sink, notifications)
            .with_verify_retries(settings.http.verify_retries, RETRY_BACKOFF),
    );
    let dispatcher = Arc::new(WebhookDispatcher::new(orchestrator.clone(), events));
    let app = router(AppState::new(orchestrator, dispatcher));

    let listener = tokio::net::TcpListener::bind(settings.server.bind)
        .await
        .into_diagnostic()?;
    tracing::info!(
        bind = %settings.server.bind,
        gateways = ?settings.enabled_gateways(),
        "payment API listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .into_diagnostic()
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(settings: &Settings) -> Result<(TransactionStoreRef, WebhookEventStoreRef)> {
    use cafe_payments::infrastructure::rocksdb::RocksDBStore;

    if let Some(path) = &settings.storage.db_path {
        let store = RocksDBStore::open(path).into_diagnostic()?;
        tracing::info!(path = %path.display(), "using RocksDB storage");
        return Ok((Arc::new(store.clone()), Arc::new(store)));
    }
    Ok(in_memory_stores())
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(settings: &Settings) -> Result<(TransactionStoreRef, WebhookEventStoreRef)> {
    if let Some(path) = &settings.storage.db_path {
        tracing::warn!(
            path = %path.display(),
            "built without storage-rocksdb, falling back to in-memory storage"
        );
    }
    Ok(in_memory_stores())
}

fn in_memory_stores() -> (TransactionStoreRef, WebhookEventStoreRef) {
    (
        Arc::new(InMemoryTransactionStore::new()),
        Arc::new(InMemoryWebhookEventStore::new()),
    )
}

fn build_sinks(settings: &Settings) -> Result<(OrderStatusSinkRef, NotificationSinkRef)> {
    let timeout = settings.http.timeout();
    let order_sink: OrderStatusSinkRef = match &settings.callbacks.order_status_url {
        Some(url) => Arc::new(HttpCallbackSink::new(url, timeout).into_diagnostic()?),
        None => Arc::new(TracingSink),
    };
    let notifications: NotificationSinkRef = match &settings.callbacks.notification_url {
        Some(url) => Arc::new(HttpCallbackSink::new(url, timeout).into_diagnostic()?),
        None => Arc::new(TracingSink),
    };
    Ok((order_sink, notifications))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
}
