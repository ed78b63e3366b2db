mod activation;
mod broker;
mod config;
mod logging;
mod server;
mod shutdown;
mod utils;

use std::process;
use std::sync::Arc;

use activation::StaticTenantResolver;
use broker::memory::InMemoryBroker;
use config::AppConfig;
use server::GatewayState;
use shutdown::ShutdownHooks;
use utils::startup_banner::print_startup_banner;

#[tokio::main]
async fn main() {
    print_startup_banner();

    let app_config = load_config_or_exit();
    let log_level = logging::init(&app_config.logging).unwrap_or_else(|error| {
        eprintln!("logging error: {error}");
        process::exit(2);
    });
    let shutdown = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown signal hooks: {error}");
        process::exit(2);
    });

    let broker = InMemoryBroker::new(app_config.broker.partitions).unwrap_or_else(|error| {
        eprintln!("broker initialization error: {error}");
        process::exit(2);
    });
    tracing::info!(
        target: "jobgate::broker",
        partitions = broker.partition_count(),
        "embedded broker started"
    );

    let tenants = StaticTenantResolver::new(
        app_config.multi_tenancy.checks_enabled,
        app_config.multi_tenancy.authorized_tenants.clone(),
    );
    let router = server::build_router(GatewayState {
        broker: Arc::new(broker.clone()),
        tenants: Arc::new(tenants),
        activation: app_config.activation,
    })
    .merge(server::embedded_broker_router(broker));

    let (listener, bound_addr) = server::bind(&app_config.server)
        .await
        .unwrap_or_else(|error| {
            eprintln!("server startup error: {error}");
            process::exit(2);
        });
    tracing::info!(
        target: "jobgate::server",
        bind_address = %bound_addr,
        log_level = ?log_level,
        long_polling_enabled = app_config.activation.long_polling_enabled,
        default_request_timeout_ms = app_config.activation.default_request_timeout_ms,
        multi_tenancy = app_config.multi_tenancy.checks_enabled,
        "{} v{} started HTTP gateway",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    if let Err(error) = server::serve(listener, router, shutdown.wait()).await {
        tracing::error!(target: "jobgate::server", %error, "HTTP server failed");
        process::exit(2);
    }
    tracing::info!(
        target: "jobgate::shutdown",
        "HTTP server stopped and shutdown completed"
    );
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}
