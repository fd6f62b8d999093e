use std::net::SocketAddr;
use std::process::ExitCode;

use eshop_gateway::{filters, AppState, GatewayConfig};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eshop_gateway=info,warp=info".into()),
        )
        .init();

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(origins = ?config.allowed_origins, "allowed origins");
    for route in config.routes.iter() {
        tracing::info!(prefix = %route.prefix, upstream = %route.upstream, service = route.service, "route");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = match AppState::new(config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialise gateway");
            return ExitCode::FAILURE;
        }
    };

    let routes = filters::serve_routes(state);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };

    match warp::serve(routes).try_bind_with_graceful_shutdown(addr, shutdown) {
        Ok((bound, server)) => {
            tracing::info!("API Gateway running on port {}", bound.port());
            server.await;
            tracing::info!("API Gateway stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, %addr, "failed to bind listener");
            ExitCode::FAILURE
        }
    }
}
