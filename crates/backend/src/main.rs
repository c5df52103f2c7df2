use backend::shared::{config, data::db};
use backend::system;
use backend::system::sys_numbering::{SequenceService, SqliteRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use axum::http::Method;
    use axum::middleware;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tower_http::cors::{Any, CorsLayer};

    system::tracing::initialize()?;

    let cfg = config::load_config()?;
    let db_path = config::get_database_path(&cfg)?;
    db::initialize_database(&db_path)
        .await
        .map_err(|e| anyhow::anyhow!("db init failed: {e}"))?;

    let registry = Arc::new(SqliteRegistry::new(db::get_connection()?.clone()));
    let numbering = Arc::new(SequenceService::new(registry, cfg.numbering.clone()));
    tracing::info!(
        "Numbering service ready: retry_ceiling={}, auto_initialize={}, utc_offset_hours={}",
        cfg.numbering.retry_ceiling,
        cfg.numbering.auto_initialize,
        cfg.numbering.utc_offset_hours
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    let app = system::api::routes::configure_system_routes(numbering)
        .layer(middleware::from_fn(
            system::middleware::request_logger::request_logger,
        ))
        .layer(cors);

    let port = cfg.server.port;
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    tracing::info!("Attempting to bind server to http://{}", addr);
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => {
            tracing::info!("Server successfully bound to {}", addr);
            listener
        }
        Err(e) => {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                tracing::error!(
                    "Error: Port {} is already in use. Please ensure no other process is using this port.",
                    port
                );
            } else {
                tracing::error!("Failed to bind to port {}. Error: {}", port, e);
            }
            return Err(e.into());
        }
    };

    axum::serve(listener, app).await?;

    Ok(())
}
