use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::optout::SqliteOptOutRegistry;
use crate::router::{self, RouterOptions};
use crate::sinks::print::PrintSink;
use crate::sinks::sqlite::SqliteSink;
use crate::sinks::Event;

/// Open (creating if needed) the database behind `url`.
pub async fn connect_sqlite(url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("invalid database url {url}"))?
        .create_if_missing(true);

    // every connection to an in-memory database is a separate database
    let max_connections = if url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}

async fn create_sink(
    config: &Config,
    pool: SqlitePool,
) -> anyhow::Result<Arc<dyn Event + Send + Sync>> {
    if config.print_sink {
        // Print sink keeps nothing, stats will come back empty
        Ok(Arc::new(PrintSink {}))
    } else {
        Ok(Arc::new(SqliteSink::new(pool).await?))
    }
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let pool = connect_sqlite(&config.database_url).await?;
    let registry = Arc::new(SqliteOptOutRegistry::new(pool.clone()).await?);
    let sink = create_sink(&config, pool).await?;

    let app = router::router(
        crate::time::SystemTime {},
        sink,
        registry,
        RouterOptions {
            metrics: config.export_prometheus,
            max_body_bytes: config.max_body_bytes,
            concurrency_limit: config.concurrency_limit,
        },
    );

    tracing::info!("listening on {:?}", listener.local_addr()?);
    tracing::info!(
        "config: print_sink == {:?} ; log_level == {:?}",
        config.print_sink,
        config.log_level
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}
