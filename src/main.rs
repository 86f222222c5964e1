//! Line-oriented JSON front end.
//!
//! Reads one request object per line on stdin and writes one response object
//! per line on stdout. Logs go to stderr.

use std::sync::Arc;

use data_protection::prelude::*;
use data_protection::PostgresStorage;
use sqlx::postgres::PgPoolOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const MAX_DB_CONNECTIONS: u32 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("data_protection=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ServiceConfig::from_env()?;

    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(MAX_DB_CONNECTIONS)
                .connect(url)
                .await
                .map_err(|e| ProtectionError::Storage(format!("Failed to connect to database: {}", e)))?;
            let storage = PostgresStorage::new(pool);
            storage.migrate().await?;
            info!("using postgres storage");
            serve(Arc::new(storage), &config).await
        }
        None => {
            info!("DATABASE_URL not set, using in-memory storage");
            serve(Arc::new(InMemoryStorage::new()), &config).await
        }
    }
}

async fn serve<S: ProtectionStorage>(storage: Arc<S>, config: &ServiceConfig) -> Result<()> {
    let service = DataProtectionService::new(storage, config)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    let (mut served, mut failed) = (0u64, 0u64);

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => service.handle(request).await,
            Err(e) => {
                error!(error = %e, "malformed request");
                Response::error("bad_request", format!("malformed request: {}", e))
            }
        };

        if response.is_success() {
            served += 1;
        } else {
            failed += 1;
        }

        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    info!(served, failed, "input closed, shutting down");
    Ok(())
}
