//! Connection pool management.
//!
//! One helper serves both SeaORM pools the bridge opens: the read-only
//! clinic database and the local SQLite retry-queue store. Connection
//! attempts are retried a few times with doubling delays before giving up.

use std::time::Duration;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};
use tokio::time::sleep;
use tracing::warn;

/// Pool sizing and acquire behavior.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

const CONNECT_ATTEMPTS: u32 = 3;

/// Open a pool, retrying transient connect failures with doubling backoff.
pub async fn init_pool(url: &str, settings: &PoolSettings) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(url);
    opt.max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(Duration::from_secs(600))
        .sqlx_logging(false);

    let mut delay = Duration::from_millis(250);
    let mut attempt = 1;
    loop {
        match Database::connect(opt.clone()).await {
            Ok(conn) => return Ok(conn),
            Err(err) if attempt < CONNECT_ATTEMPTS => {
                warn!(
                    attempt,
                    error = %err,
                    "database connection failed, retrying in {:?}",
                    delay
                );
                sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Liveness probe: a bare `SELECT 1` through the pool.
pub async fn health_check(db: &DatabaseConnection) -> Result<(), DbErr> {
    let stmt = Statement::from_string(db.get_database_backend(), "SELECT 1".to_string());
    db.query_one(stmt).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_check_passes_on_memory_db() {
        let db = init_pool("sqlite::memory:", &PoolSettings::default())
            .await
            .expect("open in-memory db");
        health_check(&db).await.expect("healthy");
    }
}
