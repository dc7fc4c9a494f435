//! Connection supervision for the PostgreSQL pool
//!
//! Pooled connections are verified with a ping before reuse (deadpool's
//! `Verified` recycling). When an operation still hits a connection-lost
//! class of error, the whole pool is discarded and rebuilt, then the
//! operation is retried once. Patching connections one by one is not
//! attempted; a lost connection usually means the server went away and took
//! every other pooled connection with it.

use std::future::Future;

use deadpool_postgres::{
    Client, Config as PoolConfig, ManagerConfig, Pool, RecyclingMethod, Runtime,
};
use tokio::sync::RwLock;
use tokio_postgres::NoTls;
use tracing::{info, warn};

use crate::config::DatabaseConfig;
use crate::error::{ErrorKind, StoreError};

/// Owns the pool and its rebuild policy
pub struct ConnectionSupervisor {
    config: DatabaseConfig,
    pool: RwLock<Pool>,
}

impl ConnectionSupervisor {
    /// Create the supervisor and its initial pool
    pub fn new(config: DatabaseConfig) -> Result<Self, StoreError> {
        let pool = build_pool(&config)?;
        Ok(Self {
            config,
            pool: RwLock::new(pool),
        })
    }

    /// Get a verified client from the current pool
    pub async fn client(&self) -> Result<Client, StoreError> {
        let pool = self.pool.read().await;
        pool.get().await.map_err(|e| StoreError::Pool(e.to_string()))
    }

    /// Discard the current pool and build a fresh one
    pub async fn rebuild(&self) -> Result<(), StoreError> {
        warn!("rebuilding database connection pool");
        let fresh = build_pool(&self.config)?;
        let mut guard = self.pool.write().await;
        guard.close();
        *guard = fresh;
        info!("database connection pool rebuilt");
        Ok(())
    }

    /// Close the pool; used on shutdown
    pub async fn close(&self) {
        self.pool.read().await.close();
    }

    /// Run `op` against a pooled client, rebuilding the pool and retrying
    /// once on a connection-lost class of error
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: Fn(Client) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match self.try_once(&op).await {
            Err(e) if e.kind() == ErrorKind::Network => {
                warn!(error = %e, "store operation lost its connection, retrying on a fresh pool");
                self.rebuild().await?;
                self.try_once(&op).await
            }
            other => other,
        }
    }

    async fn try_once<T, F, Fut>(&self, op: &F) -> Result<T, StoreError>
    where
        F: Fn(Client) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let client = self.client().await?;
        op(client).await
    }
}

/// Build a pool with ping-before-reuse recycling
fn build_pool(config: &DatabaseConfig) -> Result<Pool, StoreError> {
    let mut cfg = PoolConfig::new();
    cfg.url = Some(config.postgres_url.clone());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Verified,
    });
    cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.pool_size));

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| StoreError::Pool(format!("failed to create pool: {e}")))
}
