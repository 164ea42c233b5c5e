use crate::config::MaterializeConfig;
use anyhow::Result;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio::task::JoinHandle;
use tokio_postgres::NoTls;
use tracing::{debug, error};

/// Materialize client over the Postgres wire protocol.
///
/// Carries a small connection pool for checkpoint reads and writes, plus
/// dedicated connections for SUBSCRIBE cursors: a cursor holds a
/// transaction open for its whole lifetime and must never be recycled
/// through the pool.
#[derive(Clone)]
pub struct MaterializeClient {
    pool: Pool,
    config: MaterializeConfig,
}

impl MaterializeClient {
    // TODO: support TLS connections to Materialize
    pub fn new(config: MaterializeConfig) -> Result<Self> {
        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.dbname = Some(config.database.clone());
        cfg.user = Some(config.user.clone());
        cfg.password = Some(config.password.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;
        pool.resize(config.pool_size);

        Ok(Self { pool, config })
    }

    /// Pings the server to verify connectivity
    pub async fn ping(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.execute("SELECT 1", &[]).await?;
        debug!("materialize connection successful");
        Ok(())
    }

    /// Gets a pooled connection
    pub async fn get_connection(&self) -> Result<deadpool_postgres::Client> {
        Ok(self.pool.get().await?)
    }

    /// Opens a dedicated connection outside the pool and spawns its driver
    /// task. The caller owns both halves.
    pub async fn connect_dedicated(&self) -> Result<(tokio_postgres::Client, JoinHandle<()>)> {
        let (client, connection) =
            tokio_postgres::connect(&self.config.connection_string(), NoTls).await?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "materialize connection terminated");
            }
        });
        Ok((client, driver))
    }

    /// Closes the pool. Dedicated connections close with their sessions.
    pub fn close(&self) {
        self.pool.close();
    }
}
