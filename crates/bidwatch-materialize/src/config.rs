use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MaterializeConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,

    /// Pool size for checkpoint reads/writes. SUBSCRIBE sessions use
    /// dedicated connections outside the pool.
    pub pool_size: usize,
}

impl MaterializeConfig {
    /// Creates a connection string from the config
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, self.database, self.user, self.password
        )
    }
}
