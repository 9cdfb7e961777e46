use serde::{Deserialize, Serialize};

/// PostgreSQL configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_pool_size: usize,
    pub migrations_dir: String,
    pub goose_binary_path: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "nestling".to_string(),
            username: "nestling".to_string(),
            password: "nestling".to_string(),
            max_pool_size: 10,
            migrations_dir: "migrations/postgres".to_string(),
            goose_binary_path: "goose".to_string(),
        }
    }
}
