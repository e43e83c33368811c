// Hostbay Infrastructure - SQLite Adapter
// Implements: PersistenceGateway (app metadata, sources, tenants)

mod connection;
mod migration;
mod persistence_gateway;

pub use connection::create_pool;
pub use migration::run_migrations;
pub use persistence_gateway::SqlitePersistenceGateway;

// Note: sqlx::Error conversion is handled by wrapping in helper functions
// due to Rust's orphan rules (cannot implement From<sqlx::Error> for
// AppError here)
