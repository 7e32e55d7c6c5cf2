#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "turso")]
pub mod turso;
