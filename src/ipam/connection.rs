use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

use crate::ipam::error::IpamResult;

/// Owns the SQLite pool backing the IP pool table.
///
/// WAL mode plus a busy timeout lets several allocator processes on one node
/// share the database file; row-level conditional updates provide the actual
/// mutual exclusion.
pub struct ConnectionManager {
    pool: SqlitePool,
}

impl ConnectionManager {
    pub async fn new(database_path: &str) -> IpamResult<Self> {
        if let Some(parent) = Path::new(database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    sqlx::Error::Io(std::io::Error::new(
                        e.kind(),
                        format!("creating {}: {}", parent.display(), e),
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        tracing::debug!("opened ip pool database at {}", database_path);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
