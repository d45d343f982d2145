use sqlx::SqlitePool;

use crate::ipam::error::IpamResult;

/// Creates the `ip_pool` table and its indexes.
///
/// `ip` holds the IPv4 address as a network-order u32. `key` is the owner
/// sentinel: empty string means the address is free, and every allocation
/// predicate matches on that. `subnet` never changes after seeding.
pub struct SchemaManager {
    pool: SqlitePool,
}

impl SchemaManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> IpamResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ip_pool (
                ip INTEGER PRIMARY KEY,
                subnet TEXT NOT NULL,
                key TEXT NOT NULL DEFAULT '',
                policy INTEGER NOT NULL DEFAULT 0,
                attr TEXT NOT NULL DEFAULT '',
                updated_at INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_ip_pool_key ON ip_pool (key)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ip_pool_subnet_updated ON ip_pool (subnet, updated_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
