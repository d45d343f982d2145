use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::ipam::error::{IpamError, IpamResult};

/// One row of the floating IP pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatingIp {
    pub ip: Ipv4Addr,
    pub subnet: String,
    /// Owner of the address; empty string iff the address is free.
    pub key: String,
    pub policy: u16,
    pub attr: String,
    /// Unix microseconds, stamped on every mutation.
    pub updated_at: i64,
}

impl FloatingIp {
    pub fn unallocated(ip: Ipv4Addr, subnet: impl Into<String>) -> Self {
        Self {
            ip,
            subnet: subnet.into(),
            key: String::new(),
            policy: 0,
            attr: String::new(),
            updated_at: now_micros(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.key.is_empty()
    }
}

pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

fn ip_to_db(ip: Ipv4Addr) -> i64 {
    u32::from(ip) as i64
}

fn fip_from_row(row: &SqliteRow) -> FloatingIp {
    let ip: i64 = row.get("ip");
    FloatingIp {
        ip: Ipv4Addr::from(ip as u32),
        subnet: row.get("subnet"),
        key: row.get("key"),
        policy: row.get::<i64, _>("policy") as u16,
        attr: row.get("attr"),
        updated_at: row.get("updated_at"),
    }
}

const SELECT_FIP: &str = "SELECT ip, subnet, key, policy, attr, updated_at FROM ip_pool";

/// Table-scoped operations on the IP pool. Every public method is a single
/// store transaction; concurrent allocators serialize at the row level
/// through the `key = ''` predicate and the rows-affected check.
#[derive(Clone)]
pub struct IpPoolStore {
    pool: SqlitePool,
}

impl IpPoolStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_all(&self) -> IpamResult<Vec<FloatingIp>> {
        let rows = sqlx::query(&format!("{} ORDER BY ip ASC", SELECT_FIP))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(fip_from_row).collect())
    }

    /// Free rows, lowest address first, up to `limit`. The ordering makes
    /// allocation deterministic across replicas.
    pub async fn find_available(&self, limit: u32) -> IpamResult<Vec<FloatingIp>> {
        let rows = sqlx::query(&format!(
            "{} WHERE key = '' ORDER BY ip ASC LIMIT ?",
            SELECT_FIP
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(fip_from_row).collect())
    }

    pub async fn find_available_in_subnet(
        &self,
        subnet: &str,
        limit: u32,
    ) -> IpamResult<Vec<FloatingIp>> {
        let rows = sqlx::query(&format!(
            "{} WHERE key = '' AND subnet = ? ORDER BY ip ASC LIMIT ?",
            SELECT_FIP
        ))
        .bind(subnet)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(fip_from_row).collect())
    }

    /// All rows owned by `key`, most recently updated first. An empty result
    /// is not an error.
    pub async fn find_by_key(&self, key: &str) -> IpamResult<Vec<FloatingIp>> {
        let rows = sqlx::query(&format!(
            "{} WHERE key = ? ORDER BY updated_at DESC",
            SELECT_FIP
        ))
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(fip_from_row).collect())
    }

    /// Rows whose key starts with `prefix`, by literal character comparison
    /// (not glob or LIKE).
    pub async fn find_by_prefix(&self, prefix: &str) -> IpamResult<Vec<FloatingIp>> {
        let rows = sqlx::query(&format!(
            "{} WHERE substr(key, 1, ?) = ? ORDER BY ip ASC",
            SELECT_FIP
        ))
        .bind(prefix.len() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(fip_from_row).collect())
    }

    pub async fn find_by_ip(&self, ip: Ipv4Addr) -> IpamResult<FloatingIp> {
        let row = sqlx::query(&format!("{} WHERE ip = ?", SELECT_FIP))
            .bind(ip_to_db(ip))
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(fip_from_row(&row)),
            None => Err(IpamError::IpNotFound { ip }),
        }
    }

    /// Seeds one row. The subnet is immutable from here on; only key, policy,
    /// attr and updated_at ever change.
    pub async fn create(&self, fip: &FloatingIp) -> IpamResult<()> {
        sqlx::query(
            "INSERT INTO ip_pool (ip, subnet, key, policy, attr, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(ip_to_db(fip.ip))
        .bind(&fip.subnet)
        .bind(&fip.key)
        .bind(fip.policy as i64)
        .bind(&fip.attr)
        .bind(fip.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Claims a free row for `fip.key`. The `key = ''` predicate is what makes
    /// concurrent allocators safe: exactly one UPDATE can flip the sentinel,
    /// everyone else sees zero rows affected.
    pub async fn allocate_op(&self, fip: &FloatingIp) -> IpamResult<()> {
        let result = sqlx::query(
            "UPDATE ip_pool SET key = ?, policy = ?, attr = ?, updated_at = ? WHERE ip = ? AND key = ''",
        )
        .bind(&fip.key)
        .bind(fip.policy as i64)
        .bind(&fip.attr)
        .bind(now_micros())
        .bind(ip_to_db(fip.ip))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(IpamError::NotUpdated);
        }
        Ok(())
    }

    pub async fn allocate_specific(
        &self,
        ip: Ipv4Addr,
        key: &str,
        policy: u16,
        attr: &str,
    ) -> IpamResult<()> {
        let result = sqlx::query(
            "UPDATE ip_pool SET key = ?, policy = ?, attr = ?, updated_at = ? WHERE ip = ? AND key = ''",
        )
        .bind(key)
        .bind(policy as i64)
        .bind(attr)
        .bind(now_micros())
        .bind(ip_to_db(ip))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(IpamError::NotUpdated);
        }
        Ok(())
    }

    /// Frees an address, guarded by the current owner. Policy and attr are
    /// zeroed together with the key.
    pub async fn release_ip(&self, key: &str, ip: Ipv4Addr) -> IpamResult<()> {
        let result = sqlx::query(
            "UPDATE ip_pool SET key = '', policy = 0, attr = '', updated_at = ? WHERE ip = ? AND key = ?",
        )
        .bind(now_micros())
        .bind(ip_to_db(ip))
        .bind(key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(IpamError::NotUpdated);
        }
        Ok(())
    }

    /// Bulk release over the same literal-prefix predicate as
    /// [`find_by_prefix`](Self::find_by_prefix). No rows-affected check:
    /// releasing an already-clean prefix is success.
    pub async fn release_by_prefix(&self, prefix: &str) -> IpamResult<u64> {
        let result = sqlx::query(
            "UPDATE ip_pool SET key = '', policy = 0, attr = '', updated_at = ? WHERE substr(key, 1, ?) = ? AND key != ''",
        )
        .bind(now_micros())
        .bind(prefix.len() as i64)
        .bind(prefix)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Retags the single most-recently-updated row owned by `old_key` in
    /// `subnet` over to `new_key`. Used when a re-created pod should inherit
    /// its predecessor's address; ties break toward the newest binding.
    pub async fn update_one_in_subnet(
        &self,
        old_key: &str,
        new_key: &str,
        subnet: &str,
        policy: u16,
        attr: &str,
    ) -> IpamResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE ip_pool SET key = ?, policy = ?, attr = ?, updated_at = ?
            WHERE ip = (
                SELECT ip FROM ip_pool WHERE key = ? AND subnet = ?
                ORDER BY updated_at DESC LIMIT 1
            )
            "#,
        )
        .bind(new_key)
        .bind(policy as i64)
        .bind(attr)
        .bind(now_micros())
        .bind(old_key)
        .bind(subnet)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(IpamError::NotUpdated);
        }
        Ok(())
    }

    /// Rewrites policy/attr for an existing binding. No rows-affected check:
    /// rewriting identical values reports zero affected rows on some drivers
    /// and is still success.
    pub async fn update_policy(
        &self,
        ip: Ipv4Addr,
        key: &str,
        policy: u16,
        attr: &str,
    ) -> IpamResult<()> {
        sqlx::query(
            "UPDATE ip_pool SET policy = ?, attr = ?, updated_at = ? WHERE ip = ? AND key = ?",
        )
        .bind(policy as i64)
        .bind(attr)
        .bind(now_micros())
        .bind(ip_to_db(ip))
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Unconditional mass rename of every row owned by `old_key`.
    pub async fn update_key(&self, old_key: &str, new_key: &str, attr: &str) -> IpamResult<u64> {
        let result = sqlx::query(
            "UPDATE ip_pool SET key = ?, attr = ?, updated_at = ? WHERE key = ?",
        )
        .bind(new_key)
        .bind(attr)
        .bind(now_micros())
        .bind(old_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn query_by_key_group_by_subnet(&self, key: &str) -> IpamResult<Vec<String>> {
        let rows =
            sqlx::query("SELECT DISTINCT subnet FROM ip_pool WHERE key = ? ORDER BY subnet ASC")
                .bind(key)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(|r| r.get("subnet")).collect())
    }

    /// Substring search on keys. `_` and `%` are SQL LIKE wildcards, so both
    /// are escaped: pod keys embed underscores and must match literally.
    pub async fn get_by_keyword(&self, keyword: &str) -> IpamResult<Vec<FloatingIp>> {
        let escaped = keyword
            .replace('\\', "\\\\")
            .replace('_', "\\_")
            .replace('%', "\\%");
        let rows = sqlx::query(&format!(
            "{} WHERE key LIKE '%' || ? || '%' ESCAPE '\\' ORDER BY ip ASC",
            SELECT_FIP
        ))
        .bind(escaped)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(fip_from_row).collect())
    }

    /// Hard delete; the only operation that destroys rows. The IN list is the
    /// one piece of SQL shaped by data, and it is placeholders only.
    pub async fn delete_unscoped(&self, ips: &[Ipv4Addr]) -> IpamResult<u64> {
        if ips.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ips.len()].join(", ");
        let sql = format!("DELETE FROM ip_pool WHERE ip IN ({})", placeholders);
        let mut query = sqlx::query(&sql);
        for ip in ips {
            query = query.bind(ip_to_db(*ip));
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Best-effort bulk release: every `(ip, key)` pair is released
    /// independently. Pairs whose release predicate missed come back in
    /// `undeleted` with the key the row actually holds right now, so the
    /// caller can retry or report. Only hard store errors propagate.
    pub async fn delete_ips(
        &self,
        wanted: &HashMap<Ipv4Addr, String>,
    ) -> IpamResult<(Vec<Ipv4Addr>, HashMap<Ipv4Addr, String>)> {
        let mut deleted = Vec::new();
        let mut undeleted = HashMap::new();

        for (ip, key) in wanted {
            match self.release_ip(key, *ip).await {
                Ok(()) => deleted.push(*ip),
                Err(IpamError::NotUpdated) => {
                    let current = match self.find_by_ip(*ip).await {
                        Ok(fip) => fip.key,
                        Err(IpamError::IpNotFound { .. }) => String::new(),
                        Err(e) => return Err(e),
                    };
                    tracing::debug!(
                        "release of {} skipped: expected owner {:?}, found {:?}",
                        ip,
                        key,
                        current
                    );
                    undeleted.insert(*ip, current);
                }
                Err(e) => return Err(e),
            }
        }

        Ok((deleted, undeleted))
    }
}
