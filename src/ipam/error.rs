use std::net::Ipv4Addr;
use thiserror::Error;

pub type IpamResult<T> = Result<T, IpamError>;

#[derive(Error, Debug)]
pub enum IpamError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A conditional update matched no row: the row was not in the state the
    /// predicate expected. Retryable at the policy layer.
    #[error("row not in expected state")]
    NotUpdated,

    #[error("no pool row for ip {ip}")]
    IpNotFound { ip: Ipv4Addr },

    /// Allocation for this key kept losing `allocate_op` races past the retry
    /// budget.
    #[error("allocation for key {key} conflicted {attempts} times, giving up")]
    Conflict { key: String, attempts: u32 },

    #[error("no address available (subnet filter: {subnet:?})")]
    PoolExhausted { subnet: Option<String> },

    #[error("invalid subnet {subnet}: {reason}")]
    InvalidSubnet { subnet: String, reason: String },
}
