use thiserror::Error;

pub type HostNetResult<T> = Result<T, HostNetError>;

#[derive(Error, Debug)]
pub enum HostNetError {
    #[error("link {0} not found")]
    LinkNotFound(String),

    /// The object being created is already present. Provisioning treats this
    /// as success wherever the end state matches.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Uplink carries no usable IPv4 address and is not enslaved to the
    /// default bridge.
    #[error("no usable IPv4 address on uplink {0}")]
    NoAddress(String),

    #[error("netlink {op}: {source}")]
    Netlink {
        op: &'static str,
        #[source]
        source: rtnetlink::Error,
    },

    #[error("netlink socket: {0}")]
    Socket(#[from] std::io::Error),
}

impl HostNetError {
    pub fn is_exists(&self) -> bool {
        matches!(self, HostNetError::AlreadyExists(_))
    }
}
