use thiserror::Error;

use crate::hostnet::error::HostNetError;
use crate::ipam::error::IpamError;

#[derive(Error, Debug)]
pub enum CniError {
    /// `CNI_ARGS` was empty or unparseable; callers treat this as fatal.
    #[error("invalid args")]
    InvalidArgs,

    #[error("invalid net config: {0}")]
    ConfigInvalid(String),

    /// A network info referenced a plugin type the net config does not carry.
    #[error("no delegate config for plugin type {0}")]
    UnknownDelegate(String),

    /// A downstream plugin exited non-zero; carries its stderr.
    #[error("delegate {plugin} failed: {message}")]
    DelegateFailed { plugin: String, message: String },

    /// Errors accumulated while tearing delegates down, joined with ` / `.
    #[error("delegate teardown failed: {0}")]
    TeardownFailed(String),

    #[error("delegate result carries no IPv4 address")]
    MissingIpv4,

    #[error("state file error: {0}")]
    StateIo(#[from] std::io::Error),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Ipam(#[from] IpamError),

    #[error(transparent)]
    HostNetwork(#[from] HostNetError),
}

impl CniError {
    /// CNI protocol error code for the error reply on stderr.
    pub fn error_code(&self) -> u32 {
        match self {
            CniError::InvalidArgs => 4,
            CniError::StateIo(_) => 5,
            CniError::Json(_) => 6,
            CniError::ConfigInvalid(_) | CniError::UnknownDelegate(_) | CniError::MissingIpv4 => 7,
            CniError::DelegateFailed { .. } | CniError::TeardownFailed(_) => 100,
            CniError::Ipam(_) => 101,
            CniError::HostNetwork(_) => 102,
        }
    }
}
