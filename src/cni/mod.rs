pub mod args;
pub mod delegate;
pub mod error;
pub mod state;

pub use delegate::{DelegateEngine, DelegateRunner, ExecRunner};
pub use error::CniError;
pub use state::StateStore;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// CNI spec version spoken on stdout/stderr.
pub const CNI_VERSION: &str = "0.2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CniCommand {
    Add,
    Del,
}

impl CniCommand {
    pub fn from_env_value(value: &str) -> Result<Self, CniError> {
        match value {
            "ADD" => Ok(CniCommand::Add),
            "DEL" => Ok(CniCommand::Del),
            other => Err(CniError::ConfigInvalid(format!(
                "unsupported CNI_COMMAND {:?}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CniCommand::Add => "ADD",
            CniCommand::Del => "DEL",
        }
    }
}

/// The per-invocation envelope the container runtime hands us through the
/// environment.
#[derive(Debug, Clone)]
pub struct CniEnvelope {
    pub command: CniCommand,
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub args: String,
    /// `CNI_PATH`: colon-separated search path for delegate binaries.
    pub path: String,
}

impl CniEnvelope {
    pub fn from_env() -> Result<Self, CniError> {
        let var = |name: &str| std::env::var(name).unwrap_or_default();
        let command = std::env::var("CNI_COMMAND")
            .map_err(|_| CniError::ConfigInvalid("CNI_COMMAND not set".to_string()))?;

        Ok(Self {
            command: CniCommand::from_env_value(&command)?,
            container_id: var("CNI_CONTAINERID"),
            netns: var("CNI_NETNS"),
            ifname: var("CNI_IFNAME"),
            args: var("CNI_ARGS"),
            path: var("CNI_PATH"),
        })
    }
}

/// Net config read from stdin. `networkType` maps each delegate plugin type
/// to its own nested config blob, passed through verbatim (plus the injected
/// `cniVersion`/`name`/`type`) when that delegate runs.
#[derive(Debug, Clone, Deserialize)]
pub struct NetConf {
    #[serde(default, rename = "cniVersion")]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    #[serde(default, rename = "networkType")]
    pub network_type: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub network_uri: String,

    /// SQLite file backing the floating IP pool.
    #[serde(default)]
    pub database: Option<String>,
    /// Directory for per-container port/network-info records.
    #[serde(default, rename = "stateDir")]
    pub state_dir: Option<String>,
    /// Uplink NIC whose addresses migrate onto the default bridge.
    #[serde(default)]
    pub device: Option<String>,
    /// Restrict allocation to one subnet of the pool.
    #[serde(default)]
    pub subnet: Option<String>,
    /// Default VLAN id for pods that do not carry a `VlanID` arg.
    #[serde(default)]
    pub vlan: u16,
    /// Release policy stored with new bindings (0 releases on DEL).
    #[serde(default)]
    pub policy: u16,
}

impl NetConf {
    pub fn parse(bytes: &[u8]) -> Result<Self, CniError> {
        let conf: NetConf = serde_json::from_slice(bytes)
            .map_err(|e| CniError::ConfigInvalid(format!("net config: {}", e)))?;
        Ok(conf)
    }

    pub fn cni_version(&self) -> &str {
        if self.cni_version.is_empty() {
            CNI_VERSION
        } else {
            &self.cni_version
        }
    }
}

/// Per-interface argument map handed to each delegate, keyed by plugin type.
/// `BTreeMap` keeps invocation order stable within one network info.
pub type NetworkInfo = BTreeMap<String, HashMap<String, String>>;

/// Argument key naming the interface a delegate should configure.
pub const IFNAME_ARG: &str = "IfName";
/// Argument key carrying a per-pod VLAN override.
pub const VLAN_ARG: &str = "VlanID";

/// CNI result, spec v0.2.0 shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CniNetResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip4: Option<IpConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpConfig {
    /// Address in CIDR notation.
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<CniRoute>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CniRoute {
    pub dst: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

/// Error reply emitted on stderr with a non-zero exit, per the CNI protocol.
#[derive(Debug, Serialize)]
pub struct CniErrorReply {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
}

impl CniErrorReply {
    pub fn from_error(err: &CniError) -> Self {
        Self {
            cni_version: CNI_VERSION.to_string(),
            code: err.error_code(),
            msg: err.to_string(),
        }
    }
}
