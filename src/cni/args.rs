use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::cni::error::CniError;

pub const K8S_POD_NAME: &str = "K8S_POD_NAME";
pub const K8S_POD_NAMESPACE: &str = "K8S_POD_NAMESPACE";
pub const K8S_POD_INFRA_CONTAINER_ID: &str = "K8S_POD_INFRA_CONTAINER_ID";
pub const K8S_PORTS: &str = "K8S_PORTS";

/// Serializes an argument map into the `K1=V1;K2=V2` form of `CNI_ARGS`.
/// Order is unspecified.
pub fn build_args(map: &HashMap<String, String>) -> String {
    map.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(";")
}

/// Parses a `K1=V1;K2=V2` string. Pairs split on the first `=`; malformed
/// pairs are skipped; keys and values are trimmed. Empty input is an error,
/// which callers treat as fatal.
pub fn parse_args(raw: &str) -> Result<HashMap<String, String>, CniError> {
    if raw.trim().is_empty() {
        return Err(CniError::InvalidArgs);
    }

    let mut map = HashMap::new();
    for pair in raw.split(';') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        map.insert(key.to_string(), value.trim().to_string());
    }
    Ok(map)
}

/// Appends extra `K=V` pairs to an existing `CNI_ARGS` string.
pub fn append_args<'a>(
    base: &str,
    extra: impl IntoIterator<Item = (&'a String, &'a String)>,
) -> String {
    let mut out = base.trim_matches(';').to_string();
    for (k, v) in extra {
        if !out.is_empty() {
            out.push(';');
        }
        out.push_str(k);
        out.push('=');
        out.push_str(v);
    }
    out
}

/// Owner key for the pool: `<namespace>_<name>` when both are present,
/// otherwise the infra container id (early protocol versions only send that).
pub fn pod_key(args: &HashMap<String, String>) -> Option<String> {
    let name = args.get(K8S_POD_NAME).filter(|v| !v.is_empty());
    let namespace = args.get(K8S_POD_NAMESPACE).filter(|v| !v.is_empty());
    match (namespace, name) {
        (Some(ns), Some(name)) => Some(format!("{}_{}", ns, name)),
        _ => args
            .get(K8S_POD_INFRA_CONTAINER_ID)
            .filter(|v| !v.is_empty())
            .cloned(),
    }
}

/// One host-to-container port mapping, as carried in the `K8S_PORTS` arg and
/// persisted per container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(rename = "PodName", default)]
    pub pod_name: String,
    #[serde(rename = "PodIP", default)]
    pub pod_ip: String,
    #[serde(rename = "HostPort")]
    pub host_port: u16,
    #[serde(rename = "ContainerPort")]
    pub container_port: u16,
    #[serde(rename = "Protocol", default)]
    pub protocol: String,
}

/// Decodes the `K8S_PORTS` JSON array from a parsed argument map. A missing
/// or empty arg yields no mappings.
pub fn parse_port_mappings(args: &HashMap<String, String>) -> Result<Vec<PortMapping>, CniError> {
    match args.get(K8S_PORTS) {
        Some(raw) if !raw.is_empty() => Ok(serde_json::from_str(raw)?),
        _ => Ok(Vec::new()),
    }
}
