use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::cni::args::PortMapping;
use crate::cni::error::CniError;
use crate::cni::NetworkInfo;

pub const DEFAULT_STATE_DIR: &str = "/var/lib/cni/galaxy";

/// Per-container records under the state directory: network infos at
/// `<dir>/<containerID>`, port mappings at `<dir>/<containerID>.ports`.
/// The suffix keeps the two JSON shapes from aliasing one path.
/// Files are 0600 inside a 0700 directory.
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn default_dir() -> Self {
        Self::new(DEFAULT_STATE_DIR)
    }

    fn record_path(&self, container_id: &str, suffix: &str) -> Result<PathBuf, CniError> {
        if container_id.is_empty()
            || container_id.contains('/')
            || container_id.contains("..")
        {
            return Err(CniError::ConfigInvalid(format!(
                "unusable container id {:?}",
                container_id
            )));
        }
        Ok(self.dir.join(format!("{}{}", container_id, suffix)))
    }

    fn write_record(&self, path: &Path, payload: &[u8]) -> Result<(), CniError> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.dir)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(payload)?;
        Ok(())
    }

    /// Read-then-delete. A missing record is `None`, not an error: DEL may
    /// run for containers that never finished ADD.
    fn consume_record(&self, path: &Path) -> Result<Option<Vec<u8>>, CniError> {
        match fs::read(path) {
            Ok(bytes) => {
                fs::remove_file(path)?;
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CniError::StateIo(e)),
        }
    }

    pub fn save_ports(&self, container_id: &str, ports: &[PortMapping]) -> Result<(), CniError> {
        let path = self.record_path(container_id, ".ports")?;
        self.write_record(&path, &serde_json::to_vec(ports)?)
    }

    pub fn consume_ports(&self, container_id: &str) -> Result<Option<Vec<PortMapping>>, CniError> {
        let path = self.record_path(container_id, ".ports")?;
        match self.consume_record(&path)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save_network_infos(
        &self,
        container_id: &str,
        infos: &[NetworkInfo],
    ) -> Result<(), CniError> {
        let path = self.record_path(container_id, "")?;
        self.write_record(&path, &serde_json::to_vec(infos)?)
    }

    pub fn consume_network_infos(
        &self,
        container_id: &str,
    ) -> Result<Option<Vec<NetworkInfo>>, CniError> {
        let path = self.record_path(container_id, "")?;
        match self.consume_record(&path)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Removes any record left behind for this container; used when an ADD
    /// unwinds after state was written.
    pub fn discard(&self, container_id: &str) -> Result<(), CniError> {
        for suffix in ["", ".ports"] {
            let path = self.record_path(container_id, suffix)?;
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(CniError::StateIo(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn sample_ports() -> Vec<PortMapping> {
        vec![PortMapping {
            pod_name: "demo_app-0".to_string(),
            pod_ip: "10.0.0.5".to_string(),
            host_port: 30080,
            container_port: 80,
            protocol: "tcp".to_string(),
        }]
    }

    #[test]
    fn test_ports_round_trip_and_consume() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());

        store.save_ports("abc123", &sample_ports()).unwrap();

        let path = dir.path().join("abc123.ports");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let ports = store.consume_ports("abc123").unwrap().unwrap();
        assert_eq!(ports, sample_ports());

        // Second consume finds nothing: the record was deleted on read.
        assert!(store.consume_ports("abc123").unwrap().is_none());
    }

    #[test]
    fn test_network_infos_do_not_alias_ports() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());

        let mut info: NetworkInfo = BTreeMap::new();
        let mut args = HashMap::new();
        args.insert("IfName".to_string(), "eth0".to_string());
        info.insert("vlan".to_string(), args);

        store.save_network_infos("abc123", &[info.clone()]).unwrap();
        store.save_ports("abc123", &sample_ports()).unwrap();

        let infos = store.consume_network_infos("abc123").unwrap().unwrap();
        assert_eq!(infos, vec![info]);
        assert!(store.consume_ports("abc123").unwrap().is_some());
    }

    #[test]
    fn test_rejects_traversal_ids() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.save_ports("../escape", &[]).is_err());
        assert!(store.save_ports("", &[]).is_err());
    }
}
