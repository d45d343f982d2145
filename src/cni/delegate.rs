use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::cni::args::{self, PortMapping};
use crate::cni::error::CniError;
use crate::cni::state::StateStore;
use crate::cni::{CniEnvelope, CniNetResult, NetConf, NetworkInfo, IFNAME_ARG};
use crate::hostnet::bridge::DEFAULT_BRIDGE;

/// Environment handed to one delegate invocation.
#[derive(Debug)]
pub struct DelegateEnv<'a> {
    pub container_id: &'a str,
    pub netns: &'a str,
    pub ifname: &'a str,
    /// Fully merged `CNI_ARGS` for this delegate.
    pub args: String,
    pub path: &'a str,
}

/// Seam for invoking downstream plugin binaries. The real runner executes
/// them as external processes per the CNI contract; tests record calls.
pub trait DelegateRunner {
    fn invoke(
        &self,
        plugin_type: &str,
        command: &str,
        env: &DelegateEnv,
        net_conf: &[u8],
    ) -> Result<Vec<u8>, CniError>;
}

/// Resolves the delegate binary through `CNI_PATH` and runs it with the
/// plugin config on stdin. A started plugin always runs to completion; the
/// runtime owns any timeout.
pub struct ExecRunner;

impl ExecRunner {
    fn find_binary(plugin_type: &str, search_path: &str) -> Option<std::path::PathBuf> {
        search_path
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(|dir| Path::new(dir).join(plugin_type))
            .find(|candidate| candidate.is_file())
    }
}

impl DelegateRunner for ExecRunner {
    fn invoke(
        &self,
        plugin_type: &str,
        command: &str,
        env: &DelegateEnv,
        net_conf: &[u8],
    ) -> Result<Vec<u8>, CniError> {
        let binary = Self::find_binary(plugin_type, env.path).ok_or_else(|| {
            CniError::DelegateFailed {
                plugin: plugin_type.to_string(),
                message: format!("binary not found in CNI_PATH {:?}", env.path),
            }
        })?;

        tracing::debug!("invoking {} {} for {}", binary.display(), command, env.container_id);

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", env.container_id)
            .env("CNI_NETNS", env.netns)
            .env("CNI_IFNAME", env.ifname)
            .env("CNI_ARGS", &env.args)
            .env("CNI_PATH", env.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        child
            .stdin
            .take()
            .ok_or_else(|| CniError::DelegateFailed {
                plugin: plugin_type.to_string(),
                message: "stdin unavailable".to_string(),
            })?
            .write_all(net_conf)?;

        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            return Err(CniError::DelegateFailed {
                plugin: plugin_type.to_string(),
                message: if stderr.is_empty() { stdout } else { stderr },
            });
        }

        Ok(output.stdout)
    }
}

/// Ordered delegate invocation with all-or-nothing semantics: if the k-th
/// ADD fails, every prior index is torn down in reverse before the original
/// error surfaces.
pub struct DelegateEngine<R: DelegateRunner> {
    runner: R,
    state: StateStore,
}

impl<R: DelegateRunner> DelegateEngine<R> {
    pub fn new(runner: R, state: StateStore) -> Self {
        Self { runner, state }
    }

    /// Runs the ADD protocol over `infos`, in order. `extra_args` (the
    /// reserved floating IP and friends) is appended to every delegate's
    /// `CNI_ARGS` before the per-interface args.
    pub fn add(
        &self,
        env: &CniEnvelope,
        conf: &NetConf,
        infos: &[NetworkInfo],
        extra_args: &HashMap<String, String>,
    ) -> Result<CniNetResult, CniError> {
        let base_args = args::append_args(&env.args, extra_args);
        let mut last: Option<(String, Vec<u8>)> = None;

        for (idx, info) in infos.iter().enumerate() {
            for (plugin_type, info_args) in info {
                let outcome = self.add_one(env, conf, plugin_type, &base_args, info_args);
                match outcome {
                    Ok(stdout) => last = Some((plugin_type.clone(), stdout)),
                    Err(e) => {
                        tracing::warn!(
                            "ADD failed at delegate {} (index {}): {}, unwinding",
                            plugin_type,
                            idx,
                            e
                        );
                        self.unwind(env, conf, infos, idx, extra_args);
                        return Err(e);
                    }
                }
            }
        }

        let (plugin_type, stdout) = last.ok_or_else(|| {
            CniError::ConfigInvalid("net config names no delegate plugins".to_string())
        })?;
        let result: CniNetResult = serde_json::from_slice(&stdout).map_err(|e| {
            CniError::ConfigInvalid(format!("delegate {} result: {}", plugin_type, e))
        })?;

        let Some(ip4) = result.ip4.as_ref() else {
            self.unwind(env, conf, infos, infos.len(), extra_args);
            return Err(CniError::MissingIpv4);
        };

        if let Err(e) = self.persist(env, ip4.ip.as_str(), infos) {
            self.unwind(env, conf, infos, infos.len(), extra_args);
            let _ = self.state.discard(&env.container_id);
            return Err(e);
        }

        Ok(result)
    }

    fn add_one(
        &self,
        env: &CniEnvelope,
        conf: &NetConf,
        plugin_type: &str,
        base_args: &str,
        info_args: &HashMap<String, String>,
    ) -> Result<Vec<u8>, CniError> {
        let payload = delegate_conf(conf, plugin_type)?;
        let delegate_env = DelegateEnv {
            container_id: &env.container_id,
            netns: &env.netns,
            ifname: info_args
                .get(IFNAME_ARG)
                .map(String::as_str)
                .unwrap_or(&env.ifname),
            args: args::append_args(base_args, info_args),
            path: &env.path,
        };
        self.runner.invoke(plugin_type, "ADD", &delegate_env, &payload)
    }

    /// Rollback for a failed ADD: the DEL protocol over indices `0..failed`,
    /// in reverse. Teardown errors are logged, never propagated; the caller
    /// reports the original failure.
    fn unwind(
        &self,
        env: &CniEnvelope,
        conf: &NetConf,
        infos: &[NetworkInfo],
        failed: usize,
        extra_args: &HashMap<String, String>,
    ) {
        if failed == 0 {
            return;
        }
        for err in self.del_range(env, conf, &infos[..failed], extra_args) {
            tracing::warn!("rollback: {}", err);
        }
    }

    /// Persists port mappings and network infos keyed by container id. The
    /// delegate result supplies the pod IP for the port records.
    fn persist(
        &self,
        env: &CniEnvelope,
        result_ip: &str,
        infos: &[NetworkInfo],
    ) -> Result<(), CniError> {
        let parsed = args::parse_args(&env.args).unwrap_or_default();
        let mut ports = args::parse_port_mappings(&parsed)?;
        let pod_ip = result_ip.split('/').next().unwrap_or(result_ip);
        let pod_name = parsed.get(args::K8S_POD_NAME).cloned().unwrap_or_default();
        for port in &mut ports {
            if port.pod_ip.is_empty() {
                port.pod_ip = pod_ip.to_string();
            }
            if port.pod_name.is_empty() {
                port.pod_name = pod_name.clone();
            }
        }

        self.state.save_ports(&env.container_id, &ports)?;
        self.state.save_network_infos(&env.container_id, infos)?;
        Ok(())
    }

    /// The DEL protocol. Errors are accumulated rather than short-circuiting
    /// so every delegate gets its chance to tear down; the join becomes the
    /// final error if anything failed.
    pub fn del(&self, env: &CniEnvelope, conf: &NetConf) -> Result<(), CniError> {
        // Kubernetes deletes twice; an empty netns means there is nothing
        // left to tear down.
        if env.netns.is_empty() {
            return Ok(());
        }

        let infos = match self.state.consume_network_infos(&env.container_id)? {
            Some(infos) => infos,
            None => vec![default_network_info(conf, &env.ifname)],
        };

        let errors = self.del_range(env, conf, &infos, &HashMap::new());

        if let Some(ports) = self.state.consume_ports(&env.container_id)? {
            clean_port_mappings(DEFAULT_BRIDGE, &ports);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CniError::TeardownFailed(errors.join(" / ")))
        }
    }

    fn del_range(
        &self,
        env: &CniEnvelope,
        conf: &NetConf,
        infos: &[NetworkInfo],
        extra_args: &HashMap<String, String>,
    ) -> Vec<String> {
        let base_args = args::append_args(&env.args, extra_args);
        let mut errors = Vec::new();

        for info in infos.iter().rev() {
            for (plugin_type, info_args) in info {
                let payload = match delegate_conf(conf, plugin_type) {
                    Ok(payload) => payload,
                    Err(e) => {
                        errors.push(e.to_string());
                        continue;
                    }
                };
                let delegate_env = DelegateEnv {
                    container_id: &env.container_id,
                    netns: &env.netns,
                    ifname: info_args
                        .get(IFNAME_ARG)
                        .map(String::as_str)
                        .unwrap_or(&env.ifname),
                    args: args::append_args(&base_args, info_args),
                    path: &env.path,
                };
                if let Err(e) = self.runner.invoke(plugin_type, "DEL", &delegate_env, &payload) {
                    errors.push(e.to_string());
                }
            }
        }

        errors
    }
}

/// Builds the config blob one delegate reads on stdin: the nested
/// `networkType` entry with `cniVersion`, `name` and `type` injected.
fn delegate_conf(conf: &NetConf, plugin_type: &str) -> Result<Vec<u8>, CniError> {
    let blob = conf
        .network_type
        .get(plugin_type)
        .ok_or_else(|| CniError::UnknownDelegate(plugin_type.to_string()))?;

    let mut obj = match blob {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        other => {
            return Err(CniError::ConfigInvalid(format!(
                "networkType entry for {} is {}, expected an object",
                plugin_type, other
            )))
        }
    };

    obj.entry("cniVersion")
        .or_insert_with(|| Value::String(conf.cni_version().to_string()));
    if !obj.contains_key("name") {
        let name = if conf.name.is_empty() {
            plugin_type
        } else {
            &conf.name
        };
        obj.insert("name".to_string(), Value::String(name.to_string()));
    }
    obj.insert("type".to_string(), Value::String(plugin_type.to_string()));

    Ok(serde_json::to_vec(&Value::Object(obj))?)
}

/// When no per-pod network infos were persisted or pushed, every configured
/// delegate runs once against the envelope's interface.
pub fn default_network_info(conf: &NetConf, ifname: &str) -> NetworkInfo {
    let mut info = NetworkInfo::new();
    for plugin_type in conf.network_type.keys() {
        let mut plugin_args = HashMap::new();
        plugin_args.insert(IFNAME_ARG.to_string(), ifname.to_string());
        info.insert(plugin_type.clone(), plugin_args);
    }
    info
}

/// Host-side teardown of port mappings released with a container.
pub fn clean_port_mappings(bridge: &str, ports: &[PortMapping]) {
    for port in ports {
        tracing::info!(
            "releasing port mapping {}:{} -> {}:{}/{} via {}",
            port.pod_ip,
            port.container_port,
            port.pod_name,
            port.host_port,
            port.protocol,
            bridge
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cni::CniCommand;
    use std::cell::RefCell;
    use std::collections::{BTreeMap, HashSet};
    use tempfile::TempDir;

    struct RecordingRunner {
        calls: RefCell<Vec<String>>,
        fail_on: HashSet<(String, String)>,
        result: String,
    }

    impl RecordingRunner {
        fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                fail_on: HashSet::new(),
                result: r#"{"ip4":{"ip":"10.0.0.5/24","gateway":"10.0.0.1"}}"#.to_string(),
            }
        }

        fn failing_on(commands: &[(&str, &str)]) -> Self {
            let mut runner = Self::new();
            runner.fail_on = commands
                .iter()
                .map(|(c, p)| (c.to_string(), p.to_string()))
                .collect();
            runner
        }

        fn with_result(result: &str) -> Self {
            let mut runner = Self::new();
            runner.result = result.to_string();
            runner
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl DelegateRunner for RecordingRunner {
        fn invoke(
            &self,
            plugin_type: &str,
            command: &str,
            _env: &DelegateEnv,
            _net_conf: &[u8],
        ) -> Result<Vec<u8>, CniError> {
            self.calls
                .borrow_mut()
                .push(format!("{} {}", command, plugin_type));
            if self
                .fail_on
                .contains(&(command.to_string(), plugin_type.to_string()))
            {
                return Err(CniError::DelegateFailed {
                    plugin: plugin_type.to_string(),
                    message: "injected failure".to_string(),
                });
            }
            Ok(self.result.clone().into_bytes())
        }
    }

    fn envelope(command: CniCommand, netns: &str) -> CniEnvelope {
        CniEnvelope {
            command,
            container_id: "ctn-1".to_string(),
            netns: netns.to_string(),
            ifname: "eth0".to_string(),
            args: "K8S_POD_NAMESPACE=demo;K8S_POD_NAME=app-0".to_string(),
            path: "/opt/cni/bin".to_string(),
        }
    }

    fn three_plugin_conf() -> NetConf {
        NetConf::parse(
            br#"{"type":"galaxy","networkType":{"alpha":{},"beta":{},"gamma":{}}}"#,
        )
        .unwrap()
    }

    fn single_info(plugin_type: &str) -> NetworkInfo {
        let mut info = BTreeMap::new();
        let mut plugin_args = HashMap::new();
        plugin_args.insert(IFNAME_ARG.to_string(), "eth0".to_string());
        info.insert(plugin_type.to_string(), plugin_args);
        info
    }

    fn engine_with(
        runner: RecordingRunner,
    ) -> (TempDir, DelegateEngine<RecordingRunner>) {
        let dir = TempDir::new().unwrap();
        let engine = DelegateEngine::new(runner, StateStore::new(dir.path()));
        (dir, engine)
    }

    #[test]
    fn test_add_invokes_in_order_and_persists() {
        let (dir, engine) = engine_with(RecordingRunner::new());
        let env = envelope(CniCommand::Add, "/proc/42/ns/net");
        let conf = three_plugin_conf();
        let infos = vec![single_info("alpha"), single_info("beta"), single_info("gamma")];

        let result = engine.add(&env, &conf, &infos, &HashMap::new()).unwrap();
        assert_eq!(result.ip4.unwrap().ip, "10.0.0.5/24");
        assert_eq!(
            engine.runner.calls(),
            vec!["ADD alpha", "ADD beta", "ADD gamma"]
        );

        let state = StateStore::new(dir.path());
        assert!(state.consume_network_infos("ctn-1").unwrap().is_some());
        assert!(state.consume_ports("ctn-1").unwrap().is_some());
    }

    #[test]
    fn test_add_rollback_is_reverse_ordered() {
        let (dir, engine) = engine_with(RecordingRunner::failing_on(&[("ADD", "gamma")]));
        let env = envelope(CniCommand::Add, "/proc/42/ns/net");
        let conf = three_plugin_conf();
        let infos = vec![single_info("alpha"), single_info("beta"), single_info("gamma")];

        let err = engine.add(&env, &conf, &infos, &HashMap::new()).unwrap_err();
        assert!(matches!(err, CniError::DelegateFailed { ref plugin, .. } if plugin == "gamma"));

        assert_eq!(
            engine.runner.calls(),
            vec!["ADD alpha", "ADD beta", "ADD gamma", "DEL beta", "DEL alpha"]
        );

        // No per-container state survives a failed ADD.
        let state = StateStore::new(dir.path());
        assert!(state.consume_ports("ctn-1").unwrap().is_none());
        assert!(state.consume_network_infos("ctn-1").unwrap().is_none());
    }

    #[test]
    fn test_add_first_delegate_failure_skips_rollback() {
        let (_dir, engine) = engine_with(RecordingRunner::failing_on(&[("ADD", "alpha")]));
        let env = envelope(CniCommand::Add, "/proc/42/ns/net");
        let conf = three_plugin_conf();
        let infos = vec![single_info("alpha"), single_info("beta")];

        assert!(engine.add(&env, &conf, &infos, &HashMap::new()).is_err());
        assert_eq!(engine.runner.calls(), vec!["ADD alpha"]);
    }

    #[test]
    fn test_add_unknown_delegate_unwinds() {
        let (_dir, engine) = engine_with(RecordingRunner::new());
        let env = envelope(CniCommand::Add, "/proc/42/ns/net");
        let conf = three_plugin_conf();
        let infos = vec![single_info("alpha"), single_info("delta")];

        let err = engine.add(&env, &conf, &infos, &HashMap::new()).unwrap_err();
        assert!(matches!(err, CniError::UnknownDelegate(ref p) if p == "delta"));
        assert_eq!(engine.runner.calls(), vec!["ADD alpha", "DEL alpha"]);
    }

    #[test]
    fn test_add_without_ipv4_result_unwinds_everything() {
        let (_dir, engine) = engine_with(RecordingRunner::with_result("{}"));
        let env = envelope(CniCommand::Add, "/proc/42/ns/net");
        let conf = three_plugin_conf();
        let infos = vec![single_info("alpha"), single_info("beta")];

        let err = engine.add(&env, &conf, &infos, &HashMap::new()).unwrap_err();
        assert!(matches!(err, CniError::MissingIpv4));
        assert_eq!(
            engine.runner.calls(),
            vec!["ADD alpha", "ADD beta", "DEL beta", "DEL alpha"]
        );
    }

    #[test]
    fn test_del_with_empty_netns_is_a_noop() {
        let (_dir, engine) = engine_with(RecordingRunner::new());
        let env = envelope(CniCommand::Del, "");
        let conf = three_plugin_conf();

        engine.del(&env, &conf).unwrap();
        assert!(engine.runner.calls().is_empty());
    }

    #[test]
    fn test_del_replays_saved_infos_in_reverse_and_accumulates() {
        let (dir, engine) = engine_with(RecordingRunner::failing_on(&[
            ("DEL", "alpha"),
            ("DEL", "beta"),
        ]));
        let env = envelope(CniCommand::Del, "/proc/42/ns/net");
        let conf = three_plugin_conf();

        let state = StateStore::new(dir.path());
        state
            .save_network_infos(
                "ctn-1",
                &[single_info("alpha"), single_info("beta"), single_info("gamma")],
            )
            .unwrap();

        let err = engine.del(&env, &conf).unwrap_err();
        assert_eq!(
            engine.runner.calls(),
            vec!["DEL gamma", "DEL beta", "DEL alpha"]
        );
        match err {
            CniError::TeardownFailed(joined) => assert!(joined.contains(" / ")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_del_without_state_falls_back_to_config() {
        let (_dir, engine) = engine_with(RecordingRunner::new());
        let env = envelope(CniCommand::Del, "/proc/42/ns/net");
        let conf = three_plugin_conf();

        engine.del(&env, &conf).unwrap();
        // One default info covering every configured delegate, sorted.
        assert_eq!(
            engine.runner.calls(),
            vec!["DEL alpha", "DEL beta", "DEL gamma"]
        );
    }
}
