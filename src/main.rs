use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use galaxy::cni::args as cni_args;
use galaxy::cni::delegate::default_network_info;
use galaxy::cni::{
    CniCommand, CniEnvelope, CniError, CniErrorReply, DelegateEngine, ExecRunner, NetConf,
    NetworkInfo, StateStore, VLAN_ARG,
};
use galaxy::hostnet::{BridgeProvisioner, Netlink, RtNetlink};
use galaxy::ipam::schema::SchemaManager;
use galaxy::ipam::{
    Allocation, AllocationRequest, ConnectionManager, FloatingIpAllocator, IpPoolStore, IpamError,
};

const DEFAULT_DATABASE: &str = "/var/lib/cni/galaxy/galaxy.db";

/// Release policy value that frees the binding when the pod goes away; any
/// other value keeps it for the next pod with the same key.
const POLICY_RELEASE_ON_DELETE: u16 = 0;

fn main() {
    // stdout is the CNI result channel; everything else goes to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // setns and friends are thread-scoped in the kernel: the whole request,
    // netlink calls included, stays on this one OS thread.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    match runtime.block_on(run()) {
        Ok(Some(result_json)) => println!("{}", result_json),
        Ok(None) => {}
        Err(e) => {
            let reply = CniErrorReply::from_error(&e);
            match serde_json::to_string(&reply) {
                Ok(body) => eprintln!("{}", body),
                Err(_) => eprintln!("{}", e),
            }
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<Option<String>, CniError> {
    let envelope = CniEnvelope::from_env()?;

    let mut stdin = Vec::new();
    std::io::stdin().read_to_end(&mut stdin)?;
    let conf = NetConf::parse(&stdin)?;

    tracing::info!(
        "{} for container {} (netns {:?})",
        envelope.command.as_str(),
        envelope.container_id,
        envelope.netns
    );

    match envelope.command {
        CniCommand::Add => cmd_add(&envelope, &conf).await.map(Some),
        CniCommand::Del => cmd_del(&envelope, &conf).await.map(|_| None),
    }
}

async fn open_allocator(conf: &NetConf) -> Result<FloatingIpAllocator, CniError> {
    let database = conf
        .database
        .clone()
        .unwrap_or_else(|| DEFAULT_DATABASE.to_string());
    let conn = ConnectionManager::new(&database).await?;
    SchemaManager::new(conn.pool().clone())
        .initialize_schema()
        .await?;
    Ok(FloatingIpAllocator::new(IpPoolStore::new(
        conn.pool().clone(),
    )))
}

fn state_store(conf: &NetConf) -> StateStore {
    match &conf.state_dir {
        Some(dir) => StateStore::new(dir),
        None => StateStore::default_dir(),
    }
}

/// Pod metadata stored in the pool row's attr column.
fn pod_attr(args: &HashMap<String, String>) -> String {
    let name = args.get(cni_args::K8S_POD_NAME).cloned().unwrap_or_default();
    let namespace = args
        .get(cni_args::K8S_POD_NAMESPACE)
        .cloned()
        .unwrap_or_default();
    if name.is_empty() && namespace.is_empty() {
        return String::new();
    }
    serde_json::json!({ "podName": name, "namespace": namespace }).to_string()
}

/// Network infos for this pod: every configured delegate once, with any
/// `VlanID` from `CNI_ARGS` copied into the per-plugin args so it reaches
/// the delegates and the VLAN provisioning below.
fn build_network_infos(
    conf: &NetConf,
    envelope: &CniEnvelope,
    args: &HashMap<String, String>,
) -> Vec<NetworkInfo> {
    let mut info = default_network_info(conf, &envelope.ifname);
    if let Some(vlan) = args.get(VLAN_ARG) {
        for plugin_args in info.values_mut() {
            plugin_args.insert(VLAN_ARG.to_string(), vlan.clone());
        }
    }
    vec![info]
}

/// Per-pod VLAN override from the network infos, else the config default.
fn vlan_for(conf: &NetConf, infos: &[NetworkInfo]) -> u16 {
    infos
        .iter()
        .flat_map(|info| info.values())
        .find_map(|plugin_args| plugin_args.get(VLAN_ARG))
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(conf.vlan)
}

fn prefix_len_of(subnet: &str) -> u8 {
    subnet
        .parse::<ipnetwork::Ipv4Network>()
        .map(|net| net.prefix())
        .unwrap_or(32)
}

async fn cmd_add(envelope: &CniEnvelope, conf: &NetConf) -> Result<String, CniError> {
    let args = cni_args::parse_args(&envelope.args)?;
    let pod_key = cni_args::pod_key(&args).unwrap_or_else(|| envelope.container_id.clone());

    let allocator = open_allocator(conf).await?;
    let allocation = allocator
        .allocate(&AllocationRequest {
            key: pod_key.clone(),
            subnet: conf.subnet.clone(),
            policy: conf.policy,
            attr: pod_attr(&args),
        })
        .await?;

    let infos = build_network_infos(conf, envelope, &args);
    match add_with_allocation(envelope, conf, &allocation, &infos).await {
        Ok(result_json) => Ok(result_json),
        Err(e) => {
            // The binding is useless without the delegate setup; put the
            // address back before surfacing the original error.
            if let Err(release_err) = allocator.release(&pod_key, allocation.ip).await {
                tracing::warn!(
                    "could not release {} after failed ADD: {}",
                    allocation.ip,
                    release_err
                );
            }
            Err(e)
        }
    }
}

async fn add_with_allocation(
    envelope: &CniEnvelope,
    conf: &NetConf,
    allocation: &Allocation,
    infos: &[NetworkInfo],
) -> Result<String, CniError> {
    if let Some(device) = &conf.device {
        let netlink: Arc<dyn Netlink> = Arc::new(RtNetlink::connect()?);
        let provisioner = BridgeProvisioner::new(netlink, device.clone());
        provisioner.setup_bridge().await?;
        provisioner
            .create_vlan_device(vlan_for(conf, infos))
            .await?;
    }

    let mut extra = HashMap::new();
    extra.insert(
        "FLOATING_IP".to_string(),
        format!("{}/{}", allocation.ip, prefix_len_of(&allocation.subnet)),
    );

    let engine = DelegateEngine::new(ExecRunner, state_store(conf));
    let result = engine.add(envelope, conf, infos, &extra)?;
    Ok(serde_json::to_string(&result)?)
}

async fn cmd_del(envelope: &CniEnvelope, conf: &NetConf) -> Result<(), CniError> {
    // Kubernetes is allowed to delete twice; with no netns there is nothing
    // to tear down and nothing was ever set up.
    if envelope.netns.is_empty() {
        tracing::debug!(
            "DEL for {} with empty netns, nothing to do",
            envelope.container_id
        );
        return Ok(());
    }

    let engine = DelegateEngine::new(ExecRunner, state_store(conf));
    let teardown = engine.del(envelope, conf);

    let pod_key = cni_args::parse_args(&envelope.args)
        .ok()
        .and_then(|args| cni_args::pod_key(&args))
        .unwrap_or_else(|| envelope.container_id.clone());

    let allocator = open_allocator(conf).await?;
    if let Some(binding) = allocator.latest_for_key(&pod_key).await? {
        if binding.policy == POLICY_RELEASE_ON_DELETE {
            match allocator.release(&pod_key, binding.ip).await {
                Ok(()) => {}
                Err(IpamError::NotUpdated) => {
                    tracing::debug!("{} already released", binding.ip);
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            tracing::debug!(
                "binding {} -> {} retained for rebind (policy {})",
                pod_key,
                binding.ip,
                binding.policy
            );
        }
    }

    teardown
}
