pub mod bridge;
pub mod error;
pub mod netlink;

pub use bridge::{BridgeProvisioner, DEFAULT_BRIDGE};
pub use error::{HostNetError, HostNetResult};
pub use netlink::{IfAddr, Link, Netlink, RouteEntry, RtNetlink};
