pub mod allocator;
pub mod connection;
pub mod error;
pub mod schema;
pub mod store;

pub use allocator::{Allocation, AllocationRequest, FloatingIpAllocator};
pub use connection::ConnectionManager;
pub use error::{IpamError, IpamResult};
pub use store::{FloatingIp, IpPoolStore};
