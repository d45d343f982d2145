pub mod cni;
pub mod hostnet;
pub mod ipam;
