pub mod ipv4;
pub mod options;
pub mod packet;
pub mod subnet;
pub mod responder;
pub mod listener;
pub mod server;

pub use ipv4::Ipv4;
pub use packet::DhcpPacket;
pub use responder::{Responder, ResponderFactory};
pub use server::{ConfigHandler, DhcpError, Listen, Server, ServerConfig};
pub use subnet::{Lease, Subnet, SubnetConfig};
