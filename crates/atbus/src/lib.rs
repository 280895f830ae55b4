mod connection;
mod endpoint;
mod error;
mod handlers;
mod node;
pub mod protocol;

pub use atbus_channel as channel;
pub use atbus_network as network;
pub use connection::{ConnFlags, ConnId, ConnState, Connection};
pub use endpoint::{Endpoint, EndpointFlags, PingStat, children_range, is_child_of};
pub use error::Error;
pub use node::{Node, NodeConf};
pub use protocol::BusId;
