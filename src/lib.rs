#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

pub mod config;
pub mod contact;
pub mod crypto;
pub mod error;
pub mod key;
pub mod node;
pub mod persist;
pub mod routing;
pub mod rpc;
pub mod storage;

pub use crate::config::NodeConfig;
pub use crate::error::KadError;
pub use crate::key::NodeId;
pub use crate::node::Node;

/// Width, in bytes, of a `NodeId` and of every storage key: 512 bits.
pub const KEY_LENGTH: usize = 64;
