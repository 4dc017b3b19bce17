use crate::key::NodeId;
use thiserror::Error;

/// Error taxonomy surfaced by the core to its callers. Every fallible public
/// operation returns `Result<_, KadError>` instead of panicking or stringly
/// typed errors.
#[derive(Error, Debug, Clone)]
pub enum KadError {
    #[error("request {request_id} ({method}) timed out")]
    Timeout { request_id: u32, method: String },

    #[error("request {request_id} was cancelled")]
    Cancelled { request_id: u32 },

    #[error("peer {addr} refused the connection")]
    TransportRefused { addr: String },

    #[error("malformed message from {addr}: {reason}")]
    MalformedMessage { addr: String, reason: String },

    #[error("signature invalid for request from {node_id:?}")]
    SignatureInvalid { node_id: NodeId },

    #[error("bucket is full and not eligible for split or force-k admission")]
    BucketFull,

    #[error("key {key:?} is hashable but does not match hash(value)")]
    KeyHashMismatch { key: NodeId },

    #[error("UPnP port mapping failed: {reason}")]
    UpnpMappingFailed { reason: String },

    #[error("bootstrap contact list exhausted without a successful join")]
    BootstrapExhausted,

    #[error("rendezvous peer {addr} declared dead after {failures} consecutive failures")]
    RendezvousDead { addr: String, failures: u32 },
}
