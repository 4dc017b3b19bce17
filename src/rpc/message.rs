use crate::contact::Contact;
use crate::key::NodeId;

/// A serialized `Contact`, used on the wire instead of the live struct so
/// bincode's schema stays stable across `last_seen`'s non-serializable
/// `Instant`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ContactInfo {
    pub node_id: NodeId,
    pub host_ip: String,
    pub host_port: u16,
    pub local_ip: String,
    pub local_port: u16,
    pub rendezvous_ip: String,
    pub rendezvous_port: u16,
}

impl From<&Contact> for ContactInfo {
    fn from(c: &Contact) -> Self {
        ContactInfo {
            node_id: c.node_id,
            host_ip: c.host_ip.clone(),
            host_port: c.host_port,
            local_ip: c.local_ip.clone(),
            local_port: c.local_port,
            rendezvous_ip: c.rendezvous_ip.clone(),
            rendezvous_port: c.rendezvous_port,
        }
    }
}

impl From<&ContactInfo> for Contact {
    fn from(info: &ContactInfo) -> Self {
        Contact {
            node_id: info.node_id,
            host_ip: info.host_ip.clone(),
            host_port: info.host_port,
            local_ip: info.local_ip.clone(),
            local_port: info.local_port,
            rendezvous_ip: info.rendezvous_ip.clone(),
            rendezvous_port: info.rendezvous_port,
            last_seen: std::time::Instant::now(),
            failed_rpc: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum NatType {
    Direct = 1,
    Restricted = 2,
    Symmetric = 3,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PingRequest {
    pub sender_info: ContactInfo,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PingResponse {
    pub result: bool,
    pub node_id: NodeId,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FindRequest {
    pub key: NodeId,
    pub sender_info: ContactInfo,
    /// `true` for FIND_VALUE, `false` for FIND_NODE.
    pub want_value: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FindResponse {
    pub result: bool,
    pub closest_nodes: Vec<ContactInfo>,
    pub values: Vec<Vec<u8>>,
    pub alternative_value_holder: Option<ContactInfo>,
    pub node_id: NodeId,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoreRequest {
    pub key: NodeId,
    pub value: Vec<u8>,
    pub ttl_secs: u64,
    pub publish: bool,
    pub sender_info: ContactInfo,
    pub public_key: Option<Vec<u8>>,
    pub signed_public_key: Option<Vec<u8>>,
    pub signed_request: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoreResponse {
    pub result: bool,
    pub node_id: NodeId,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DownlistRequest {
    pub sender_info: ContactInfo,
    pub downlist: Vec<ContactInfo>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DownlistResponse {
    pub result: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BootstrapRequest {
    pub newcomer_id: NodeId,
    pub newcomer_local_ip: String,
    pub newcomer_local_port: u16,
    /// Filled in by the receiver (the correlator rewrites this from the
    /// observed transport peer address, not by the sender).
    pub newcomer_ext_ip: String,
    pub newcomer_ext_port: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BootstrapResponse {
    pub bootstrap_id: NodeId,
    pub newcomer_ext_ip: String,
    pub newcomer_ext_port: u16,
    pub nat_type: Option<NatType>,
    pub result: bool,
}

/// Carried both by `Method::NatDetection` (newcomer A -> bootstrap B, "please
/// determine my NAT type") and `Method::NatDetectionPing` (B -> a third peer
/// C, relaying one concrete probe). `probe_type` only matters for the
/// relayed form; B ignores it on the top-level request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NatDetectionRequest {
    /// 0 = top-level "determine my NAT type" (A -> B).
    /// 1 = "ping the newcomer directly" (B -> C).
    /// 2 = "rendezvous-ping the newcomer via bootstrap_node" (B -> C).
    pub probe_type: u8,
    pub newcomer: ContactInfo,
    pub bootstrap_node: ContactInfo,
    pub sender_id: NodeId,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NatDetectionResponse {
    pub result: bool,
    /// Populated only in the reply to a top-level (`probe_type == 0`)
    /// request: the NAT type B concluded after running the three-stage test.
    pub nat_type: Option<NatType>,
}

/// The logical RPC method, used both for dispatch and for request-id
/// bookkeeping in the correlator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Ping,
    FindNode,
    FindValue,
    Store,
    Downlist,
    Bootstrap,
    NatDetection,
    NatDetectionPing,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RequestPayload {
    Ping(PingRequest),
    Find(FindRequest),
    Store(StoreRequest),
    Downlist(DownlistRequest),
    Bootstrap(BootstrapRequest),
    NatDetection(NatDetectionRequest),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ResponsePayload {
    Ping(PingResponse),
    Find(FindResponse),
    Store(StoreResponse),
    Downlist(DownlistResponse),
    Bootstrap(BootstrapResponse),
    NatDetection(NatDetectionResponse),
}

/// { rpc_type, message_id, service, method, args } envelope. `service` is
/// reserved for future per-channel service registration; this crate has a
/// single service ("kad").
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Request {
    pub message_id: u32,
    pub service: String,
    pub method: Method,
    pub payload: RequestPayload,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Response {
    pub message_id: u32,
    pub payload: ResponsePayload,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Envelope {
    Request(Request),
    Response(Response),
}
