use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::time::Instant;

use crate::key::NodeId;

/// A peer known to this node. Two contacts are equal iff their `node_id`s
/// match; re-adding an existing contact updates its address fields and
/// moves it to the MRU end of its bucket (see `KBucket::add_contact`).
#[derive(Clone, Serialize, Deserialize)]
pub struct Contact {
    pub node_id: NodeId,
    pub host_ip: String,
    pub host_port: u16,
    pub local_ip: String,
    pub local_port: u16,
    pub rendezvous_ip: String,
    pub rendezvous_port: u16,
    #[serde(skip, default = "Instant::now")]
    pub last_seen: Instant,
    pub failed_rpc: u32,
}

impl PartialEq for Contact {
    fn eq(&self, other: &Contact) -> bool {
        self.node_id == other.node_id
    }
}
impl Eq for Contact {}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(
            f,
            "{:?}@{}:{}{}",
            self.node_id,
            self.host_ip,
            self.host_port,
            if self.is_direct() {
                String::new()
            } else {
                format!(" (via {}:{})", self.rendezvous_ip, self.rendezvous_port)
            }
        )
    }
}

impl Contact {
    pub fn new(node_id: NodeId, host_ip: impl Into<String>, host_port: u16) -> Self {
        Contact {
            node_id,
            host_ip: host_ip.into(),
            host_port,
            local_ip: String::new(),
            local_port: 0,
            rendezvous_ip: String::new(),
            rendezvous_port: 0,
            last_seen: Instant::now(),
            failed_rpc: 0,
        }
    }

    /// A contact with empty rendezvous fields is directly reachable;
    /// otherwise it must be reached via its rendezvous peer.
    pub fn is_direct(&self) -> bool {
        self.rendezvous_ip.is_empty()
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host_ip, self.host_port)
    }

    /// The address traffic for this contact should actually be sent to:
    /// its own address if directly reachable, otherwise its rendezvous
    /// peer's address.
    pub fn send_addr(&self) -> String {
        if self.is_direct() {
            self.addr()
        } else {
            format!("{}:{}", self.rendezvous_ip, self.rendezvous_port)
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.failed_rpc = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_by_node_id_only() {
        let id = NodeId::rand();
        let a = Contact::new(id, "10.0.0.1", 1000);
        let mut b = Contact::new(id, "10.0.0.2", 2000);
        b.failed_rpc = 4;
        assert_eq!(a, b);
    }

    #[test]
    fn test_is_direct() {
        let mut c = Contact::new(NodeId::rand(), "10.0.0.1", 1000);
        assert!(c.is_direct());
        c.rendezvous_ip = "10.0.0.9".to_string();
        c.rendezvous_port = 9999;
        assert!(!c.is_direct());
    }
}
