use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::mpsc::channel;
use std::thread;
use std::time::Duration;

use igd::PortMappingProtocol;

use crate::contact::Contact;
use crate::error::KadError;
use crate::key::NodeId;
use crate::persist::BootstrapContact;
use crate::rpc::message::{
    BootstrapRequest, BootstrapResponse, ContactInfo, Method, NatDetectionRequest, NatType, RequestPayload,
    ResponsePayload,
};

use super::Node;

const INITIAL_REJOIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_REJOIN_BACKOFF: Duration = Duration::from_secs(60);

impl Node {
    /// §4.5 Join: loads the persisted bootstrap list; with none on disk this
    /// node declares itself the first (and so far only) peer of an empty
    /// network. Otherwise it races a Bootstrap RPC against up to
    /// `max_join_candidates` saved peers, learns its externally visible
    /// address from the first reply, and runs the three-party NAT test
    /// against that peer.
    pub fn join(&self) -> Result<(), KadError> {
        let candidates = self.bootstrap_file.load();
        if candidates.is_empty() {
            info!("{}: no bootstrap contacts on disk, starting an empty network", self.log_addr());
            self.online.store(true, Ordering::Release);
            self.persist_snapshot(None);
            return Ok(());
        }

        let (bootstrap_peer, response) = self.race_bootstrap_rpcs(&candidates)?;
        self.admit_contact(bootstrap_peer.clone());

        let observed = Contact::new(self.id, response.newcomer_ext_ip.clone(), response.newcomer_ext_port);
        let nat_type = self.run_nat_detection(&bootstrap_peer, &observed)?;
        *self.nat_type.lock().unwrap() = Some(nat_type.clone());

        match nat_type {
            NatType::Direct => {
                info!("{}: NAT type Direct via bootstrap {:?}, join complete", self.log_addr(), bootstrap_peer.node_id);
            },
            NatType::Restricted => {
                info!(
                    "{}: NAT type Restricted, rendezvous {:?}, join complete",
                    self.log_addr(),
                    bootstrap_peer.node_id
                );
                *self.rendezvous.lock().unwrap() = Some(bootstrap_peer.clone());
                self.start_rendezvous_pinger();
            },
            NatType::Symmetric => {
                self.attempt_upnp(response.newcomer_ext_port)?;
                info!("{}: NAT type Symmetric, reachable after UPnP mapping", self.log_addr());
            },
        }

        self.online.store(true, Ordering::Release);
        self.persist_snapshot(Some(&bootstrap_peer.node_id));
        Ok(())
    }

    /// Issues Bootstrap RPCs in parallel against up to
    /// `config.max_join_candidates` saved peers and returns the first
    /// successful reply.
    fn race_bootstrap_rpcs(&self, candidates: &[BootstrapContact]) -> Result<(Contact, BootstrapResponse), KadError> {
        let picked: Vec<Contact> = candidates.iter().take(self.config.max_join_candidates).map(Contact::from).collect();
        if picked.is_empty() {
            return Err(KadError::BootstrapExhausted);
        }

        let attempts = picked.len();
        let (tx, rx) = channel();
        let self_contact = self.contact_info();
        for dest in picked {
            let node = self.clone();
            let tx = tx.clone();
            let self_contact = self_contact.clone();
            thread::spawn(move || {
                let payload = RequestPayload::Bootstrap(BootstrapRequest {
                    newcomer_id: node.id,
                    newcomer_local_ip: self_contact.host_ip.clone(),
                    newcomer_local_port: self_contact.host_port,
                    // filled in by the receiving correlator from the
                    // observed transport peer address, not by us.
                    newcomer_ext_ip: String::new(),
                    newcomer_ext_port: 0,
                });
                let result = node
                    .send_request(&dest, Method::Bootstrap, payload)
                    .and_then(|outcome| match outcome.response.payload {
                        ResponsePayload::Bootstrap(resp) => Ok((dest.clone(), resp)),
                        _ => Err(KadError::MalformedMessage {
                            addr: dest.addr(),
                            reason: "expected a Bootstrap response".to_string(),
                        }),
                    });
                let _ = tx.send(result);
            });
        }
        drop(tx);

        for _ in 0..attempts {
            if let Ok(success) = rx.recv().unwrap_or(Err(KadError::BootstrapExhausted)) {
                return Ok(success);
            }
        }
        Err(KadError::BootstrapExhausted)
    }

    /// Sends the top-level NatDetection request (probe_type 0) to
    /// `bootstrap_peer`, who runs the three-stage test described in §4.5.
    fn run_nat_detection(&self, bootstrap_peer: &Contact, observed: &Contact) -> Result<NatType, KadError> {
        let payload = RequestPayload::NatDetection(NatDetectionRequest {
            probe_type: 0,
            newcomer: ContactInfo::from(observed),
            bootstrap_node: ContactInfo::from(bootstrap_peer),
            sender_id: self.id,
        });
        let outcome = self.send_request(bootstrap_peer, Method::NatDetection, payload)?;
        match outcome.response.payload {
            ResponsePayload::NatDetection(resp) => Ok(resp.nat_type.unwrap_or(NatType::Symmetric)),
            _ => Err(KadError::MalformedMessage {
                addr: bootstrap_peer.addr(),
                reason: "expected a NatDetection response".to_string(),
            }),
        }
    }

    /// §4.5 type-3 fallback: attempts a UPnP port mapping for this node's
    /// listening port. `Join` fails if this also fails.
    fn attempt_upnp(&self, external_port: u16) -> Result<(), KadError> {
        let local_addr = match self.transport.local_addr() {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => {
                return Err(KadError::UpnpMappingFailed {
                    reason: "UPnP mapping requires an IPv4 local transport address".to_string(),
                });
            },
        };
        let gateway = igd::search_gateway(Default::default())
            .map_err(|e| KadError::UpnpMappingFailed { reason: e.to_string() })?;
        gateway
            .add_port(PortMappingProtocol::TCP, external_port, local_addr, 0, "kad-core")
            .map_err(|e| KadError::UpnpMappingFailed { reason: e.to_string() })
    }

    /// Repeatedly retries `join()` with exponential backoff (capped at 60s)
    /// until it succeeds or the node has left. Used by the rendezvous-death
    /// recovery path (§4.5) and available to callers driving their own
    /// reconnect policy.
    pub(crate) fn rejoin_with_backoff(&self) {
        let mut backoff = INITIAL_REJOIN_BACKOFF;
        while !self.left.load(Ordering::Acquire) {
            match self.join() {
                Ok(()) => {
                    info!("{}: rejoin succeeded", self.log_addr());
                    return;
                },
                Err(e) => {
                    warn!("{}: rejoin attempt failed ({}), retrying in {:?}", self.log_addr(), e, backoff);
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_REJOIN_BACKOFF);
                },
            }
        }
    }

    /// Writes the current routing table out as a `.kadconfig` snapshot,
    /// writing `primary` (this node's last-used bootstrap contact) first if
    /// given.
    pub(crate) fn persist_snapshot(&self, primary: Option<&NodeId>) {
        let contacts: Vec<BootstrapContact> = {
            let table = self.routing_table.lock().unwrap();
            table.all_contacts().iter().map(BootstrapContact::from).collect()
        };
        if let Err(e) = self.bootstrap_file.save(&contacts, primary) {
            warn!("{}: failed to persist bootstrap snapshot: {}", self.log_addr(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    fn test_node() -> Node {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("kad-core-bootstrap-test-{}-{}.kadconfig", std::process::id(), NodeId::rand().to_hex()));
        Node::new("127.0.0.1:0", NodeConfig::default(), path).unwrap()
    }

    #[test]
    fn test_join_with_empty_bootstrap_list_declares_empty_network() {
        let node = test_node();
        assert!(!node.is_online());
        assert!(node.join().is_ok());
        assert!(node.is_online());
    }

    #[test]
    fn test_join_against_a_live_bootstrap_peer_succeeds() {
        let first = test_node();
        first.join().unwrap();

        let second = test_node();
        second.bootstrap_file.save(
            &[crate::persist::BootstrapContact::from(&first.contact_info())],
            None,
        ).unwrap();

        assert!(second.join().is_ok());
        assert!(second.is_online());
        assert!(second.routing_table.lock().unwrap().get_contact(&first.id()).is_some());
    }
}
