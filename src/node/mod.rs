pub mod admission;
pub mod bootstrap;
pub mod handlers;
pub mod lookup;
pub mod store_value;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::NodeConfig;
use crate::contact::Contact;
use crate::crypto::{Signer, Verifier};
use crate::error::KadError;
use crate::key::NodeId;
use crate::persist::BootstrapFile;
use crate::routing::{RoutingTable, TableAddOutcome};
use crate::rpc::correlator::RpcOutcome;
use crate::rpc::message::{
    ContactInfo, Envelope, Method, NatType, PingRequest, PingResponse, Request, RequestPayload, Response,
    ResponsePayload,
};
use crate::rpc::{RpcCorrelator, TcpTransport, Transport};
use crate::storage::{AlternativeStore, DataStore};

use self::admission::AdmissionQueue;

/// How often the background loops wake up to check what's due; the actual
/// cadence of any individual piece of work is governed by its own interval
/// in `NodeConfig`.
const BUCKET_REFRESH_POLL: Duration = Duration::from_secs(30);
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// A running Kademlia node. Cloning a `Node` is cheap and shares all state:
/// every field is an `Arc`, mirroring the way background threads and RPC
/// handlers need to reach the same routing table, store, and correlator
/// concurrently without passing references across thread boundaries.
#[derive(Clone)]
pub struct Node {
    id: NodeId,
    config: NodeConfig,
    self_contact: Arc<Mutex<Contact>>,
    routing_table: Arc<Mutex<RoutingTable>>,
    store: Arc<Mutex<DataStore>>,
    correlator: Arc<RpcCorrelator>,
    transport: Arc<dyn Transport>,
    bootstrap_file: Arc<BootstrapFile>,
    alt_store: Option<Arc<dyn AlternativeStore>>,
    signer: Option<Arc<dyn Signer>>,
    verifier: Option<Arc<dyn Verifier>>,
    nat_type: Arc<Mutex<Option<NatType>>>,
    rendezvous: Arc<Mutex<Option<Contact>>>,
    online: Arc<AtomicBool>,
    left: Arc<AtomicBool>,
    admission: Arc<AdmissionQueue>,
}

impl Node {
    /// Binds a `TcpTransport` on `bind_addr` and constructs a `Node` around
    /// it. Does not join the network; call `join()` afterwards.
    pub fn new(
        bind_addr: &str,
        config: NodeConfig,
        bootstrap_path: impl Into<std::path::PathBuf>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = std::sync::mpsc::channel();
        let transport = TcpTransport::new(bind_addr, tx)?;
        Ok(Self::with_transport(transport, rx, config, bootstrap_path))
    }

    /// Constructs a `Node` around a caller-supplied `Transport`, wiring up
    /// the incoming-message dispatch loop, the admission worker, and the
    /// housekeeping background threads. Exposed directly (rather than only
    /// through `new`) so tests and alternative deployments can plug in a
    /// transport that isn't real TCP.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        incoming: std::sync::mpsc::Receiver<(Envelope, SocketAddr)>,
        config: NodeConfig,
        bootstrap_path: impl Into<std::path::PathBuf>,
    ) -> Self {
        let id = NodeId::rand();
        let addr = transport.local_addr();
        let self_contact = Contact::new(id, addr.ip().to_string(), addr.port());

        let node = Node {
            id,
            routing_table: Arc::new(Mutex::new(RoutingTable::new(id, config.k, config.failed_rpc_tolerance))),
            self_contact: Arc::new(Mutex::new(self_contact)),
            store: Arc::new(Mutex::new(DataStore::new())),
            correlator: RpcCorrelator::new(),
            transport,
            bootstrap_file: Arc::new(BootstrapFile::new(bootstrap_path)),
            alt_store: None,
            signer: None,
            verifier: None,
            nat_type: Arc::new(Mutex::new(None)),
            rendezvous: Arc::new(Mutex::new(None)),
            online: Arc::new(AtomicBool::new(false)),
            left: Arc::new(AtomicBool::new(false)),
            admission: AdmissionQueue::new(256),
            config,
        };

        node.start_message_handler(incoming);
        node.start_admission_worker();
        node.start_bucket_refresher();
        node.start_republish_loop();
        node.start_reaper_loop();

        node
    }

    pub fn with_alternative_store(mut self, alt: Arc<dyn AlternativeStore>) -> Self {
        self.alt_store = Some(alt);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn contact_info(&self) -> Contact {
        self.self_contact.lock().unwrap().clone()
    }

    pub fn nat_type(&self) -> Option<NatType> {
        self.nat_type.lock().unwrap().clone()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn routing_table_size(&self) -> usize {
        self.routing_table.lock().unwrap().size()
    }

    pub(crate) fn find_close_nodes_locally(&self, key: &NodeId, count: usize) -> Vec<Contact> {
        self.routing_table.lock().unwrap().find_close_nodes(key, count, &[self.id])
    }

    pub(crate) fn routing_table_remove(&self, node_id: &NodeId) {
        self.routing_table.lock().unwrap().remove_contact(node_id, true);
    }

    pub(crate) fn log_addr(&self) -> String {
        format!("{:?}", self.id)[..16].to_string()
    }

    /// Reads a value published under `key` from the local store only; for
    /// a network-wide read use `find_value`.
    pub fn load_local(&self, key: &NodeId) -> Vec<Vec<u8>> {
        self.store.lock().unwrap().load(key)
    }

    /// Looks `key` up across the network, short-circuiting on the first
    /// peer reporting a value. Returns whatever values that peer returned
    /// (possibly via an alternative-store redirection).
    pub fn find_value(&self, key: NodeId) -> Vec<Vec<u8>> {
        self::lookup::run_lookup(self, key, self::lookup::LookupMethod::FindValue).values
    }

    /// Looks up the K closest known contacts to `key`.
    pub fn find_node(&self, key: NodeId) -> Vec<Contact> {
        self::lookup::run_lookup(self, key, self::lookup::LookupMethod::FindNode).closest
    }

    /// Disseminates `value` under `key` to the K closest peers (§4.7).
    pub fn store_value(&self, key: NodeId, value: Vec<u8>, ttl: Duration) -> Result<self::store_value::StoreOutcome, KadError> {
        self.store_value_with_publish(key, value, ttl, true)
    }

    pub(crate) fn store_value_with_publish(
        &self,
        key: NodeId,
        value: Vec<u8>,
        ttl: Duration,
        publish: bool,
    ) -> Result<self::store_value::StoreOutcome, KadError> {
        self::store_value::disseminate(self, key, value, ttl, publish)
    }

    /// Gracefully leaves the network: cancels in-flight RPCs, persists the
    /// current routing table as a bootstrap snapshot, and clears it. Safe
    /// to call more than once; only the first call has any effect.
    pub fn leave(&self) {
        if self.left.swap(true, Ordering::AcqRel) {
            return;
        }
        self.online.store(false, Ordering::Release);
        self.correlator.cancel_all();
        self.persist_snapshot(None);

        *self.routing_table.lock().unwrap() = RoutingTable::new(self.id, self.config.k, self.config.failed_rpc_tolerance);
        self.admission.shutdown();
        self.correlator.shutdown();
        info!("{}: left the network", self.log_addr());
    }

    fn start_message_handler(&self, incoming: std::sync::mpsc::Receiver<(Envelope, SocketAddr)>) {
        let node = self.clone();
        thread::spawn(move || {
            for (envelope, peer_addr) in incoming.iter() {
                match envelope {
                    Envelope::Request(mut request) => {
                        if request.method == Method::Bootstrap {
                            RpcCorrelator::rewrite_bootstrap_request(&mut request, peer_addr);
                        }
                        node.dispatch_request(request, peer_addr);
                    },
                    Envelope::Response(response) => {
                        node.correlator.handle_response(response);
                    },
                }
            }
            debug!("{}: message handler stopped (transport closed)", node.log_addr());
        });
    }

    /// Runs a request's handler on its own thread so a slow handler (e.g.
    /// the NAT detection three-stage test, which itself issues RPCs) never
    /// stalls delivery of other incoming messages.
    fn dispatch_request(&self, request: Request, peer_addr: SocketAddr) {
        let node = self.clone();
        thread::spawn(move || {
            let message_id = request.message_id;
            let payload = self::handlers::handle_request(&node, &request, peer_addr);
            let response = Response { message_id, payload };
            let envelope = Envelope::Response(response);
            match bincode::serialize(&envelope) {
                Ok(bytes) => {
                    if let Err(e) = node.transport.send(&peer_addr.to_string(), &bytes) {
                        warn!("{}: failed to reply to {}: {}", node.log_addr(), peer_addr, e);
                    }
                },
                Err(e) => error!("{}: failed to serialize response to {}: {}", node.log_addr(), peer_addr, e),
            }
        });
    }

    /// Sends `payload` to `dest` under `method` and blocks on its outcome
    /// (response, timeout, or transport refusal). Addressing goes through
    /// `Contact::send_addr`, so a rendezvous-only contact is reached via its
    /// relay rather than an address this node can't actually dial.
    pub(crate) fn send_request(&self, dest: &Contact, method: Method, payload: RequestPayload) -> Result<RpcOutcome, KadError> {
        let message_id = self.correlator.alloc_id();
        let request = Request {
            message_id,
            service: "kad".to_string(),
            method: method.clone(),
            payload,
        };
        let envelope = Envelope::Request(request);
        let addr = dest.send_addr();

        let bytes = bincode::serialize(&envelope).map_err(|e| KadError::MalformedMessage {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;

        let rx = self.correlator.register(message_id, method, self.config.rpc_timeout);
        if let Err(e) = self.transport.send(&addr, &bytes) {
            self.correlator.forget(message_id);
            return Err(KadError::TransportRefused { addr: format!("{} ({})", addr, e) });
        }

        match rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(KadError::Cancelled { request_id: message_id }),
        }
    }

    pub(crate) fn send_ping(&self, dest: &Contact) -> Result<Duration, KadError> {
        let payload = RequestPayload::Ping(PingRequest {
            sender_info: (&self.contact_info()).into(),
        });
        let outcome = self.send_request(dest, Method::Ping, payload)?;
        match outcome.response.payload {
            ResponsePayload::Ping(PingResponse { result: true, .. }) => Ok(outcome.rtt),
            ResponsePayload::Ping(_) => Err(KadError::MalformedMessage {
                addr: dest.addr(),
                reason: "ping result was false".to_string(),
            }),
            _ => Err(KadError::MalformedMessage {
                addr: dest.addr(),
                reason: "expected a Ping response".to_string(),
            }),
        }
    }

    /// Upserts `contact` into the routing table; a `Rejected` outcome
    /// queues it for the liveness-ping admission worker instead of
    /// discarding it outright (§4.9).
    pub(crate) fn admit_contact(&self, contact: Contact) {
        if contact.node_id == self.id {
            return;
        }
        let outcome = self.routing_table.lock().unwrap().add_contact(contact.clone());
        match outcome {
            TableAddOutcome::Rejected => {
                let bucket_index = self.routing_table.lock().unwrap().bucket_index_for(&contact.node_id);
                self.admission.push(self::admission::AdmissionCandidate { bucket_index, candidate: contact });
            },
            TableAddOutcome::ForceKEvicted(evicted) => {
                debug!("{}: force-k evicted {:?}, admitted {:?}", self.log_addr(), evicted, contact.node_id);
            },
            TableAddOutcome::Inserted | TableAddOutcome::MovedToFront => {},
        }
    }

    fn start_bucket_refresher(&self) {
        let node = self.clone();
        thread::spawn(move || {
            while !node.left.load(Ordering::Acquire) {
                thread::sleep(BUCKET_REFRESH_POLL);
                if !node.online.load(Ordering::Acquire) {
                    continue;
                }
                let stale = {
                    let table = node.routing_table.lock().unwrap();
                    table.get_refresh_list(0, node.config.refresh_interval, false)
                };
                for key in stale {
                    let node = node.clone();
                    thread::spawn(move || {
                        self::lookup::run_lookup(&node, key, self::lookup::LookupMethod::FindNode);
                    });
                }
            }
            debug!("{}: bucket refresher stopped", node.log_addr());
        });
    }

    fn start_reaper_loop(&self) {
        let node = self.clone();
        thread::spawn(move || {
            while !node.left.load(Ordering::Acquire) {
                thread::sleep(REAP_INTERVAL);
                node.store.lock().unwrap().reap_expired();
            }
        });
    }

    /// Keep-alive pings through the rendezvous peer while this node is
    /// restricted-NAT; three consecutive failures (§4.5) declare the
    /// rendezvous dead and trigger a rejoin.
    pub(crate) fn start_rendezvous_pinger(&self) {
        let node = self.clone();
        thread::spawn(move || {
            let mut consecutive_failures = 0u32;
            loop {
                thread::sleep(node.config.rendezvous_ping_interval);
                if node.left.load(Ordering::Acquire) {
                    return;
                }
                let rendezvous = match node.rendezvous.lock().unwrap().clone() {
                    Some(r) => r,
                    None => return,
                };
                match node.send_ping(&rendezvous) {
                    Ok(_) => consecutive_failures = 0,
                    Err(_) => {
                        consecutive_failures += 1;
                        if consecutive_failures >= node.config.rendezvous_death_threshold {
                            warn!(
                                "{}: rendezvous {:?} declared dead after {} failures",
                                node.log_addr(),
                                rendezvous.node_id,
                                consecutive_failures
                            );
                            node.online.store(false, Ordering::Release);
                            *node.rendezvous.lock().unwrap() = None;
                            let node = node.clone();
                            thread::spawn(move || node.rejoin_with_backoff());
                            return;
                        }
                    },
                }
            }
        });
    }

    pub(crate) fn send_downlist(&self, dest: &Contact, dead: &[NodeId]) {
        let downlist: Vec<ContactInfo> = dead
            .iter()
            .filter_map(|id| self.routing_table.lock().unwrap().get_contact(id))
            .map(|c| ContactInfo::from(&c))
            .collect();
        if downlist.is_empty() {
            return;
        }
        let payload = RequestPayload::Downlist(crate::rpc::message::DownlistRequest {
            sender_info: (&self.contact_info()).into(),
            downlist,
        });
        if let Err(e) = self.send_request(dest, Method::Downlist, payload) {
            debug!("{}: downlist to {:?} failed: {}", self.log_addr(), dest.node_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    fn test_node() -> Node {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("kad-core-node-test-{}-{}.kadconfig", std::process::id(), NodeId::rand().to_hex()));
        Node::new("127.0.0.1:0", NodeConfig::default(), path).unwrap()
    }

    #[test]
    fn test_new_node_starts_offline_with_empty_table() {
        let node = test_node();
        assert!(!node.is_online());
        assert_eq!(node.routing_table_size(), 1);
    }

    #[test]
    fn test_ping_between_two_nodes() {
        let a = test_node();
        let b = test_node();
        let rtt = a.send_ping(&b.contact_info());
        assert!(rtt.is_ok());
    }

    #[test]
    fn test_leave_is_idempotent_and_clears_table() {
        let a = test_node();
        let b = test_node();
        a.admit_contact(b.contact_info());
        assert!(a.routing_table.lock().unwrap().get_contact(&b.id).is_some());
        a.leave();
        a.leave();
        assert!(a.routing_table.lock().unwrap().get_contact(&b.id).is_none());
    }
}
