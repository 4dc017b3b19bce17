use std::net::SocketAddr;

use rand::seq::SliceRandom;

use crate::contact::Contact;
use crate::crypto::{decode_signature, is_anonymous_sentinel};
use crate::key::NodeId;
use crate::rpc::message::{
    BootstrapRequest, BootstrapResponse, ContactInfo, DownlistRequest, DownlistResponse, FindRequest, FindResponse,
    Method, NatDetectionRequest, NatDetectionResponse, NatType, PingRequest, PingResponse, Request, RequestPayload,
    ResponsePayload, StoreRequest, StoreResponse,
};

use super::Node;

/// §4.8: dispatches a parsed incoming `Request` to its handler and returns
/// the reply payload. Every handler admits the sender to the routing table
/// on success, per §4.8's closing line.
pub fn handle_request(node: &Node, request: &Request, _peer_addr: SocketAddr) -> ResponsePayload {
    match &request.payload {
        RequestPayload::Ping(p) => ResponsePayload::Ping(handle_ping(node, p)),
        RequestPayload::Find(f) => ResponsePayload::Find(handle_find(node, f)),
        RequestPayload::Store(s) => ResponsePayload::Store(handle_store(node, s)),
        RequestPayload::Downlist(d) => ResponsePayload::Downlist(handle_downlist(node, d)),
        RequestPayload::Bootstrap(b) => ResponsePayload::Bootstrap(handle_bootstrap(node, b)),
        RequestPayload::NatDetection(n) => ResponsePayload::NatDetection(handle_nat_detection(node, n)),
    }
}

fn handle_ping(node: &Node, request: &PingRequest) -> PingResponse {
    let sender = Contact::from(&request.sender_info);
    node.admit_contact(sender);
    PingResponse { result: true, node_id: node.id() }
}

/// FindNode and FindValue share a wire request, distinguished by
/// `want_value`. A value hit (alternative store or local) short-circuits;
/// otherwise this falls through to ordinary FindNode behaviour.
fn handle_find(node: &Node, request: &FindRequest) -> FindResponse {
    let sender = Contact::from(&request.sender_info);
    node.admit_contact(sender.clone());

    if request.want_value {
        if let Some(alt) = &node.alt_store {
            if alt.has(&request.key) {
                return FindResponse {
                    result: true,
                    closest_nodes: Vec::new(),
                    values: Vec::new(),
                    alternative_value_holder: Some(ContactInfo::from(&node.contact_info())),
                    node_id: node.id(),
                };
            }
        }
        let values = node.store.lock().unwrap().load(&request.key);
        if !values.is_empty() {
            return FindResponse {
                result: true,
                closest_nodes: Vec::new(),
                values,
                alternative_value_holder: None,
                node_id: node.id(),
            };
        }
    }

    let k = node.config().k;
    let mut closest = node.routing_table.lock().unwrap().find_close_nodes(&request.key, k, &[node.id(), sender.node_id]);
    if !closest.iter().any(|c| c.node_id == request.key) {
        if let Some(exact) = node.routing_table.lock().unwrap().get_contact(&request.key) {
            closest.push(exact);
        }
    }

    FindResponse {
        result: true,
        closest_nodes: closest.iter().map(ContactInfo::from).collect(),
        values: Vec::new(),
        alternative_value_holder: None,
        node_id: node.id(),
    }
}

fn handle_store(node: &Node, request: &StoreRequest) -> StoreResponse {
    let sender = Contact::from(&request.sender_info);

    let valid = match &request.signed_request {
        None => true,
        Some(sig) if is_anonymous_sentinel(sig) => true,
        Some(sig) => verify_signed_request(node, request, sig),
    };

    if !valid {
        warn!("{}: rejected Store for {:?} from {:?}: signature invalid", node.log_addr(), request.key, sender.node_id);
        node.admit_contact(sender);
        return StoreResponse { result: false, node_id: node.id() };
    }

    node.admit_contact(sender);

    let ttl = std::time::Duration::from_secs(request.ttl_secs);
    let ok = {
        let mut store = node.store.lock().unwrap();
        if request.publish {
            store.store(request.key, request.value.clone(), ttl)
        } else if store.refresh(&request.key, &request.value) {
            true
        } else {
            store.store(request.key, request.value.clone(), ttl)
        }
    };
    StoreResponse { result: ok, node_id: node.id() }
}

fn verify_signed_request(node: &Node, request: &StoreRequest, sig_hex: &str) -> bool {
    let verifier = match &node.verifier {
        Some(v) => v,
        // no verifier wired up: the core mandates no particular PKI, so an
        // unconfigured verifier accepts rather than silently rejecting
        // every signed store.
        None => return true,
    };
    let public_key = match &request.public_key {
        Some(pk) => pk,
        None => return false,
    };
    let signature = match decode_signature(sig_hex) {
        Some(s) => s,
        None => return false,
    };
    verifier.verify(public_key, &request.value, &signature)
}

fn handle_downlist(node: &Node, request: &DownlistRequest) -> DownlistResponse {
    let sender = Contact::from(&request.sender_info);
    node.admit_contact(sender);

    for info in &request.downlist {
        let candidate = Contact::from(info);
        if node.send_ping(&candidate).is_err() {
            node.routing_table.lock().unwrap().remove_contact(&candidate.node_id, true);
        }
    }
    DownlistResponse { result: true }
}

fn handle_bootstrap(node: &Node, request: &BootstrapRequest) -> BootstrapResponse {
    let mut newcomer = Contact::new(request.newcomer_id, request.newcomer_ext_ip.clone(), request.newcomer_ext_port);
    newcomer.local_ip = request.newcomer_local_ip.clone();
    newcomer.local_port = request.newcomer_local_port;
    node.admit_contact(newcomer);

    BootstrapResponse {
        bootstrap_id: node.id(),
        newcomer_ext_ip: request.newcomer_ext_ip.clone(),
        newcomer_ext_port: request.newcomer_ext_port,
        // populated only by the NatDetection exchange that follows Bootstrap.
        nat_type: None,
        result: true,
    }
}

/// Handler side of the three-party NAT test (§4.5). `probe_type` 0 is the
/// top-level "determine my NAT type" ask from the newcomer (A); 1 and 2 are
/// B's relayed sub-probes to a third peer C.
fn handle_nat_detection(node: &Node, request: &NatDetectionRequest) -> NatDetectionResponse {
    match request.probe_type {
        0 => run_three_party_test(node, request),
        1 => {
            let newcomer = Contact::from(&request.newcomer);
            NatDetectionResponse { result: node.send_ping(&newcomer).is_ok(), nat_type: None }
        },
        2 => {
            let mut newcomer = Contact::from(&request.newcomer);
            let bootstrap_node = Contact::from(&request.bootstrap_node);
            newcomer.rendezvous_ip = bootstrap_node.host_ip;
            newcomer.rendezvous_port = bootstrap_node.host_port;
            NatDetectionResponse { result: node.send_ping(&newcomer).is_ok(), nat_type: None }
        },
        _ => NatDetectionResponse { result: false, nat_type: None },
    }
}

fn run_three_party_test(node: &Node, request: &NatDetectionRequest) -> NatDetectionResponse {
    let newcomer = Contact::from(&request.newcomer);

    if node.send_ping(&newcomer).is_ok() {
        return NatDetectionResponse { result: true, nat_type: Some(NatType::Direct) };
    }

    let third = pick_third_party(node, &newcomer.node_id);
    let third = match third {
        Some(c) => c,
        None => return NatDetectionResponse { result: false, nat_type: Some(NatType::Symmetric) },
    };

    let self_info = ContactInfo::from(&node.contact_info());
    let direct_probe = RequestPayload::NatDetection(NatDetectionRequest {
        probe_type: 1,
        newcomer: ContactInfo::from(&newcomer),
        bootstrap_node: self_info.clone(),
        sender_id: node.id(),
    });
    if let Ok(outcome) = node.send_request(&third, Method::NatDetectionPing, direct_probe) {
        if let ResponsePayload::NatDetection(resp) = outcome.response.payload {
            if resp.result {
                return NatDetectionResponse { result: true, nat_type: Some(NatType::Restricted) };
            }
        }
    }

    let rendezvous_probe = RequestPayload::NatDetection(NatDetectionRequest {
        probe_type: 2,
        newcomer: ContactInfo::from(&newcomer),
        bootstrap_node: self_info,
        sender_id: node.id(),
    });
    match node.send_request(&third, Method::NatDetectionPing, rendezvous_probe) {
        Ok(outcome) => match outcome.response.payload {
            ResponsePayload::NatDetection(resp) if resp.result => {
                NatDetectionResponse { result: true, nat_type: Some(NatType::Restricted) }
            },
            _ => NatDetectionResponse { result: false, nat_type: Some(NatType::Symmetric) },
        },
        Err(_) => NatDetectionResponse { result: false, nat_type: Some(NatType::Symmetric) },
    }
}

fn pick_third_party(node: &Node, excluding: &NodeId) -> Option<Contact> {
    let table = node.routing_table.lock().unwrap();
    let mut candidates = table.all_contacts();
    drop(table);
    candidates.retain(|c| &c.node_id != excluding && c.node_id != node.id());
    candidates.choose(&mut rand::thread_rng()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::key::NodeId;

    fn test_node() -> Node {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("kad-core-handlers-test-{}-{}.kadconfig", std::process::id(), NodeId::rand().to_hex()));
        Node::new("127.0.0.1:0", NodeConfig::default(), path).unwrap()
    }

    #[test]
    fn test_handle_ping_admits_sender_and_replies_true() {
        let node = test_node();
        let sender = test_node();
        let request = PingRequest { sender_info: (&sender.contact_info()).into() };
        let response = handle_ping(&node, &request);
        assert!(response.result);
        assert_eq!(response.node_id, node.id());
        assert!(node.routing_table.lock().unwrap().get_contact(&sender.id()).is_some());
    }

    #[test]
    fn test_handle_find_node_falls_through_to_close_nodes_without_a_stored_value() {
        let node = test_node();
        let sender = test_node();
        let other = test_node();
        node.admit_contact(other.contact_info());

        let request = FindRequest { key: NodeId::rand(), sender_info: (&sender.contact_info()).into(), want_value: false };
        let response = handle_find(&node, &request);
        assert!(response.result);
        assert!(response.values.is_empty());
        assert!(response.closest_nodes.iter().any(|c| c.node_id == other.id()));
    }

    #[test]
    fn test_handle_find_value_returns_stored_value_when_present() {
        let node = test_node();
        let sender = test_node();
        let key = NodeId::rand();
        node.store.lock().unwrap().store(key, b"value".to_vec(), std::time::Duration::from_secs(60));

        let request = FindRequest { key, sender_info: (&sender.contact_info()).into(), want_value: true };
        let response = handle_find(&node, &request);
        assert_eq!(response.values, vec![b"value".to_vec()]);
    }

    #[test]
    fn test_handle_store_with_no_signed_request_is_accepted() {
        let node = test_node();
        let sender = test_node();
        let key = NodeId::rand();
        let request = StoreRequest {
            key,
            value: b"value".to_vec(),
            ttl_secs: 60,
            publish: true,
            sender_info: (&sender.contact_info()).into(),
            public_key: None,
            signed_public_key: None,
            signed_request: None,
        };
        let response = handle_store(&node, &request);
        assert!(response.result);
        assert_eq!(node.load_local(&key), vec![b"value".to_vec()]);
    }

    #[test]
    fn test_handle_store_with_unverifiable_signature_is_rejected() {
        let node = test_node().with_verifier(std::sync::Arc::new(RejectAllVerifier));
        let sender = test_node();
        let key = NodeId::rand();
        let request = StoreRequest {
            key,
            value: b"value".to_vec(),
            ttl_secs: 60,
            publish: true,
            sender_info: (&sender.contact_info()).into(),
            public_key: Some(vec![1, 2, 3]),
            signed_public_key: None,
            signed_request: Some("deadbeef".to_string()),
        };
        let response = handle_store(&node, &request);
        assert!(!response.result);
        assert!(node.load_local(&key).is_empty());
    }

    struct RejectAllVerifier;
    impl crate::crypto::Verifier for RejectAllVerifier {
        fn verify(&self, _public_key: &[u8], _message: &[u8], _signature: &[u8]) -> bool {
            false
        }
    }

    #[test]
    fn test_handle_bootstrap_admits_newcomer_and_echoes_its_address() {
        let node = test_node();
        let request = BootstrapRequest {
            newcomer_id: NodeId::rand(),
            newcomer_local_ip: "192.168.1.5".to_string(),
            newcomer_local_port: 9001,
            newcomer_ext_ip: "203.0.113.9".to_string(),
            newcomer_ext_port: 9000,
        };
        let response = handle_bootstrap(&node, &request);
        assert!(response.result);
        assert_eq!(response.newcomer_ext_ip, "203.0.113.9");
        assert_eq!(response.newcomer_ext_port, 9000);
        assert!(node.routing_table.lock().unwrap().get_contact(&request.newcomer_id).is_some());
    }
}
