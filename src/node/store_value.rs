use std::sync::atomic::Ordering;
use std::sync::mpsc::{channel, Sender};
use std::thread;
use std::time::Duration;

use crate::contact::Contact;
use crate::crypto::{encode_signature, is_anonymous_sentinel, ANONYMOUS_SENTINEL};
use crate::error::KadError;
use crate::key::NodeId;
use crate::rpc::message::{Method, RequestPayload, ResponsePayload, StoreRequest};

use super::Node;

const REPUBLISH_POLL: Duration = Duration::from_secs(2);

/// Result of a `StoreValue` dissemination: how many of the K closest peers
/// (plus this node, if it is among them) accepted the value.
#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub attempted: usize,
    pub succeeded: usize,
}

impl StoreOutcome {
    pub fn is_success(&self, required: usize) -> bool {
        self.succeeded >= required
    }
}

/// §4.7: looks up the K closest nodes to `key` and issues a `Store` RPC to
/// each in parallel, storing locally too when this node is among the
/// closest. Succeeds when at least `min_store_successes` accept.
pub fn disseminate(node: &Node, key: NodeId, value: Vec<u8>, ttl: Duration, publish: bool) -> Result<StoreOutcome, KadError> {
    let mut targets = super::lookup::run_lookup(node, key, super::lookup::LookupMethod::FindNode).closest;
    let k = node.config().k;

    // §4.7 step 2: store locally whenever this node is one of the K closest
    // to `key` — either because the lookup returned fewer than K contacts,
    // or because this node is closer than the current K-th contact, in
    // which case the furthest remote candidate is dropped to keep the
    // target set at K.
    let self_distance_rank = targets.iter().position(|c| c.node_id == node.id());
    if self_distance_rank.is_none() {
        if targets.len() < k {
            targets.push(node.contact_info());
        } else if targets.len() == k {
            let self_distance = node.id().xor(&key);
            let kth_distance = targets[k - 1].node_id.xor(&key);
            if self_distance < kth_distance {
                targets.pop();
                targets.push(node.contact_info());
            }
        }
    }

    let attempted = targets.len();
    if attempted == 0 {
        return Ok(StoreOutcome { attempted: 0, succeeded: 0 });
    }

    let mut succeeded = 0;
    let mut remote: Vec<Contact> = Vec::with_capacity(targets.len());
    for dest in targets {
        if dest.node_id == node.id() {
            store_locally(node, key, value.clone(), ttl);
            succeeded += 1;
        } else {
            remote.push(dest);
        }
    }

    // §4.7 step 3: fan out Store RPCs with concurrency bounded to alpha,
    // topping up the in-flight window as each completes, mirroring the
    // lookup's own alpha-windowed probing.
    let alpha = node.config().alpha.max(1);
    let (tx, rx) = channel();
    let mut next = 0;
    let mut in_flight = 0;
    while next < remote.len() && in_flight < alpha {
        spawn_store_rpc(node, remote[next].clone(), key, value.clone(), ttl, publish, tx.clone());
        next += 1;
        in_flight += 1;
    }
    while in_flight > 0 {
        let ok = rx.recv().unwrap_or(false);
        in_flight -= 1;
        if ok {
            succeeded += 1;
        }
        if next < remote.len() {
            spawn_store_rpc(node, remote[next].clone(), key, value.clone(), ttl, publish, tx.clone());
            next += 1;
            in_flight += 1;
        }
    }

    Ok(StoreOutcome { attempted, succeeded })
}

fn spawn_store_rpc(node: &Node, dest: Contact, key: NodeId, value: Vec<u8>, ttl: Duration, publish: bool, tx: Sender<bool>) {
    let node = node.clone();
    thread::spawn(move || {
        let ok = spawn_store(&node, &dest, key, value, ttl, publish).is_ok();
        let _ = tx.send(ok);
    });
}

/// Applies a `Store` directly to this node's own `DataStore`, bypassing the
/// network. Used both when this node is among the K closest to a key it is
/// disseminating, and by the republish loop below.
fn store_locally(node: &Node, key: NodeId, value: Vec<u8>, ttl: Duration) {
    let mut store = node.store.lock().unwrap();
    if !store.refresh(&key, &value) {
        store.store(key, value, ttl);
    }
}

/// Sends a single `Store` RPC to `dest`. When this node has a configured
/// `Signer`, the request is signed; otherwise it carries the anonymous
/// sentinel, which every handler accepts unconditionally.
fn spawn_store(node: &Node, dest: &Contact, key: NodeId, value: Vec<u8>, ttl: Duration, publish: bool) -> Result<(), KadError> {
    let (public_key, signed_request) = match &node.signer {
        Some(signer) => {
            let signature = signer.sign(&value);
            (Some(signer.public_key()), Some(encode_signature(&signature)))
        },
        None => (None, Some(ANONYMOUS_SENTINEL.to_string())),
    };
    debug_assert!(signed_request.as_deref().map(is_anonymous_sentinel).unwrap_or(true) || public_key.is_some());

    let payload = RequestPayload::Store(StoreRequest {
        key,
        value,
        ttl_secs: ttl.as_secs(),
        publish,
        sender_info: (&node.contact_info()).into(),
        public_key,
        signed_public_key: None,
        signed_request,
    });

    let outcome = node.send_request(dest, Method::Store, payload)?;
    match outcome.response.payload {
        ResponsePayload::Store(resp) if resp.result => Ok(()),
        ResponsePayload::Store(_) => Err(KadError::MalformedMessage {
            addr: dest.addr(),
            reason: "store result was false".to_string(),
        }),
        _ => Err(KadError::MalformedMessage {
            addr: dest.addr(),
            reason: "expected a Store response".to_string(),
        }),
    }
}

impl Node {
    /// §4.7: every `REPUBLISH_POLL`, re-disseminates any locally stored
    /// value whose `last_refresh` is older than `config.republish_interval`,
    /// as a non-publish (refresh) Store.
    pub(super) fn start_republish_loop(&self) {
        let node = self.clone();
        thread::spawn(move || {
            while !node.left.load(Ordering::Acquire) {
                thread::sleep(REPUBLISH_POLL);
                if !node.online.load(Ordering::Acquire) {
                    continue;
                }
                let due = node.store.lock().unwrap().values_to_refresh(node.config.republish_interval);
                for entry in due {
                    let node = node.clone();
                    thread::spawn(move || {
                        if let Err(e) = disseminate(&node, entry.key, entry.value, entry.ttl, false) {
                            debug!("{}: republish of {:?} failed: {}", node.log_addr(), entry.key, e);
                        }
                    });
                }
            }
            debug!("{}: republish loop stopped", node.log_addr());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    fn test_node() -> Node {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("kad-core-store-test-{}-{}.kadconfig", std::process::id(), NodeId::rand().to_hex()));
        Node::new("127.0.0.1:0", NodeConfig::default(), path).unwrap()
    }

    #[test]
    fn test_store_value_against_a_single_peer_network_stores_locally() {
        let a = test_node();
        a.join().unwrap();
        let key = NodeId::rand();
        let outcome = a.store_value(key, b"hello".to_vec(), Duration::from_secs(60)).unwrap();
        assert!(outcome.succeeded >= 1);
        assert_eq!(a.load_local(&key), vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_store_value_disseminates_to_a_known_peer() {
        let a = test_node();
        a.join().unwrap();
        let b = test_node();
        b.join().unwrap();
        a.admit_contact(b.contact_info());
        b.admit_contact(a.contact_info());

        let key = NodeId::rand();
        let outcome = a.store_value(key, b"hello".to_vec(), Duration::from_secs(60)).unwrap();
        assert!(outcome.succeeded >= 1);
        assert_eq!(b.load_local(&key), vec![b"hello".to_vec()]);
    }

    fn test_node_with_k(k: usize) -> Node {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("kad-core-store-test-{}-{}.kadconfig", std::process::id(), NodeId::rand().to_hex()));
        let config = NodeConfig { k, ..NodeConfig::default() };
        Node::new("127.0.0.1:0", config, path).unwrap()
    }

    #[test]
    fn test_store_value_self_closer_than_kth_stores_locally_and_drops_furthest() {
        // K=1, so the lookup's target set is a single remote peer `b`.
        // Keying on `a`'s own id makes `a` strictly closer than `b`, which
        // must trigger local storage and drop `b` from the target set
        // entirely rather than storing at both.
        let a = test_node_with_k(1);
        a.join().unwrap();
        let b = test_node_with_k(1);
        b.join().unwrap();
        a.admit_contact(b.contact_info());
        b.admit_contact(a.contact_info());

        let key = a.id();
        let outcome = a.store_value(key, b"hello".to_vec(), Duration::from_secs(60)).unwrap();
        assert_eq!(outcome.attempted, 1);
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(a.load_local(&key), vec![b"hello".to_vec()]);
        assert!(b.load_local(&key).is_empty());
    }

    #[test]
    fn test_store_value_fans_out_to_multiple_remote_peers() {
        let a = test_node_with_k(3);
        a.join().unwrap();
        let b = test_node_with_k(3);
        b.join().unwrap();
        let c = test_node_with_k(3);
        c.join().unwrap();
        for pair in [(&a, &b), (&a, &c), (&b, &c)] {
            pair.0.admit_contact(pair.1.contact_info());
            pair.1.admit_contact(pair.0.contact_info());
        }

        let key = NodeId::rand();
        let outcome = a.store_value(key, b"hello".to_vec(), Duration::from_secs(60)).unwrap();
        assert!(outcome.succeeded >= 2);
    }
}
