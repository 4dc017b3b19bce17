use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::KadError;
use crate::rpc::message::{Method, Request, RequestPayload, Response};

/// The result of a completed outgoing RPC: the decoded response plus the
/// measured round-trip time.
#[derive(Debug, Clone)]
pub struct RpcOutcome {
    pub response: Response,
    pub rtt: Duration,
}

/// Bookkeeping for one outstanding request. Lives behind an `Arc` so the
/// reaper thread and `handle_response`/`notify_progress` can all reach it
/// without holding the pending-request table lock during delivery.
struct PendingRequest {
    method: Method,
    sender: Mutex<Option<Sender<Result<RpcOutcome, KadError>>>>,
    sent_at: Instant,
    deadline: Mutex<Instant>,
    bytes_received_so_far: AtomicUsize,
    /// Exactly one of {delivered, cancelled, timed out} may claim this slot.
    claimed: AtomicBool,
}

/// Assigns monotonic request ids, pairs responses with pending requests,
/// enforces per-request timeouts with progress-based extension, and
/// measures round-trip time. One `RpcCorrelator` is owned per `Node`.
pub struct RpcCorrelator {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, Arc<PendingRequest>>>,
    reaper_alive: Arc<AtomicBool>,
}

impl RpcCorrelator {
    pub fn new() -> Arc<Self> {
        let correlator = Arc::new(RpcCorrelator {
            next_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            reaper_alive: Arc::new(AtomicBool::new(true)),
        });
        correlator.clone().start_reaper();
        correlator
    }

    fn start_reaper(self: Arc<Self>) {
        let alive = Arc::clone(&self.reaper_alive);
        thread::spawn(move || {
            while alive.load(Ordering::Acquire) {
                self.reap_expired();
                thread::sleep(Duration::from_millis(100));
            }
        });
    }

    fn reap_expired(&self) {
        let now = Instant::now();
        let expired: Vec<(u32, Arc<PendingRequest>)> = {
            let pending = self.pending.lock().unwrap();
            pending
                .iter()
                .filter(|(_, p)| *p.deadline.lock().unwrap() <= now)
                .map(|(id, p)| (*id, Arc::clone(p)))
                .collect()
        };
        for (id, p) in expired {
            if p.claimed.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
                self.pending.lock().unwrap().remove(&id);
                if let Some(sender) = p.sender.lock().unwrap().take() {
                    let _ = sender.send(Err(KadError::Timeout {
                        request_id: id,
                        method: format!("{:?}", p.method),
                    }));
                }
            }
        }
    }

    /// Monotonic request id, modulo 2^31 - 1, never 0.
    pub fn alloc_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) % (i32::MAX as u32);
            if id != 0 {
                return id;
            }
        }
    }

    /// Registers a new outgoing request and returns the channel its outcome
    /// will be delivered on exactly once (response, timeout, or cancel).
    pub fn register(&self, message_id: u32, method: Method, timeout: Duration) -> Receiver<Result<RpcOutcome, KadError>> {
        let (tx, rx) = channel();
        let pending = Arc::new(PendingRequest {
            method,
            sender: Mutex::new(Some(tx)),
            sent_at: Instant::now(),
            deadline: Mutex::new(Instant::now() + timeout),
            bytes_received_so_far: AtomicUsize::new(0),
            claimed: AtomicBool::new(false),
        });
        self.pending.lock().unwrap().insert(message_id, pending);
        rx
    }

    /// Signals that additional bytes have arrived for `message_id`'s
    /// connection before its deadline fired; re-arms the deadline instead of
    /// letting it expire mid-transfer.
    pub fn notify_progress(&self, message_id: u32, additional_bytes: usize, timeout: Duration) {
        let pending = self.pending.lock().unwrap();
        if let Some(p) = pending.get(&message_id) {
            p.bytes_received_so_far.fetch_add(additional_bytes, Ordering::SeqCst);
            *p.deadline.lock().unwrap() = Instant::now() + timeout;
        }
    }

    /// Delivers a parsed response to its waiting caller. A response whose
    /// `message_id` has no pending entry (already timed out, cancelled, or
    /// simply irrelevant) is dropped.
    pub fn handle_response(&self, response: Response) {
        let pending = {
            let mut table = self.pending.lock().unwrap();
            table.remove(&response.message_id)
        };
        let pending = match pending {
            Some(p) => p,
            None => return,
        };
        if pending.claimed.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return;
        }
        let rtt = pending.sent_at.elapsed();
        if let Some(sender) = pending.sender.lock().unwrap().take() {
            let _ = sender.send(Ok(RpcOutcome { response, rtt }));
        }
    }

    /// Cancels every outstanding request, firing each callback once with
    /// `Cancelled`. Used by `Node::leave()`.
    pub fn cancel_all(&self) {
        let drained: Vec<(u32, Arc<PendingRequest>)> = self.pending.lock().unwrap().drain().collect();
        for (id, p) in drained {
            if p.claimed.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
                if let Some(sender) = p.sender.lock().unwrap().take() {
                    let _ = sender.send(Err(KadError::Cancelled { request_id: id }));
                }
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Drops a pending entry without delivering any outcome on its channel;
    /// used when the send that would have produced a response never left
    /// the machine (e.g. a refused connection).
    pub fn forget(&self, message_id: u32) {
        self.pending.lock().unwrap().remove(&message_id);
    }

    pub fn shutdown(&self) {
        self.reaper_alive.store(false, Ordering::Release);
        self.cancel_all();
    }

    /// When the incoming RPC method is `Bootstrap`, rewrites the request's
    /// newcomer-address fields with the observed peer address from the
    /// transport before handing it to the handler — this is how a joining
    /// node learns its externally visible address.
    pub fn rewrite_bootstrap_request(request: &mut Request, peer_addr: SocketAddr) {
        if let RequestPayload::Bootstrap(ref mut bootstrap) = request.payload {
            bootstrap.newcomer_ext_ip = peer_addr.ip().to_string();
            bootstrap.newcomer_ext_port = peer_addr.port();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::message::{PingResponse, ResponsePayload};
    use std::net::{IpAddr, Ipv4Addr};

    fn dummy_response(id: u32) -> Response {
        Response {
            message_id: id,
            payload: ResponsePayload::Ping(PingResponse {
                result: true,
                node_id: crate::key::NodeId::rand(),
            }),
        }
    }

    #[test]
    fn test_response_delivered_exactly_once() {
        let correlator = RpcCorrelator::new();
        let id = correlator.alloc_id();
        let rx = correlator.register(id, Method::Ping, Duration::from_secs(5));
        correlator.handle_response(dummy_response(id));
        // a duplicate / late response for the same id must be dropped
        correlator.handle_response(dummy_response(id));
        let outcome = rx.recv().unwrap();
        assert!(outcome.is_ok());
        assert_eq!(correlator.pending_count(), 0);
        correlator.shutdown();
    }

    #[test]
    fn test_timeout_fires_when_no_response_arrives() {
        let correlator = RpcCorrelator::new();
        let id = correlator.alloc_id();
        let rx = correlator.register(id, Method::Ping, Duration::from_millis(50));
        let outcome = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(outcome, Err(KadError::Timeout { .. })));
        correlator.shutdown();
    }

    #[test]
    fn test_progress_extends_deadline_past_original_timeout() {
        let correlator = RpcCorrelator::new();
        let id = correlator.alloc_id();
        let rx = correlator.register(id, Method::Ping, Duration::from_millis(100));
        // keep "bytes arriving" well past the original deadline
        for _ in 0..4 {
            thread::sleep(Duration::from_millis(60));
            correlator.notify_progress(id, 16, Duration::from_millis(100));
        }
        assert!(rx.try_recv().is_err(), "should not have timed out while progress kept arriving");
        correlator.handle_response(dummy_response(id));
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap().is_ok());
        correlator.shutdown();
    }

    #[test]
    fn test_cancel_all_fires_cancelled() {
        let correlator = RpcCorrelator::new();
        let id = correlator.alloc_id();
        let rx = correlator.register(id, Method::Ping, Duration::from_secs(30));
        correlator.cancel_all();
        assert!(matches!(rx.recv().unwrap(), Err(KadError::Cancelled { .. })));
    }

    #[test]
    fn test_bootstrap_rewrite_fills_observed_address() {
        use crate::rpc::message::{BootstrapRequest, RequestPayload};
        let mut req = Request {
            message_id: 1,
            service: "kad".to_string(),
            method: Method::Bootstrap,
            payload: RequestPayload::Bootstrap(BootstrapRequest {
                newcomer_id: crate::key::NodeId::rand(),
                newcomer_local_ip: "192.168.0.5".to_string(),
                newcomer_local_port: 1234,
                newcomer_ext_ip: String::new(),
                newcomer_ext_port: 0,
            }),
        };
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)), 51000);
        RpcCorrelator::rewrite_bootstrap_request(&mut req, peer);
        match req.payload {
            RequestPayload::Bootstrap(b) => {
                assert_eq!(b.newcomer_ext_ip, "203.0.113.9");
                assert_eq!(b.newcomer_ext_port, 51000);
            },
            _ => unreachable!(),
        }
    }
}
