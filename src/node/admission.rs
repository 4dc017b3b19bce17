use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::contact::Contact;

use super::Node;

/// A contact a full, non-holder bucket refused, queued for the liveness-ping
/// admission worker (§4.9) instead of being discarded outright.
pub struct AdmissionCandidate {
    pub bucket_index: usize,
    pub candidate: Contact,
}

/// Bounded single-consumer queue feeding the admission worker. Overflow
/// silently drops the oldest candidate; the producer (an RPC handler thread)
/// never blocks on a full queue.
pub struct AdmissionQueue {
    capacity: usize,
    queue: Mutex<VecDeque<AdmissionCandidate>>,
    not_empty: Condvar,
    closed: Mutex<bool>,
}

impl AdmissionQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(AdmissionQueue {
            capacity,
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            closed: Mutex::new(false),
        })
    }

    pub fn push(&self, candidate: AdmissionCandidate) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(candidate);
        self.not_empty.notify_one();
    }

    fn pop(&self) -> Option<AdmissionCandidate> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(candidate) = queue.pop_front() {
                return Some(candidate);
            }
            if *self.closed.lock().unwrap() {
                return None;
            }
            queue = self.not_empty.wait(queue).unwrap();
        }
    }

    pub fn shutdown(&self) {
        *self.closed.lock().unwrap() = true;
        self.not_empty.notify_all();
    }
}

impl Node {
    pub(super) fn start_admission_worker(&self) {
        let node = self.clone();
        thread::spawn(move || {
            while let Some(candidate) = node.admission.pop() {
                node.process_admission_candidate(candidate);
            }
            debug!("{}: admission worker stopped", node.log_addr());
        });
    }

    /// §4.9: pings the LRU occupant of the bucket that refused `candidate`;
    /// force-evicts it and admits `candidate` on ping failure, otherwise
    /// discards `candidate` and leaves the bucket untouched.
    fn process_admission_candidate(&self, candidate: AdmissionCandidate) {
        let lru = {
            let table = self.routing_table.lock().unwrap();
            table.get_last_seen(candidate.bucket_index)
        };
        let lru = match lru {
            Some(c) => c,
            // bucket emptied out between the rejection and this worker
            // picking it up; just retry the insert.
            None => {
                self.routing_table.lock().unwrap().add_contact(candidate.candidate);
                return;
            },
        };

        match self.send_ping(&lru) {
            Ok(_) => {
                trace!(
                    "{}: admission: LRU {:?} still alive, discarding {:?}",
                    self.log_addr(),
                    lru.node_id,
                    candidate.candidate.node_id
                );
            },
            Err(_) => {
                debug!(
                    "{}: admission: LRU {:?} dead, evicting for {:?}",
                    self.log_addr(),
                    lru.node_id,
                    candidate.candidate.node_id
                );
                let mut table = self.routing_table.lock().unwrap();
                table.remove_contact(&lru.node_id, true);
                table.add_contact(candidate.candidate);
            },
        }
    }
}
