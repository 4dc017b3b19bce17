use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{channel, Sender};
use std::thread;

use crate::contact::Contact;
use crate::key::NodeId;
use crate::rpc::message::{FindRequest, FindResponse, Method, RequestPayload, ResponsePayload};

use super::Node;

/// Which flavour of iterative lookup `run_lookup` is performing. `Bootstrap`
/// behaves exactly like `FindNode` (it exists as a distinct variant only so
/// callers and logs can tell a self-lookup apart from an ordinary one).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupMethod {
    FindNode,
    FindValue,
    Bootstrap,
}

impl LookupMethod {
    fn wants_value(self) -> bool {
        matches!(self, LookupMethod::FindValue)
    }
}

/// What a lookup converged on: the K closest live contacts found, any
/// values returned (only ever non-empty for `FindValue`), and an
/// alternative-store redirection if one of the queried peers reported one.
pub struct LookupOutcome {
    pub closest: Vec<Contact>,
    pub values: Vec<Vec<u8>>,
    pub alternative_holder: Option<Contact>,
}

struct ShortlistEntry {
    contact: Contact,
    contacted: bool,
}

enum ProbeResult {
    Success { giver: Contact, response: FindResponse },
    Failed { giver: Contact },
}

/// §4.6 iterative lookup: seeds a shortlist from the routing table, probes
/// up to `alpha` uncontacted candidates at a time, and converges once a
/// final round turns up nothing closer than the K closest contacts found so
/// far. Every giver's named candidates are tracked so dead ones can be
/// reported back via `Downlist` once the lookup concludes.
pub fn run_lookup(node: &Node, target: NodeId, method: LookupMethod) -> LookupOutcome {
    let alpha = node.config().alpha.max(1);
    let beta = node.config().beta.max(1);
    let k = node.config().k;

    let seed = node.find_close_nodes_locally(&target, alpha);
    let mut short_list: Vec<ShortlistEntry> = seed.into_iter().map(|contact| ShortlistEntry { contact, contacted: false }).collect();
    let mut active_contacts: Vec<Contact> = Vec::new();
    let mut active_probes: HashMap<NodeId, Contact> = HashMap::new();
    let mut dead_ids: HashSet<NodeId> = HashSet::new();
    let mut downlist: HashMap<NodeId, (Contact, HashSet<NodeId>)> = HashMap::new();
    let mut in_final_iteration = false;

    let (tx, rx) = channel::<ProbeResult>();

    loop {
        short_list.sort_by_key(|e| e.contact.node_id.xor(&target));
        active_contacts.sort_by_key(|c| c.node_id.xor(&target));

        // §4.6 step 2: at β or more in-flight probes, or while waiting on a
        // probe for the target id itself, yield to rx.recv() instead of
        // issuing a new round.
        let throttled = active_probes.len() >= beta || active_probes.contains_key(&target);

        if !in_final_iteration {
            let closer_exists = match short_list.iter().find(|e| !e.contacted) {
                None => false,
                Some(entry) => {
                    if active_contacts.len() < k {
                        true
                    } else {
                        entry.contact.node_id.xor(&target) < active_contacts[k - 1].node_id.xor(&target)
                    }
                },
            };

            if !closer_exists {
                in_final_iteration = true;
            } else if !throttled {
                let picked: Vec<Contact> = short_list
                    .iter_mut()
                    .filter(|e| !e.contacted)
                    .take(alpha)
                    .map(|e| {
                        e.contacted = true;
                        e.contact.clone()
                    })
                    .collect();
                for c in picked {
                    active_probes.insert(c.node_id, c.clone());
                    spawn_probe(node, target, method, c, tx.clone());
                }
            }
        }

        if in_final_iteration {
            if active_contacts.len() >= k {
                let kth_distance = active_contacts[k - 1].node_id.xor(&target);
                let closer_in_flight = active_probes.values().any(|c| c.node_id.xor(&target) < kth_distance);
                if !closer_in_flight {
                    break;
                }
            } else {
                if !throttled {
                    let want = k - active_contacts.len();
                    let need = want.saturating_sub(active_probes.len());
                    let picked: Vec<Contact> = short_list
                        .iter_mut()
                        .filter(|e| !e.contacted)
                        .take(need)
                        .map(|e| {
                            e.contacted = true;
                            e.contact.clone()
                        })
                        .collect();
                    for c in picked {
                        active_probes.insert(c.node_id, c.clone());
                        spawn_probe(node, target, method, c, tx.clone());
                    }
                }
                if active_probes.is_empty() {
                    break;
                }
            }
        }

        match rx.recv() {
            Ok(ProbeResult::Success { giver, response }) => {
                active_probes.remove(&giver.node_id);
                active_contacts.push(giver.clone());
                node.admit_contact(giver.clone());

                if method.wants_value() && !response.values.is_empty() {
                    let alternative_holder = response.alternative_value_holder.as_ref().map(Contact::from);
                    send_downlist(node, &downlist, &dead_ids);
                    return LookupOutcome {
                        closest: active_contacts,
                        values: response.values,
                        alternative_holder,
                    };
                }

                let giver_entry = downlist.entry(giver.node_id).or_insert_with(|| (giver.clone(), HashSet::new()));
                for info in &response.closest_nodes {
                    let candidate = Contact::from(info);
                    if candidate.node_id == node.id() {
                        continue;
                    }
                    giver_entry.1.insert(candidate.node_id);
                    let already_known = short_list.iter().any(|e| e.contact.node_id == candidate.node_id)
                        || active_contacts.iter().any(|c| c.node_id == candidate.node_id);
                    if !already_known {
                        short_list.insert(0, ShortlistEntry { contact: candidate, contacted: false });
                    }
                }
            },
            Ok(ProbeResult::Failed { giver }) => {
                active_probes.remove(&giver.node_id);
                dead_ids.insert(giver.node_id);
            },
            Err(_) => break,
        }
    }

    active_contacts.sort_by_key(|c| c.node_id.xor(&target));
    active_contacts.dedup_by(|a, b| a.node_id == b.node_id);
    active_contacts.truncate(k);

    send_downlist(node, &downlist, &dead_ids);

    LookupOutcome {
        closest: active_contacts,
        values: Vec::new(),
        alternative_holder: None,
    }
}

fn spawn_probe(node: &Node, target: NodeId, method: LookupMethod, dest: Contact, tx: Sender<ProbeResult>) {
    let node = node.clone();
    thread::spawn(move || {
        let request = RequestPayload::Find(FindRequest {
            key: target,
            sender_info: (&node.contact_info()).into(),
            want_value: method.wants_value(),
        });
        let rpc_method = if method.wants_value() { Method::FindValue } else { Method::FindNode };
        match node.send_request(&dest, rpc_method, request) {
            Ok(outcome) => match outcome.response.payload {
                ResponsePayload::Find(response) => {
                    let _ = tx.send(ProbeResult::Success { giver: dest, response });
                },
                _ => {
                    let _ = tx.send(ProbeResult::Failed { giver: dest });
                },
            },
            Err(_) => {
                node.routing_table_remove(&dest.node_id);
                let _ = tx.send(ProbeResult::Failed { giver: dest });
            },
        }
    });
}

fn send_downlist(node: &Node, downlist: &HashMap<NodeId, (Contact, HashSet<NodeId>)>, dead_ids: &HashSet<NodeId>) {
    for (giver, candidates) in downlist.values() {
        let dead_named: Vec<NodeId> = candidates.intersection(dead_ids).cloned().collect();
        if dead_named.is_empty() {
            continue;
        }
        let node = node.clone();
        let giver = giver.clone();
        thread::spawn(move || {
            node.send_downlist(&giver, &dead_named);
        });
    }
}
