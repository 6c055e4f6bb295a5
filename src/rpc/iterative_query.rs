//! Manage iterative lookups and their concurrent find_node requests.

use std::collections::HashSet;
use std::thread;

use tracing::{debug, trace};

use crate::common::{closest_contacts, Contact, ContactRecord, Frontier, Id, MAX_BUCKET_SIZE_K};

/// An iterative process of concurrently querying the closest unqueried contacts to a
/// target, adding every contact they return as a new candidate, and repeating this
/// until nothing is inflight and no candidate is left to query.
///
/// All state lives in this controller, workers only report [Outcome]s back to it.
#[derive(Debug)]
pub(crate) struct IterativeFindNode {
    parallelism: usize,
    results: Vec<ContactRecord>,
    frontier: Frontier,
    seen: HashSet<Id>,
    pending: usize,
    queried: usize,
}

/// The result of querying one contact, `None` if the request failed.
#[derive(Debug)]
pub(crate) struct Outcome {
    pub from: Id,
    pub contacts: Option<Vec<Contact>>,
}

impl IterativeFindNode {
    /// Start a lookup for `target` on behalf of the node `local_id`, which is never queried.
    pub fn new(local_id: Id, target: Id, parallelism: usize) -> Self {
        trace!(?target, parallelism, "New lookup");

        let mut seen = HashSet::new();
        seen.insert(local_id);

        Self {
            parallelism: parallelism.max(1),
            results: Vec::new(),
            frontier: Frontier::new(target),
            seen,
            pending: 0,
            queried: 0,
        }
    }

    // === Getters ===

    /// True once nothing is inflight and the frontier is drained.
    pub fn is_done(&self) -> bool {
        self.pending == 0 && self.frontier.is_empty()
    }

    // === Public Methods ===

    /// Add a candidate unless it was already seen.
    ///
    /// Returns true if it was new.
    pub fn add_candidate(&mut self, contact: Contact) -> bool {
        if !self.seen.insert(contact.id) {
            return false;
        }

        self.results
            .push(ContactRecord::new(contact.clone(), self.frontier.target()));
        self.frontier.push(contact);

        true
    }

    /// Take the closest unqueried candidate if a request slot is free.
    pub fn next_to_query(&mut self) -> Option<Contact> {
        if self.pending >= self.parallelism {
            return None;
        }

        let contact = self.frontier.pop()?;
        self.pending += 1;
        self.queried += 1;

        Some(contact)
    }

    /// Record a worker's outcome, failed contacts leave the results.
    pub fn on_outcome(&mut self, outcome: Outcome) {
        self.pending = self.pending.saturating_sub(1);

        match outcome.contacts {
            Some(contacts) => {
                for contact in contacts {
                    self.add_candidate(contact);
                }
            }
            None => {
                self.results
                    .retain(|record| record.contact.id != outcome.from);
            }
        }
    }

    /// The [MAX_BUCKET_SIZE_K] closest results, ascending by distance.
    pub fn finish(self) -> Vec<Contact> {
        debug!(
            target = ?self.frontier.target(),
            queried = self.queried,
            results = self.results.len(),
            "Done lookup"
        );

        closest_contacts(self.results, MAX_BUCKET_SIZE_K)
    }

    /// Drive the lookup to completion, running `query` on one worker thread per request.
    ///
    /// `query` returns the contacts a node answered with, or `None` if it failed.
    pub fn run<F>(mut self, query: F) -> Vec<Contact>
    where
        F: Fn(&Contact) -> Option<Vec<Contact>> + Sync,
    {
        let (sender, receiver) = flume::unbounded::<Outcome>();
        let query = &query;

        thread::scope(|scope| loop {
            while let Some(contact) = self.next_to_query() {
                let sender = sender.clone();

                scope.spawn(move || {
                    let contacts = query(&contact);
                    let _ = sender.send(Outcome {
                        from: contact.id,
                        contacts,
                    });
                });
            }

            if self.is_done() {
                break;
            }

            match receiver.recv() {
                Ok(outcome) => self.on_outcome(outcome),
                // We hold a sender, so this can't happen.
                Err(_) => break,
            }
        });

        self.finish()
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    fn contact(first_byte: u8, port: u16) -> Contact {
        let mut bytes = [0; 20];
        bytes[0] = first_byte;

        Contact::new(Id::from(bytes), SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn local_id_is_never_a_candidate() {
        let local = contact(1, 1);
        let mut lookup = IterativeFindNode::new(local.id, Id::random(), 3);

        assert!(!lookup.add_candidate(local));
        assert!(lookup.is_done());
        assert!(lookup.finish().is_empty());
    }

    #[test]
    fn respects_parallelism() {
        let mut lookup = IterativeFindNode::new(Id::random(), Id::random(), 2);

        for i in 1..=5 {
            lookup.add_candidate(contact(i, i as u16));
        }

        assert!(lookup.next_to_query().is_some());
        assert!(lookup.next_to_query().is_some());
        assert!(lookup.next_to_query().is_none());

        lookup.on_outcome(Outcome {
            from: contact(1, 1).id,
            contacts: Some(vec![]),
        });

        assert!(lookup.next_to_query().is_some());
        assert!(lookup.next_to_query().is_none());
        assert!(!lookup.is_done());
    }

    #[test]
    fn zero_parallelism_behaves_as_one() {
        let mut lookup = IterativeFindNode::new(Id::random(), Id::random(), 0);
        lookup.add_candidate(contact(1, 1));
        lookup.add_candidate(contact(2, 2));

        assert!(lookup.next_to_query().is_some());
        assert!(lookup.next_to_query().is_none());
    }

    #[test]
    fn queries_closest_first() {
        let target = contact(0, 0).id;
        let mut lookup = IterativeFindNode::new(Id::random(), target, 1);

        lookup.add_candidate(contact(0x80, 1));
        lookup.add_candidate(contact(0x01, 2));
        lookup.add_candidate(contact(0x10, 3));

        assert_eq!(lookup.next_to_query(), Some(contact(0x01, 2)));
    }

    #[test]
    fn empty_seed_returns_immediately() {
        let lookup = IterativeFindNode::new(Id::random(), Id::random(), 3);

        let result = lookup.run(|_| panic!("nothing to query"));

        assert!(result.is_empty());
    }

    #[test]
    fn unreachable_contact_is_excluded() {
        let target = contact(0, 0).id;
        let p1 = contact(0x10, 1);
        let p2 = contact(0x20, 2);
        let p3 = contact(0x30, 3);

        let mut lookup = IterativeFindNode::new(contact(0xff, 9).id, target, 3);
        lookup.add_candidate(p1.clone());
        lookup.add_candidate(p2.clone());
        lookup.add_candidate(p3.clone());

        let p2_address = p2.address;
        let result = lookup.run(|to| {
            if to.address == p2_address {
                None
            } else {
                Some(vec![p2.clone()])
            }
        });

        assert_eq!(result, vec![p1, p3]);
    }

    #[test]
    fn drains_every_discovered_contact() {
        // A chain where each node only knows the next one.
        let nodes: Vec<Contact> = (1..=30).map(|i| contact(i, i as u16)).collect();
        let next: HashMap<Id, Contact> = nodes
            .windows(2)
            .map(|pair| (pair[0].id, pair[1].clone()))
            .collect();

        let queried = Mutex::new(HashSet::new());
        let target = contact(0, 0).id;

        let mut lookup = IterativeFindNode::new(Id::random(), target, 3);
        lookup.add_candidate(nodes[0].clone());

        let result = lookup.run(|to| {
            assert!(
                queried.lock().unwrap().insert(to.id),
                "each contact is queried once"
            );
            Some(next.get(&to.id).cloned().into_iter().collect())
        });

        assert_eq!(queried.lock().unwrap().len(), 30);
        assert_eq!(result, nodes[..MAX_BUCKET_SIZE_K].to_vec());
    }

    #[test]
    fn never_exceeds_parallelism() {
        let inflight = AtomicUsize::new(0);
        let max_inflight = AtomicUsize::new(0);

        let mut lookup = IterativeFindNode::new(Id::random(), Id::random(), 2);
        for i in 1..=10 {
            lookup.add_candidate(contact(i, i as u16));
        }

        lookup.run(|_| {
            let current = inflight.fetch_add(1, Ordering::SeqCst) + 1;
            max_inflight.fetch_max(current, Ordering::SeqCst);
            thread::sleep(std::time::Duration::from_millis(5));
            inflight.fetch_sub(1, Ordering::SeqCst);

            Some(vec![])
        });

        assert!(max_inflight.load(Ordering::SeqCst) <= 2);
    }
}
