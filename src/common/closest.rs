//! Contacts paired with their distance to a lookup target.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::common::{Contact, Id};

/// A [Contact] paired with its precomputed XOR distance to some target.
///
/// Ordered by distance only; two records with the same distance to the same
/// target necessarily share the same id.
#[derive(Debug, Clone)]
pub struct ContactRecord {
    pub contact: Contact,
    pub distance: Id,
}

impl ContactRecord {
    pub fn new(contact: Contact, target: &Id) -> Self {
        let distance = contact.id.xor(target);

        Self { contact, distance }
    }
}

impl PartialEq for ContactRecord {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for ContactRecord {}

impl PartialOrd for ContactRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ContactRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance.cmp(&other.distance)
    }
}

/// Sort records ascending by distance, keep the first `count` and drop the distances.
pub fn closest_contacts(mut records: Vec<ContactRecord>, count: usize) -> Vec<Contact> {
    records.sort_unstable();
    records.truncate(count);

    records.into_iter().map(|record| record.contact).collect()
}

/// Min-priority queue of not-yet-queried contacts, closest to the target first.
#[derive(Debug)]
pub struct Frontier {
    target: Id,
    heap: BinaryHeap<Reverse<ContactRecord>>,
}

impl Frontier {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            heap: BinaryHeap::new(),
        }
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    // === Public Methods ===

    pub fn push(&mut self, contact: Contact) {
        self.heap
            .push(Reverse(ContactRecord::new(contact, &self.target)));
    }

    /// Remove and return the contact closest to the target.
    pub fn pop(&mut self) -> Option<Contact> {
        self.heap.pop().map(|Reverse(record)| record.contact)
    }
}
