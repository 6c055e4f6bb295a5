//! Kademlia routing table: one recency-ordered k-bucket per XOR prefix length.

use std::collections::VecDeque;

use crate::common::{closest_contacts, Contact, ContactRecord, Id, ID_BITS};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
/// What [RoutingTable::update] did with a contact.
pub enum UpdateOutcome {
    /// The contact was new and got inserted as the most recently seen.
    Inserted,
    /// The contact was already known and moved to the most recently seen position.
    Refreshed,
    /// The bucket was full (or already probing), the contact was dropped.
    Dropped,
    /// The bucket was full and is now waiting for the result of pinging its
    /// least recently seen contact, see [RoutingTable::update_or_probe].
    ProbeStalest(Contact),
}

#[derive(Debug, Clone)]
/// Kademlia routing table
pub struct RoutingTable {
    id: Id,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        RoutingTable {
            id,
            buckets: (0..ID_BITS).map(|_| KBucket::new()).collect(),
        }
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Returns the bucket at a given prefix length.
    ///
    /// Panics if `index >= ID_BITS`.
    pub fn bucket(&self, index: usize) -> &KBucket {
        &self.buckets[index]
    }

    /// Returns the index of the bucket an id belongs to.
    pub fn bucket_index(&self, id: &Id) -> usize {
        id.xor(&self.id).prefix_len()
    }

    // === Public Methods ===

    /// Mark a contact as seen.
    ///
    /// Known contacts move to the front of their bucket unchanged, new contacts are inserted
    /// at the front if there is room, and dropped otherwise. The least recently seen
    /// contact of a full bucket is never evicted by this method.
    pub fn update(&mut self, contact: Contact) -> UpdateOutcome {
        let index = self.bucket_index(&contact.id);

        self.buckets[index].update(contact)
    }

    /// Same as [Self::update], except that a full bucket without a pending probe
    /// remembers the contact as an eviction candidate, and returns
    /// [UpdateOutcome::ProbeStalest] with the least recently seen contact that the
    /// caller should ping, then report back with [Self::resolve_probe].
    pub fn update_or_probe(&mut self, contact: Contact) -> UpdateOutcome {
        let index = self.bucket_index(&contact.id);

        match self.buckets[index].update(contact.clone()) {
            UpdateOutcome::Dropped => self.buckets[index].start_probe(contact),
            outcome => outcome,
        }
    }

    /// Resolve a pending eviction probe of the stalest contact of a bucket.
    ///
    /// A responsive contact stays (moved to the front), and the candidate is dropped.
    /// An unresponsive contact is replaced by the candidate.
    pub fn resolve_probe(&mut self, stalest: &Id, responsive: bool) {
        let index = self.bucket_index(stalest);

        self.buckets[index].resolve_probe(stalest, responsive)
    }

    /// Remove a contact from this routing table.
    pub fn remove(&mut self, id: &Id) {
        let index = self.bucket_index(id);

        self.buckets[index].remove(id)
    }

    /// Return up to `count` known contacts closest to the `target`, closest first.
    ///
    /// Starts from the bucket the target falls in, then expands outward alternating
    /// one bucket below and one above, until enough candidates are collected.
    pub fn find_closest(&self, target: &Id, count: usize) -> Vec<Contact> {
        let start = self.bucket_index(target);

        let mut records: Vec<ContactRecord> = Vec::with_capacity(count);
        self.buckets[start].copy_records(target, &mut records);

        let mut i = 1;
        while (i <= start || start + i < ID_BITS) && records.len() < count {
            if i <= start {
                self.buckets[start - i].copy_records(target, &mut records);
            }
            if start + i < ID_BITS {
                self.buckets[start + i].copy_records(target, &mut records);
            }

            i += 1;
        }

        closest_contacts(records, count)
    }

    /// Return the [MAX_BUCKET_SIZE_K] closest contacts to the target.
    pub fn closest(&self, target: &Id) -> Vec<Contact> {
        self.find_closest(target, MAX_BUCKET_SIZE_K)
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    /// Return the number of contacts in this routing table.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    /// Returns `true` if a contact with this id is in the routing table.
    pub fn contains(&self, id: &Id) -> bool {
        self.buckets[self.bucket_index(id)].contains(id)
    }

    /// Returns an iterator over the contacts in this routing table, bucket by bucket.
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.buckets.iter().flat_map(|bucket| bucket.iter())
    }

    /// Export an owned vector of contacts from this routing table.
    pub fn to_vec(&self) -> Vec<Contact> {
        self.contacts().cloned().collect()
    }
}

#[derive(Debug, Clone)]
/// A full bucket waiting to learn whether its least recently seen contact is still alive.
pub struct PendingEviction {
    pub stalest: Id,
    pub candidate: Contact,
}

/// Kbuckets hold up to [MAX_BUCKET_SIZE_K] contacts, most recently seen first.
#[derive(Debug, Clone)]
pub struct KBucket {
    contacts: VecDeque<Contact>,
    pending: Option<PendingEviction>,
}

impl KBucket {
    pub fn new() -> Self {
        KBucket {
            contacts: VecDeque::with_capacity(MAX_BUCKET_SIZE_K),
            pending: None,
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= MAX_BUCKET_SIZE_K
    }

    /// Contacts from the most recently seen to the least recently seen.
    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    pub fn pending(&self) -> Option<&PendingEviction> {
        self.pending.as_ref()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.contacts.iter().any(|contact| &contact.id == id)
    }

    // === Public Methods ===

    pub fn update(&mut self, incoming: Contact) -> UpdateOutcome {
        if let Some(index) = self.position(&incoming.id) {
            // Only reorder, a known id keeps the address it was first seen with.
            if let Some(known) = self.contacts.remove(index) {
                self.contacts.push_front(known);
            }

            UpdateOutcome::Refreshed
        } else if !self.is_full() {
            self.contacts.push_front(incoming);

            UpdateOutcome::Inserted
        } else {
            UpdateOutcome::Dropped
        }
    }

    pub fn remove(&mut self, id: &Id) {
        self.contacts.retain(|contact| &contact.id != id);
    }

    // === Private Methods ===

    fn position(&self, id: &Id) -> Option<usize> {
        self.contacts.iter().position(|contact| &contact.id == id)
    }

    fn start_probe(&mut self, candidate: Contact) -> UpdateOutcome {
        if self.pending.is_some() {
            return UpdateOutcome::Dropped;
        }

        match self.contacts.back() {
            Some(stalest) => {
                let stalest = stalest.clone();

                self.pending = Some(PendingEviction {
                    stalest: stalest.id,
                    candidate,
                });

                UpdateOutcome::ProbeStalest(stalest)
            }
            None => UpdateOutcome::Dropped,
        }
    }

    fn resolve_probe(&mut self, stalest: &Id, responsive: bool) {
        let pending = match self.pending.take() {
            Some(pending) if &pending.stalest == stalest => pending,
            other => {
                self.pending = other;
                return;
            }
        };

        if responsive {
            if let Some(index) = self.position(stalest) {
                if let Some(contact) = self.contacts.remove(index) {
                    self.contacts.push_front(contact);
                }
            }
            return;
        }

        self.remove(stalest);

        if !self.contains(&pending.candidate.id) && !self.is_full() {
            self.contacts.push_front(pending.candidate);
        }
    }

    fn copy_records(&self, target: &Id, records: &mut Vec<ContactRecord>) {
        records.extend(
            self.contacts
                .iter()
                .map(|contact| ContactRecord::new(contact.clone(), target)),
        );
    }
}

impl Default for KBucket {
    fn default() -> Self {
        Self::new()
    }
}
