//! Connected replicas and their pending transfer work

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rand::Rng;

use crate::file::{FileId, TrackedFile};
use crate::queue::OscillatingQueue;

/// Randomly assigned replica identifier
pub type ClientId = i32;

/// One region a client needs.
///
/// Identity is `(file_id, offset)`: two candidates for the same region are
/// the same work item whatever their size or offer time.
#[derive(Debug, Clone, Copy)]
pub struct TransferCandidate {
    pub file_id: FileId,
    pub offset: u64,
    pub size: u64,
    /// Set when a poll handed this candidate to the client
    pub offered_at: Option<Instant>,
}

impl TransferCandidate {
    #[must_use]
    pub fn new(file_id: FileId, offset: u64, size: u64) -> Self {
        Self {
            file_id,
            offset,
            size,
            offered_at: None,
        }
    }

    /// True if the candidate was offered longer than `expiry` ago
    #[must_use]
    pub fn is_expired(&self, now: Instant, expiry: Duration) -> bool {
        self.offered_at
            .is_some_and(|at| now.saturating_duration_since(at) > expiry)
    }
}

impl PartialEq for TransferCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.file_id == other.file_id && self.offset == other.offset
    }
}

impl Eq for TransferCandidate {}

impl Hash for TransferCandidate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.file_id.hash(state);
        self.offset.hash(state);
    }
}

/// Server-side view of one replica
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    /// Region state the client has reported, keyed by server file id
    pub files: DashMap<FileId, Arc<TrackedFile>>,
    pub queue: OscillatingQueue<TransferCandidate>,
    /// Candidates handed out by a poll and not yet confirmed
    pub offered: Mutex<Vec<TransferCandidate>>,
    /// Confirmed transfers per region, for the divergence warning
    pub confirmations: DashMap<(FileId, u64), u32>,
    last_seen: Mutex<Instant>,
}

impl Client {
    #[must_use]
    pub fn new(id: ClientId, min_shrink: usize, max_grow: usize) -> Self {
        Self {
            id,
            files: DashMap::new(),
            queue: OscillatingQueue::new(min_shrink, max_grow),
            offered: Mutex::new(Vec::new()),
            confirmations: DashMap::new(),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Record activity from this client
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_seen.lock())
    }

    /// The client's copy of a server file, if it has reported on it
    #[must_use]
    pub fn file(&self, id: FileId) -> Option<Arc<TrackedFile>> {
        self.files.get(&id).map(|f| Arc::clone(f.value()))
    }

    /// Move a polled candidate to the offered list
    pub fn mark_offered(&self, mut candidate: TransferCandidate, now: Instant) {
        candidate.offered_at = Some(now);
        let mut offered = self.offered.lock();
        offered.retain(|c| c != &candidate);
        offered.push(candidate);
    }

    /// Drop every offer older than `expiry`, returning how many went
    pub fn expire_offers(&self, now: Instant, expiry: Duration) -> usize {
        let mut offered = self.offered.lock();
        let before = offered.len();
        offered.retain(|c| !c.is_expired(now, expiry));
        before - offered.len()
    }

    /// Drop the offer for a region the client has written.
    /// Returns true if there was one.
    pub fn confirm(&self, file_id: FileId, offset: u64) -> bool {
        let key = TransferCandidate::new(file_id, offset, 0);
        let mut offered = self.offered.lock();
        let before = offered.len();
        offered.retain(|c| c != &key);
        offered.len() != before
    }

    /// Count one more confirmed transfer of a region, returning the new total
    pub fn count_confirmation(&self, file_id: FileId, offset: u64) -> u32 {
        let mut count = self.confirmations.entry((file_id, offset)).or_insert(0);
        *count += 1;
        *count
    }
}

/// All connected clients
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
}

impl ClientRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client under a fresh random id
    pub fn introduce(&self, min_shrink: usize, max_grow: usize) -> Arc<Client> {
        let mut rng = rand::thread_rng();
        loop {
            let id: ClientId = rng.gen_range(1..=ClientId::MAX);
            if let Entry::Vacant(entry) = self.clients.entry(id) {
                let client = Arc::new(Client::new(id, min_shrink, max_grow));
                entry.insert(Arc::clone(&client));
                return client;
            }
        }
    }

    #[must_use]
    pub fn get(&self, id: ClientId) -> Option<Arc<Client>> {
        self.clients.get(&id).map(|c| Arc::clone(c.value()))
    }

    /// Remove a client and release anything blocked on its queue
    pub fn remove(&self, id: ClientId) -> Option<Arc<Client>> {
        let (_, client) = self.clients.remove(&id)?;
        client.queue.close();
        Some(client)
    }

    #[must_use]
    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.clients.iter().map(|c| Arc::clone(c.value())).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_candidate_identity_ignores_size_and_time() {
        let a = TransferCandidate::new(1, 0, 10);
        let mut b = TransferCandidate::new(1, 0, 99);
        b.offered_at = Some(Instant::now());
        assert_eq!(a, b);
        assert_ne!(a, TransferCandidate::new(1, 10, 10));
        assert_ne!(a, TransferCandidate::new(2, 0, 10));

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_candidate_expiry() {
        let now = Instant::now();
        let expiry = Duration::from_secs(30);
        let mut candidate = TransferCandidate::new(1, 0, 1);
        assert!(!candidate.is_expired(now, expiry));

        candidate.offered_at = Some(now);
        assert!(!candidate.is_expired(now + Duration::from_secs(30), expiry));
        assert!(candidate.is_expired(now + Duration::from_secs(31), expiry));
    }

    #[test]
    fn test_offer_then_confirm() {
        let client = Client::new(5, 1, 4);
        client.mark_offered(TransferCandidate::new(1, 0, 8), Instant::now());
        client.mark_offered(TransferCandidate::new(1, 0, 8), Instant::now());
        assert_eq!(client.offered.lock().len(), 1);

        assert!(client.confirm(1, 0));
        assert!(!client.confirm(1, 0));
        assert!(client.offered.lock().is_empty());
    }

    #[test]
    fn test_introduce_gives_distinct_ids() {
        let registry = ClientRegistry::new();
        let ids: HashSet<_> = (0..64).map(|_| registry.introduce(1, 4).id()).collect();
        assert_eq!(ids.len(), 64);
        assert_eq!(registry.len(), 64);
    }

    #[test]
    fn test_remove_closes_queue() {
        let registry = ClientRegistry::new();
        let id = registry.introduce(1, 4).id();
        let removed = registry.remove(id).unwrap();
        assert!(registry.get(id).is_none());
        assert!(removed.queue.is_empty());
    }

    #[test]
    fn test_confirmation_counter() {
        let client = Client::new(1, 1, 4);
        assert_eq!(client.count_confirmation(3, 0), 1);
        assert_eq!(client.count_confirmation(3, 0), 2);
        assert_eq!(client.count_confirmation(3, 8), 1);
    }
}
