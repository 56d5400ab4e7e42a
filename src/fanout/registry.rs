use crate::fanout::callbacks::Callbacks;
use crate::fanout::pair::{PairBinding, PairTracker};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Unique per registration; increases in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionState {
    Active = 0,
    Unsubscribing = 1,
    Closed = 2,
}

impl SubscriptionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SubscriptionState::Active,
            1 => SubscriptionState::Unsubscribing,
            _ => SubscriptionState::Closed,
        }
    }
}

pub(crate) struct SubscriptionEntry {
    pub(crate) id: SubscriptionId,
    pub(crate) instrument_ids: Vec<String>,
    pub(crate) callbacks: Callbacks,
    pub(crate) pair: Option<Mutex<PairTracker>>,
    state: AtomicU8,
}

impl SubscriptionEntry {
    pub(crate) fn state(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state() == SubscriptionState::Active
    }

    /// Active -> Unsubscribing. Fails if unsubscribe already started.
    pub(crate) fn begin_unsubscribe(&self) -> bool {
        self.state
            .compare_exchange(
                SubscriptionState::Active as u8,
                SubscriptionState::Unsubscribing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(SubscriptionState::Closed as u8, Ordering::Release);
    }

    pub(crate) fn binding(&self) -> Option<PairBinding> {
        self.pair.as_ref().map(|p| p.lock().binding().clone())
    }
}

/// Subscriptions plus the per-instrument subscriber lists.
///
/// An instrument's reference count is the length of its subscriber list;
/// the instrument is tracked upstream exactly while that count is non-zero.
#[derive(Default)]
pub(crate) struct Registry {
    next_id: u64,
    subscriptions: BTreeMap<SubscriptionId, Arc<SubscriptionEntry>>,
    instruments: HashMap<String, Vec<SubscriptionId>>,
}

impl Registry {
    /// Register a subscription. Returns it with the instruments that just
    /// became tracked (count went 0 -> 1).
    pub(crate) fn insert(
        &mut self,
        instrument_ids: Vec<String>,
        callbacks: Callbacks,
        pair: Option<PairBinding>,
    ) -> (Arc<SubscriptionEntry>, Vec<String>) {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);

        let mut newly_tracked = Vec::new();
        for asset_id in &instrument_ids {
            let subscribers = self.instruments.entry(asset_id.clone()).or_default();
            if subscribers.is_empty() {
                newly_tracked.push(asset_id.clone());
            }
            subscribers.push(id);
        }

        let entry = Arc::new(SubscriptionEntry {
            id,
            instrument_ids,
            callbacks,
            pair: pair.map(|b| Mutex::new(PairTracker::new(b))),
            state: AtomicU8::new(SubscriptionState::Active as u8),
        });
        self.subscriptions.insert(id, Arc::clone(&entry));
        (entry, newly_tracked)
    }

    /// Drop a subscription. Returns the instruments that are no longer tracked.
    pub(crate) fn remove(&mut self, id: SubscriptionId) -> Vec<String> {
        let Some(entry) = self.subscriptions.remove(&id) else {
            return Vec::new();
        };

        let mut untracked = Vec::new();
        for asset_id in &entry.instrument_ids {
            if let Some(subscribers) = self.instruments.get_mut(asset_id) {
                subscribers.retain(|s| *s != id);
                if subscribers.is_empty() {
                    self.instruments.remove(asset_id);
                    untracked.push(asset_id.clone());
                }
            }
        }
        untracked
    }

    /// Subscribers of one instrument in registration order.
    pub(crate) fn subscribers_of(&self, asset_id: &str) -> Vec<Arc<SubscriptionEntry>> {
        self.instruments
            .get(asset_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.subscriptions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn is_tracked(&self, asset_id: &str) -> bool {
        self.instruments.contains_key(asset_id)
    }

    pub(crate) fn ref_count(&self, asset_id: &str) -> usize {
        self.instruments.get(asset_id).map_or(0, Vec::len)
    }

    /// Tracked instruments, sorted.
    pub(crate) fn tracked(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instruments.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Remove everything, returning the entries and the instruments that were tracked.
    pub(crate) fn drain(&mut self) -> (Vec<Arc<SubscriptionEntry>>, Vec<String>) {
        let tracked = self.tracked();
        let entries = std::mem::take(&mut self.subscriptions).into_values().collect();
        self.instruments.clear();
        (entries, tracked)
    }
}
