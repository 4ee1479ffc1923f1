//! Lock-striped in-memory series index

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::types::{Exemplar, Labels, SeriesRef, Timestamp};

/// One live series and the newest timestamp appended to it
pub struct MemSeries {
    /// Ref the series is addressed by in records
    pub series_ref: SeriesRef,
    /// Full label set
    pub labels: Labels,
    last_ts: Mutex<Timestamp>,
}

impl MemSeries {
    pub fn new(series_ref: SeriesRef, labels: Labels, last_ts: Timestamp) -> Self {
        Self {
            series_ref,
            labels,
            last_ts: Mutex::new(last_ts),
        }
    }

    /// Advance the newest timestamp. Returns false and leaves it alone
    /// when `ts` is older than the current value.
    pub fn update_timestamp(&self, ts: Timestamp) -> bool {
        let mut last = self.last_ts.lock();
        if ts >= *last {
            *last = ts;
            true
        } else {
            false
        }
    }

    pub fn last_timestamp(&self) -> Timestamp {
        *self.last_ts.lock()
    }
}

#[derive(Default)]
struct Stripe {
    series: HashMap<SeriesRef, Arc<MemSeries>>,
    hashes: HashMap<u64, Vec<Arc<MemSeries>>>,
    exemplars: HashMap<SeriesRef, Exemplar>,
}

/// Series index split into stripes to spread lock contention.
///
/// A series lives in two maps: by ref in the stripe its ref selects, and
/// by label hash in the stripe that hash selects. Lookups and inserts
/// lock one stripe at a time; only [`StripeSeries::gc`] ever holds two
/// stripe locks at once, and it is serialized with itself.
pub struct StripeSeries {
    stripes: Vec<RwLock<Stripe>>,
    mask: u64,
    gc_lock: Mutex<()>,
}

impl StripeSeries {
    /// Stripe count is rounded up to a power of two so masking selects one
    pub fn new(stripe_count: usize) -> Self {
        let size = stripe_count.next_power_of_two().max(2);
        Self {
            stripes: (0..size).map(|_| RwLock::new(Stripe::default())).collect(),
            mask: (size - 1) as u64,
            gc_lock: Mutex::new(()),
        }
    }

    fn stripe_index(&self, key: u64) -> usize {
        (key & self.mask) as usize
    }

    pub fn get_by_id(&self, series_ref: SeriesRef) -> Option<Arc<MemSeries>> {
        let stripe = self.stripes[self.stripe_index(series_ref)].read();
        stripe.series.get(&series_ref).cloned()
    }

    pub fn get_by_hash(&self, hash: u64, labels: &Labels) -> Option<Arc<MemSeries>> {
        let stripe = self.stripes[self.stripe_index(hash)].read();
        stripe
            .hashes
            .get(&hash)
            .and_then(|chain| chain.iter().find(|s| s.labels == *labels))
            .cloned()
    }

    /// Insert a series under its ref and its label hash.
    ///
    /// The ref entry is written first, so a series reachable by hash can
    /// always be resolved by ref. A chain entry with equal labels is
    /// replaced; the replaced ref stays resolvable by id.
    pub fn set(&self, hash: u64, series: Arc<MemSeries>) {
        {
            let mut stripe = self.stripes[self.stripe_index(series.series_ref)].write();
            stripe.series.insert(series.series_ref, Arc::clone(&series));
        }

        let mut stripe = self.stripes[self.stripe_index(hash)].write();
        let chain = stripe.hashes.entry(hash).or_default();
        match chain.iter_mut().find(|s| s.labels == series.labels) {
            Some(slot) => *slot = series,
            None => chain.push(series),
        }
    }

    /// Drop every series whose newest timestamp is older than `min_ts`
    /// and return their refs.
    pub fn gc(&self, min_ts: Timestamp) -> HashSet<SeriesRef> {
        let _guard = self.gc_lock.lock();
        let mut removed = HashSet::new();

        for hash_idx in 0..self.stripes.len() {
            let mut hash_stripe = self.stripes[hash_idx].write();

            // The chains cannot be edited while being walked; collect the
            // dead first.
            let mut dead = Vec::new();
            for (hash, chain) in hash_stripe.hashes.iter() {
                for series in chain {
                    if series.last_timestamp() < min_ts {
                        dead.push((*hash, Arc::clone(series)));
                    }
                }
            }

            for (hash, series) in dead {
                if let Some(chain) = hash_stripe.hashes.get_mut(&hash) {
                    chain.retain(|s| s.series_ref != series.series_ref);
                    if chain.is_empty() {
                        hash_stripe.hashes.remove(&hash);
                    }
                }

                // The ref may live in another stripe. Taking that stripe
                // while holding this one cannot deadlock: writers never
                // hold two stripe locks, and gc is serialized with itself.
                let ref_idx = self.stripe_index(series.series_ref);
                if ref_idx == hash_idx {
                    hash_stripe.series.remove(&series.series_ref);
                    hash_stripe.exemplars.remove(&series.series_ref);
                } else {
                    let mut ref_stripe = self.stripes[ref_idx].write();
                    ref_stripe.series.remove(&series.series_ref);
                    ref_stripe.exemplars.remove(&series.series_ref);
                }
                removed.insert(series.series_ref);
            }
        }

        removed
    }

    pub fn get_latest_exemplar(&self, series_ref: SeriesRef) -> Option<Exemplar> {
        let stripe = self.stripes[self.stripe_index(series_ref)].read();
        stripe.exemplars.get(&series_ref).cloned()
    }

    /// Remember the newest exemplar for a series. Dropped when the ref is
    /// no longer live.
    pub fn set_latest_exemplar(&self, series_ref: SeriesRef, exemplar: &Exemplar) {
        let mut stripe = self.stripes[self.stripe_index(series_ref)].write();
        if stripe.series.contains_key(&series_ref) {
            stripe.exemplars.insert(series_ref, exemplar.clone());
        }
    }

    /// Drop everything. Returns how many refs were live.
    pub fn clear(&self) -> usize {
        let _guard = self.gc_lock.lock();
        let mut removed = 0;

        for stripe in &self.stripes {
            let mut stripe = stripe.write();
            removed += stripe.series.len();
            stripe.series.clear();
            stripe.hashes.clear();
            stripe.exemplars.clear();
        }

        removed
    }

    /// Walk every live series, one stripe snapshot at a time
    pub fn iter(&self) -> SeriesIter<'_> {
        SeriesIter {
            index: self,
            stripe: 0,
            pending: Vec::new(),
        }
    }
}

/// Iterator over live series. Holds a stripe read lock only while that
/// stripe is being snapshotted, never across yields.
pub struct SeriesIter<'a> {
    index: &'a StripeSeries,
    stripe: usize,
    pending: Vec<Arc<MemSeries>>,
}

impl Iterator for SeriesIter<'_> {
    type Item = Arc<MemSeries>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(series) = self.pending.pop() {
                return Some(series);
            }
            if self.stripe >= self.index.stripes.len() {
                return None;
            }
            let stripe = self.index.stripes[self.stripe].read();
            self.pending.extend(stripe.series.values().cloned());
            self.stripe += 1;
        }
    }
}
