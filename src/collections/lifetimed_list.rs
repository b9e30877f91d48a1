//! A concurrent list whose entries live only as long as their lifetimes.
//!
//! Writers are serialized by a mutex per sublist. Readers never lock: an
//! iterator walks a chain of fixed-size segments, re-reads the published
//! length on every step, and skips entries whose lifetime is no longer
//! alive.
//!
//! Appends write a slot and then publish the new length. A full tail gets
//! a larger segment linked after it. A sweep copies the live entries into
//! one fresh segment and links it after the old tail, so an iterator on the
//! old chain walks into the compacted one. Every entry carries a sequence
//! number, which lets that iterator skip the copies it has already passed.

use crate::lifetime::Lifetime;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

const INITIAL_CAPACITY: usize = 4;
const MAX_SEGMENT_CAPACITY: usize = 1024;

struct Entry<T> {
    seq: u64,
    lifetime: Lifetime,
    value: T,
}

impl<T: Clone> Entry<T> {
    fn clone_entry(&self) -> Self {
        Self {
            seq: self.seq,
            lifetime: self.lifetime.clone(),
            value: self.value.clone(),
        }
    }
}

struct Segment<T> {
    slots: Box<[OnceLock<Entry<T>>]>,
    len: AtomicUsize,
    next: OnceLock<Arc<Segment<T>>>,
}

impl<T> Segment<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| OnceLock::new()).collect(),
            len: AtomicUsize::new(0),
            next: OnceLock::new(),
        }
    }

    /// Appends under the sublist's writer lock. Hands the entry back when full.
    fn push(&self, entry: Entry<T>) -> Result<(), Entry<T>> {
        let len = self.len.load(Ordering::Relaxed);
        let Some(slot) = self.slots.get(len) else {
            return Err(entry);
        };
        slot.set(entry)?;
        self.len.store(len + 1, Ordering::Release);
        Ok(())
    }

    fn get(&self, index: usize) -> Option<&Entry<T>> {
        if index < self.len.load(Ordering::Acquire) {
            self.slots[index].get()
        } else {
            None
        }
    }

    fn entries(&self) -> impl Iterator<Item = &Entry<T>> {
        let len = self.len.load(Ordering::Acquire);
        self.slots[..len].iter().filter_map(OnceLock::get)
    }
}

/// Segments reachable from `head`, in order.
fn segments<T>(head: &Arc<Segment<T>>) -> impl Iterator<Item = &Segment<T>> {
    std::iter::successors(Some(&**head), |&segment| segment.next.get().map(|next| &**next))
}

struct Chain<T> {
    head: Arc<Segment<T>>,
    tail: Arc<Segment<T>>,
    last_seq: u64,
}

struct Sublist<T> {
    chain: Mutex<Chain<T>>,
}

impl<T: Clone> Sublist<T> {
    fn new() -> Self {
        let segment = Arc::new(Segment::with_capacity(INITIAL_CAPACITY));
        Self {
            chain: Mutex::new(Chain {
                head: Arc::clone(&segment),
                tail: segment,
                last_seq: 0,
            }),
        }
    }

    fn snapshot(&self) -> Arc<Segment<T>> {
        Arc::clone(&self.chain.lock().head)
    }

    fn append(&self, lifetime: Lifetime, value: T) {
        let mut chain = self.chain.lock();
        chain.last_seq += 1;
        let entry = Entry {
            seq: chain.last_seq,
            lifetime,
            value,
        };
        let Err(entry) = chain.tail.push(entry) else {
            return;
        };
        let capacity = (chain.tail.slots.len() * 2).min(MAX_SEGMENT_CAPACITY);
        let grown = Arc::new(Segment::with_capacity(capacity));
        // A fresh segment always has room.
        let _ = grown.push(entry);
        let _ = chain.tail.next.set(Arc::clone(&grown));
        chain.tail = grown;
    }

    fn sweep(&self) -> usize {
        let mut chain = self.chain.lock();
        let mut total = 0;
        let mut live = Vec::new();
        for entry in chain_entries(&chain.head) {
            total += 1;
            if entry.lifetime.is_alive() {
                live.push(entry.clone_entry());
            }
        }
        let removed = total - live.len();
        if removed == 0 {
            return 0;
        }
        let compacted = Arc::new(Segment::with_capacity(live.len().max(INITIAL_CAPACITY)));
        for entry in live {
            let _ = compacted.push(entry);
        }
        let _ = chain.tail.next.set(Arc::clone(&compacted));
        chain.head = Arc::clone(&compacted);
        chain.tail = compacted;
        removed
    }
}

fn chain_entries<T>(head: &Arc<Segment<T>>) -> impl Iterator<Item = &Entry<T>> {
    segments(head).flat_map(Segment::entries)
}

struct ListInner<T> {
    priority: Sublist<T>,
    main: Sublist<T>,
}

/// A list of `(lifetime, value)` pairs that drops entries when their
/// lifetime terminates.
///
/// Priority entries are always enumerated before ordinary ones. Within a
/// sublist, entries keep insertion order.
pub struct LifetimedList<T> {
    inner: Arc<ListInner<T>>,
}

impl<T> Clone for LifetimedList<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> LifetimedList<T> {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ListInner {
                priority: Sublist::new(),
                main: Sublist::new(),
            }),
        }
    }

    /// Appends `value` for as long as `lifetime` is alive.
    ///
    /// Does nothing if `lifetime` is already not alive.
    pub fn add(&self, lifetime: &Lifetime, value: T) {
        self.insert(lifetime, value, false);
    }

    /// Appends `value` to the priority sublist.
    pub fn add_priority_item(&self, lifetime: &Lifetime, value: T) {
        self.insert(lifetime, value, true);
    }

    fn insert(&self, lifetime: &Lifetime, value: T, priority: bool) {
        if !lifetime.is_alive() {
            return;
        }
        let sublist = if priority {
            &self.inner.priority
        } else {
            &self.inner.main
        };
        sublist.append(lifetime.clone(), value);
        if lifetime.is_eternal() {
            return;
        }
        let list: Weak<ListInner<T>> = Arc::downgrade(&self.inner);
        let registered = lifetime.try_on_termination(move || {
            if let Some(inner) = list.upgrade() {
                Self { inner }.clear_values_if_not_alive();
            }
        });
        if !registered {
            self.clear_values_if_not_alive();
        }
    }

    /// Drops every entry whose lifetime is no longer alive.
    ///
    /// Running iterators carry on into the compacted entries without
    /// repeating any they have already passed.
    pub fn clear_values_if_not_alive(&self) {
        let removed = self.inner.priority.sweep() + self.inner.main.sweep();
        if removed > 0 {
            tracing::trace!(removed, "swept lifetimed list");
        }
    }

    /// Iterates over `(lifetime, value)` pairs whose lifetime is alive.
    #[must_use]
    pub fn iter(&self) -> Iter<T> {
        Iter {
            list: Arc::clone(&self.inner),
            segment: self.inner.priority.snapshot(),
            in_priority: true,
            index: 0,
            last_seq: 0,
        }
    }

    /// Returns a point-in-time copy of the live values.
    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.iter().map(|(_, value)| value).collect()
    }

    /// Returns true if no live entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for LifetimedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + fmt::Debug + 'static> fmt::Debug for LifetimedList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.values()).finish()
    }
}

impl<T: Clone + Send + Sync + 'static> IntoIterator for &LifetimedList<T> {
    type Item = (Lifetime, T);
    type IntoIter = Iter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over a [`LifetimedList`].
///
/// Sees every entry appended to the sublist it is walking until it
/// reaches the end, including across growth and sweeps.
pub struct Iter<T> {
    list: Arc<ListInner<T>>,
    segment: Arc<Segment<T>>,
    in_priority: bool,
    index: usize,
    last_seq: u64,
}

impl<T: Clone> Iterator for Iter<T> {
    type Item = (Lifetime, T);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.segment.get(self.index) {
                self.index += 1;
                if entry.seq <= self.last_seq {
                    continue;
                }
                self.last_seq = entry.seq;
                if entry.lifetime.is_alive() {
                    return Some((entry.lifetime.clone(), entry.value.clone()));
                }
                continue;
            }
            if let Some(next) = self.segment.next.get() {
                self.segment = Arc::clone(next);
                self.index = 0;
            } else if self.in_priority {
                self.in_priority = false;
                self.segment = self.list.main.snapshot();
                self.index = 0;
                self.last_seq = 0;
            } else {
                return None;
            }
        }
    }
}
