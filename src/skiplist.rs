use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Instant,
};

use parking_lot::{Mutex, MutexGuard, RwLock};
use thiserror::Error;
use tracing::{debug, trace};

/// Number of forward-pointer levels in every tower. Inserted nodes draw their
/// top level from a geometric distribution bounded one below this.
pub const MAX_HEIGHT: usize = 5;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("deadline elapsed during query")]
    DeadlineElapsed,
    #[error("couldn't copy value in query")]
    Copy,
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum NodeKey {
    Head,
    Entry(String),
    Tail,
}

impl NodeKey {
    fn precedes(&self, key: &str) -> bool {
        match self {
            NodeKey::Head => true,
            NodeKey::Entry(own) => own.as_str() < key,
            NodeKey::Tail => false,
        }
    }

    fn matches(&self, key: &str) -> bool {
        matches!(self, NodeKey::Entry(own) if own == key)
    }
}

struct Node<V> {
    key: NodeKey,
    value: RwLock<Option<V>>,
    top_level: usize,
    lock: Mutex<()>,
    marked: AtomicBool,
    fully_linked: AtomicBool,
    // Modification stamp; together with pointer identity it lets a range scan
    // detect that a node changed between its two passes.
    stamp: AtomicU64,
    next: Vec<RwLock<Arc<Node<V>>>>,
}

impl<V> Node<V> {
    fn forward(&self, level: usize) -> Arc<Node<V>> {
        Arc::clone(&self.next[level].read())
    }
}

/// A concurrent ordered map from string keys to values, implemented as a
/// lazy skip list. Lookups and range scans never take the per-node lock;
/// predecessor locking happens only while inserting or unlinking.
pub struct SkipList<V> {
    name: String,
    head: Arc<Node<V>>,
    stamps: AtomicU64,
}

impl<V: Clone> SkipList<V> {
    pub fn new(name: impl Into<String>) -> Self {
        let tail = Arc::new(Node {
            key: NodeKey::Tail,
            value: RwLock::new(None),
            top_level: 0,
            lock: Mutex::new(()),
            marked: AtomicBool::new(false),
            fully_linked: AtomicBool::new(true),
            stamp: AtomicU64::new(0),
            next: Vec::new(),
        });
        let head = Arc::new(Node {
            key: NodeKey::Head,
            value: RwLock::new(None),
            top_level: MAX_HEIGHT - 1,
            lock: Mutex::new(()),
            marked: AtomicBool::new(false),
            fully_linked: AtomicBool::new(true),
            stamp: AtomicU64::new(0),
            next: (0..MAX_HEIGHT)
                .map(|_| RwLock::new(Arc::clone(&tail)))
                .collect(),
        });
        let name = name.into();
        debug!("created new skip list {name}");
        Self {
            name,
            head,
            stamps: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn next_stamp(&self) -> u64 {
        self.stamps.fetch_add(1, Ordering::Relaxed)
    }

    /// Walk the towers, recording the predecessor and successor at every
    /// level, and the highest level at which `key` itself appears.
    fn search(
        &self,
        key: &str,
    ) -> (Option<usize>, Vec<Arc<Node<V>>>, Vec<Arc<Node<V>>>) {
        let mut found = None;
        let mut preds = vec![Arc::clone(&self.head); MAX_HEIGHT];
        let mut succs = vec![Arc::clone(&self.head); MAX_HEIGHT];

        let mut pred = Arc::clone(&self.head);
        for level in (0..MAX_HEIGHT).rev() {
            let mut curr = pred.forward(level);
            while curr.key.precedes(key) {
                pred = curr;
                curr = pred.forward(level);
            }
            if found.is_none() && curr.key.matches(key) {
                found = Some(level);
            }
            preds[level] = Arc::clone(&pred);
            succs[level] = curr;
        }
        (found, preds, succs)
    }

    /// Snapshot read. Returns `None` for absent keys and for keys whose node
    /// is mid-insert or already marked for removal.
    pub fn get(&self, key: &str) -> Option<V> {
        let (found, _, succs) = self.search(key);
        let node = &succs[found?];
        if node.marked.load(Ordering::Acquire) || !node.fully_linked.load(Ordering::Acquire) {
            return None;
        }
        let value = node.value.read().clone();
        value
    }

    /// Insert or modify atomically. `check` runs exactly once while the
    /// target node is exclusively held; its return value becomes the stored
    /// value unless it errors, in which case no state changes. Of any set of
    /// concurrent upserts for one key, exactly one observes `exists = false`.
    pub fn upsert<E, F>(&self, key: &str, mut check: F) -> Result<V, E>
    where
        F: FnMut(&str, Option<&V>, bool) -> Result<V, E>,
    {
        let top_level = random_level(MAX_HEIGHT - 2);
        trace!("chose top level {top_level} for key {key}");
        loop {
            let (found, preds, succs) = self.search(key);
            if let Some(level) = found {
                let node = Arc::clone(&succs[level]);
                if !node.marked.load(Ordering::Acquire) {
                    // A concurrent insert owns this node until it is linked.
                    while !node.fully_linked.load(Ordering::Acquire) {
                        std::hint::spin_loop();
                    }
                    let guard = node.lock.lock();
                    if !node.marked.load(Ordering::Acquire)
                        && node.fully_linked.load(Ordering::Acquire)
                    {
                        node.stamp.store(self.next_stamp(), Ordering::Release);
                        let mut slot = node.value.write();
                        let outcome = check(key, slot.as_ref(), true);
                        return match outcome {
                            Ok(new_value) => {
                                *slot = Some(new_value.clone());
                                drop(slot);
                                drop(guard);
                                Ok(new_value)
                            }
                            Err(err) => {
                                drop(slot);
                                drop(guard);
                                Err(err)
                            }
                        };
                    }
                    drop(guard);
                }
                // Node is being removed; retry from the top.
                continue;
            }

            let mut valid = true;
            let mut guards: Vec<MutexGuard<'_, ()>> = Vec::new();
            let mut locked: Vec<&Arc<Node<V>>> = Vec::new();
            for level in 0..=top_level {
                let pred = &preds[level];
                if !locked.iter().any(|p| Arc::ptr_eq(p, pred)) {
                    guards.push(pred.lock.lock());
                    locked.push(pred);
                }
                let unmarked = !pred.marked.load(Ordering::Acquire)
                    && !succs[level].marked.load(Ordering::Acquire);
                let connected = Arc::ptr_eq(&pred.forward(level), &succs[level]);
                if !(unmarked && connected) {
                    valid = false;
                    break;
                }
            }
            if !valid {
                drop(guards);
                continue;
            }

            let value = match check(key, None, false) {
                Ok(value) => value,
                Err(err) => return Err(err),
            };

            let node = Arc::new(Node {
                key: NodeKey::Entry(key.to_string()),
                value: RwLock::new(Some(value.clone())),
                top_level,
                lock: Mutex::new(()),
                marked: AtomicBool::new(false),
                fully_linked: AtomicBool::new(false),
                stamp: AtomicU64::new(self.next_stamp()),
                next: (0..=top_level)
                    .map(|level| RwLock::new(Arc::clone(&succs[level])))
                    .collect(),
            });
            // Link bottom up; the node is visible but not findable until the
            // fully_linked flag flips.
            for level in 0..=top_level {
                *preds[level].next[level].write() = Arc::clone(&node);
            }
            node.fully_linked.store(true, Ordering::Release);
            trace!("new node with key {key} fully linked");
            return Ok(value);
        }
    }

    /// Mark and unlink. Returns the removed value, or `None` when the key is
    /// absent, mid-insert, or already claimed by another remover.
    pub fn remove(&self, key: &str) -> Option<V> {
        loop {
            let (found, _, succs) = self.search(key);
            let level = found?;
            let victim = Arc::clone(&succs[level]);
            if !victim.fully_linked.load(Ordering::Acquire) {
                return None;
            }
            if victim.marked.load(Ordering::Acquire) {
                return None;
            }
            if victim.top_level != level {
                return None;
            }
            let top_level = victim.top_level;
            let victim_guard = victim.lock.lock();
            if victim.marked.load(Ordering::Acquire) {
                // Another remove claimed the node first.
                return None;
            }
            victim.marked.store(true, Ordering::Release);

            loop {
                let (_, preds, _) = self.search(key);
                let mut valid = true;
                let mut guards: Vec<MutexGuard<'_, ()>> = Vec::new();
                let mut locked: Vec<&Arc<Node<V>>> = Vec::new();
                for level in 0..=top_level {
                    let pred = &preds[level];
                    if !locked.iter().any(|p| Arc::ptr_eq(p, pred)) {
                        guards.push(pred.lock.lock());
                        locked.push(pred);
                    }
                    let connected = Arc::ptr_eq(&pred.forward(level), &victim);
                    if pred.marked.load(Ordering::Acquire) || !connected {
                        valid = false;
                        break;
                    }
                }
                if !valid {
                    drop(guards);
                    continue;
                }

                for level in (0..=top_level).rev() {
                    let successor = victim.forward(level);
                    *preds[level].next[level].write() = successor;
                }
                let value = victim.value.read().clone();
                drop(victim_guard);
                trace!("removed node with key {key}");
                return value;
            }
        }
    }

    /// Stable snapshot of every entry with `low <= key <= high` (inclusive).
    /// Scans the bottom level twice and retries until both passes see the
    /// same nodes with the same modification stamps, or the deadline passes.
    pub fn query(
        &self,
        deadline: Option<Instant>,
        low: &str,
        high: &str,
        copier: impl Fn(&V) -> Option<V>,
    ) -> Result<(Vec<String>, Vec<V>), QueryError> {
        loop {
            if let Some(limit) = deadline {
                if Instant::now() > limit {
                    debug!("deadline passed during query of {}", self.name);
                    return Err(QueryError::DeadlineElapsed);
                }
            }

            let mut seen: Vec<(Arc<Node<V>>, u64)> = Vec::new();
            let mut keys = Vec::new();
            let mut values = Vec::new();
            let mut curr = self.head.forward(0);
            loop {
                let entry = match &curr.key {
                    NodeKey::Entry(entry) => entry.clone(),
                    _ => break,
                };
                if entry.as_str() > high {
                    break;
                }
                if entry.as_str() >= low && !curr.marked.load(Ordering::Acquire) {
                    let stamp = curr.stamp.load(Ordering::Acquire);
                    let copied = curr
                        .value
                        .read()
                        .as_ref()
                        .and_then(&copier)
                        .ok_or(QueryError::Copy)?;
                    keys.push(entry);
                    values.push(copied);
                    seen.push((Arc::clone(&curr), stamp));
                }
                let next = curr.forward(0);
                curr = next;
            }

            let mut matched = true;
            let mut index = 0;
            let mut curr = self.head.forward(0);
            loop {
                let entry = match &curr.key {
                    NodeKey::Entry(entry) => entry.as_str(),
                    _ => break,
                };
                if entry > high {
                    break;
                }
                if entry >= low && !curr.marked.load(Ordering::Acquire) {
                    let same = index < seen.len()
                        && Arc::ptr_eq(&curr, &seen[index].0)
                        && curr.stamp.load(Ordering::Acquire) == seen[index].1;
                    if !same {
                        matched = false;
                        break;
                    }
                    index += 1;
                }
                let next = curr.forward(0);
                curr = next;
            }

            if matched && index == seen.len() {
                return Ok((keys, values));
            }
        }
    }
}

/// Geometric draw: returns `n` with probability 0.5^(n + 1) for `n < up_to`,
/// the leftover mass lands on `up_to`.
fn random_level(up_to: usize) -> usize {
    let draw: f64 = rand::random();
    let mut n = 0;
    while n < up_to {
        if draw > 0.5_f64.powi(n as i32 + 1) {
            return n;
        }
        n += 1;
    }
    up_to
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    fn add_three(
        _key: &str,
        current: Option<&i64>,
        exists: bool,
    ) -> Result<i64, std::convert::Infallible> {
        if exists {
            Ok(current.copied().unwrap_or(0) + 3)
        } else {
            Ok(3)
        }
    }

    #[test]
    fn upsert_find_and_remove_single_thread() {
        let list: SkipList<i64> = SkipList::new("basic");
        for key in ["1", "2", "3", "4"] {
            let value = list.upsert(key, add_three).expect("upsert succeeds");
            assert_eq!(value, 3);
            assert_eq!(list.get(key), Some(3));
        }

        let value = list.upsert("4", add_three).expect("second upsert succeeds");
        assert_eq!(value, 6);
        assert_eq!(list.get("4"), Some(6));

        assert_eq!(list.remove("2"), Some(3));
        assert_eq!(list.remove("2"), None);
        assert_eq!(list.get("2"), None);
        assert_eq!(list.get("3"), Some(3));
    }

    #[test]
    fn check_error_leaves_list_unchanged() {
        let list: SkipList<i64> = SkipList::new("errors");
        let result: Result<i64, &str> = list.upsert("a", |_, _, _| Err("rejected"));
        assert_eq!(result.unwrap_err(), "rejected");
        assert_eq!(list.get("a"), None);

        list.upsert("a", add_three).expect("insert succeeds");
        let result: Result<i64, &str> = list.upsert("a", |_, _, _| Err("rejected"));
        assert_eq!(result.unwrap_err(), "rejected");
        assert_eq!(list.get("a"), Some(3), "failed check must not modify");
    }

    #[test]
    fn query_returns_inclusive_range_in_order() {
        let list: SkipList<i64> = SkipList::new("range");
        for key in ["alpha", "bravo", "charlie", "delta", "echo"] {
            list.upsert(key, add_three).expect("insert succeeds");
        }
        let (keys, values) = list
            .query(None, "bravo", "delta", |v| Some(*v))
            .expect("query succeeds");
        assert_eq!(keys, vec!["bravo", "charlie", "delta"]);
        assert_eq!(values.len(), 3);

        let (keys, _) = list
            .query(None, "", "\u{10FFFF}", |v| Some(*v))
            .expect("query succeeds");
        assert_eq!(keys.len(), 5);
    }

    #[test]
    fn query_with_low_bound_above_first_key_still_scans() {
        let list: SkipList<i64> = SkipList::new("bounds");
        for key in ["a", "b", "c", "d"] {
            list.upsert(key, add_three).expect("insert succeeds");
        }
        let (keys, _) = list
            .query(None, "c", "\u{10FFFF}", |v| Some(*v))
            .expect("query succeeds");
        assert_eq!(keys, vec!["c", "d"]);
    }

    #[test]
    fn query_copier_failure_is_fatal() {
        let list: SkipList<i64> = SkipList::new("copyfail");
        list.upsert("a", add_three).expect("insert succeeds");
        let err = list.query(None, "", "\u{10FFFF}", |_| None).unwrap_err();
        assert!(matches!(err, QueryError::Copy));
    }

    #[test]
    fn expired_deadline_fails_query() {
        let list: SkipList<i64> = SkipList::new("deadline");
        list.upsert("a", add_three).expect("insert succeeds");
        let past = Instant::now() - Duration::from_millis(10);
        // An already-expired deadline must fail rather than loop.
        let err = list
            .query(Some(past), "", "\u{10FFFF}", |v| Some(*v))
            .unwrap_err();
        assert!(matches!(err, QueryError::DeadlineElapsed));
    }

    #[test]
    fn concurrent_inserts_create_each_key_exactly_once() {
        let list: Arc<SkipList<usize>> = Arc::new(SkipList::new("concurrent"));
        let creations = Arc::new(AtomicUsize::new(0));
        let threads = 8;
        let keys_per_thread = 50;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let list = Arc::clone(&list);
                let creations = Arc::clone(&creations);
                std::thread::spawn(move || {
                    for i in 0..keys_per_thread {
                        // Every thread upserts every key; the index must let
                        // exactly one of them observe exists = false.
                        let key = format!("key-{i:04}");
                        list.upsert::<std::convert::Infallible, _>(&key, |_, current, exists| {
                            if exists {
                                Ok(current.copied().unwrap_or(0) + 1)
                            } else {
                                creations.fetch_add(1, Ordering::SeqCst);
                                Ok(1)
                            }
                        })
                        .expect("upsert succeeds");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread completes");
        }

        assert_eq!(creations.load(Ordering::SeqCst), keys_per_thread);
        let (keys, values) = list
            .query(None, "", "\u{10FFFF}", |v| Some(*v))
            .expect("query succeeds");
        assert_eq!(keys.len(), keys_per_thread);
        let distinct: HashSet<_> = keys.iter().collect();
        assert_eq!(distinct.len(), keys_per_thread);
        assert!(values.iter().all(|count| *count == threads));
    }

    #[test]
    fn concurrent_insert_remove_never_tears_reads() {
        let list: Arc<SkipList<u64>> = Arc::new(SkipList::new("torn"));
        let writer = {
            let list = Arc::clone(&list);
            std::thread::spawn(move || {
                for round in 0..500u64 {
                    list.upsert::<std::convert::Infallible, _>("contended", |_, _, _| {
                        Ok(round * 2)
                    })
                    .expect("upsert succeeds");
                    if round % 3 == 0 {
                        list.remove("contended");
                    }
                }
            })
        };
        let reader = {
            let list = Arc::clone(&list);
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    if let Some(value) = list.get("contended") {
                        assert_eq!(value % 2, 0, "observed a torn value");
                    }
                }
            })
        };
        writer.join().expect("writer completes");
        reader.join().expect("reader completes");
    }

    #[test]
    fn query_snapshot_is_atomic_under_writes() {
        let list: Arc<SkipList<u64>> = Arc::new(SkipList::new("snapshot"));
        for i in 0..20u64 {
            let key = format!("k{i:02}");
            list.upsert::<std::convert::Infallible, _>(&key, move |_, _, _| Ok(i))
                .expect("insert succeeds");
        }
        let stop = Arc::new(AtomicBool::new(false));
        let churn = {
            let list = Arc::clone(&list);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut round = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let key = format!("k{:02}", round % 20);
                    list.upsert::<std::convert::Infallible, _>(&key, |_, current, _| {
                        Ok(current.copied().unwrap_or(0) + 1)
                    })
                    .expect("upsert succeeds");
                    round += 1;
                }
            })
        };

        for _ in 0..50 {
            let deadline = Instant::now() + Duration::from_secs(5);
            let (keys, values) = list
                .query(Some(deadline), "", "\u{10FFFF}", |v| Some(*v))
                .expect("query succeeds");
            assert_eq!(keys.len(), values.len());
            // Keys stay sorted and unique in every snapshot.
            let mut sorted = keys.clone();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted, keys);
        }
        stop.store(true, Ordering::Relaxed);
        churn.join().expect("churn thread completes");
    }
}
