//! Spinlock-guarded ordered maps keyed by integer ids
//!
//! The pipeline keys its bookkeeping by correlation id, cubin id, context
//! id, function id and host-op id. All of those maps share one shape: a
//! top-down splay tree behind a spinlock. Splaying rotates the most recently
//! touched entry to the root, which fits the access pattern here: an entry
//! is hammered for a short window (while its kernel's activities arrive) and
//! then goes cold.
//!
//! Because a splay lookup mutates the tree, readers take the same lock as
//! writers. The lock is held only across pointer swings and, on the insert
//! paths, one node allocation.

use std::cell::UnsafeCell;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::utils::Backoff;

/// Minimal test-and-set spinlock.
///
/// Critical sections in this crate are a handful of pointer swings, short
/// enough that parking would cost more than spinning.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the lock provides exclusive access to `data`
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    pub fn new(value: T) -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, T> {
        let backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        SpinGuard { lock: self }
    }
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

struct Node<K, V> {
    key: K,
    value: V,
    refcnt: i64,
    left: Option<Box<Node<K, V>>>,
    right: Option<Box<Node<K, V>>>,
}

impl<K, V> Node<K, V> {
    fn new(key: K, value: V) -> Box<Self> {
        Box::new(Node {
            key,
            value,
            refcnt: 0,
            left: None,
            right: None,
        })
    }
}

fn rotate_right<K, V>(mut node: Box<Node<K, V>>) -> Box<Node<K, V>> {
    let mut left = match node.left.take() {
        Some(left) => left,
        None => return node,
    };
    node.left = left.right.take();
    left.right = Some(node);
    left
}

fn rotate_left<K, V>(mut node: Box<Node<K, V>>) -> Box<Node<K, V>> {
    let mut right = match node.right.take() {
        Some(right) => right,
        None => return node,
    };
    node.right = right.left.take();
    right.left = Some(node);
    right
}

/// Splay `key` (or the last node on its search path) to the root.
fn splay<K: Ord, V>(root: Option<Box<Node<K, V>>>, key: &K) -> Option<Box<Node<K, V>>> {
    let mut root = root?;
    match key.cmp(&root.key) {
        CmpOrdering::Equal => Some(root),
        CmpOrdering::Less => {
            let Some(mut left) = root.left.take() else {
                return Some(root);
            };
            match key.cmp(&left.key) {
                CmpOrdering::Less => {
                    // zig-zig
                    left.left = splay(left.left.take(), key);
                    root.left = Some(left);
                    root = rotate_right(root);
                    if root.left.is_some() {
                        root = rotate_right(root);
                    }
                }
                CmpOrdering::Greater => {
                    // zig-zag
                    left.right = splay(left.right.take(), key);
                    if left.right.is_some() {
                        left = rotate_left(left);
                    }
                    root.left = Some(left);
                    root = rotate_right(root);
                }
                CmpOrdering::Equal => {
                    root.left = Some(left);
                    root = rotate_right(root);
                }
            }
            Some(root)
        }
        CmpOrdering::Greater => {
            let Some(mut right) = root.right.take() else {
                return Some(root);
            };
            match key.cmp(&right.key) {
                CmpOrdering::Greater => {
                    right.right = splay(right.right.take(), key);
                    root.right = Some(right);
                    root = rotate_left(root);
                    if root.right.is_some() {
                        root = rotate_left(root);
                    }
                }
                CmpOrdering::Less => {
                    right.left = splay(right.left.take(), key);
                    if right.left.is_some() {
                        right = rotate_right(right);
                    }
                    root.right = Some(right);
                    root = rotate_left(root);
                }
                CmpOrdering::Equal => {
                    root.right = Some(right);
                    root = rotate_left(root);
                }
            }
            Some(root)
        }
    }
}

struct Tree<K, V> {
    root: Option<Box<Node<K, V>>>,
    len: usize,
}

/// Attach a fresh node above the splayed root. The caller has already
/// splayed `node.key`'s search path and verified the key is absent.
fn attach_at_root<K: Ord, V>(tree: &mut Tree<K, V>, mut node: Box<Node<K, V>>) {
    match tree.root.take() {
        None => {
            tree.root = Some(node);
        }
        Some(mut root) => {
            match node.key.cmp(&root.key) {
                CmpOrdering::Less => {
                    node.left = root.left.take();
                    node.right = Some(root);
                }
                CmpOrdering::Greater => {
                    node.right = root.right.take();
                    node.left = Some(root);
                }
                CmpOrdering::Equal => unreachable!("caller checked key absence"),
            }
            tree.root = Some(node);
        }
    }
    tree.len += 1;
}

/// Detach the root (already splayed to `key`) and rejoin its subtrees.
fn remove_root<K: Ord, V>(tree: &mut Tree<K, V>, key: &K) -> Option<V> {
    let mut root = tree.root.take()?;
    tree.root = match root.left.take() {
        None => root.right.take(),
        Some(left) => {
            // splay the predecessor of `key` to the top of the left
            // subtree; it has no right child afterwards
            let mut left = splay(Some(left), key)?;
            left.right = root.right.take();
            Some(left)
        }
    };
    tree.len -= 1;
    Some(root.value)
}

/// Concurrent ordered map: top-down splay tree behind a spinlock.
///
/// `insert` rejects duplicate keys by panicking and is reserved for callers
/// that serialize insertion externally (the cubin store's files lock, the
/// per-subsystem creation locks) or hold ids that are unique by
/// construction. Callers racing on first sight of a shared id go through
/// [`SplayMap::get_or_insert_with`], which decides presence and inserts
/// under one lock acquisition.
pub struct SplayMap<K, V> {
    inner: SpinLock<Tree<K, V>>,
}

impl<K, V> SplayMap<K, V>
where
    K: Ord + Copy + fmt::Debug,
{
    pub fn new() -> Self {
        SplayMap {
            inner: SpinLock::new(Tree { root: None, len: 0 }),
        }
    }

    /// Insert a new entry whose key the caller promises is not present.
    ///
    /// # Panics
    ///
    /// Panics if `key` is already present.
    pub fn insert(&self, key: K, value: V) {
        let node = Node::new(key, value);
        let mut tree = self.inner.lock();
        tree.root = splay(tree.root.take(), &key);
        if let Some(root) = &tree.root {
            if root.key == key {
                panic!("duplicate key {key:?} inserted into unique map");
            }
        }
        attach_at_root(&mut tree, node);
    }

    /// Return the value for `key`, inserting one built by `make` if the key
    /// is absent. Presence check and insertion happen under one lock
    /// acquisition, so concurrent first-sight callers race safely: exactly
    /// one `make` result is kept and everyone observes it.
    pub fn get_or_insert_with(&self, key: K, make: impl FnOnce() -> V) -> V
    where
        V: Clone,
    {
        let mut tree = self.inner.lock();
        tree.root = splay(tree.root.take(), &key);
        if let Some(root) = &tree.root {
            if root.key == key {
                return root.value.clone();
            }
        }
        let node = Node::new(key, make());
        let value = node.value.clone();
        attach_at_root(&mut tree, node);
        value
    }

    /// Insert or replace the value for `key` under one lock acquisition.
    pub fn upsert(&self, key: K, value: V) {
        let mut tree = self.inner.lock();
        tree.root = splay(tree.root.take(), &key);
        if let Some(root) = &mut tree.root {
            if root.key == key {
                root.value = value;
                return;
            }
        }
        attach_at_root(&mut tree, Node::new(key, value));
    }

    /// Look up `key`, splaying it to the root on a hit.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let mut tree = self.inner.lock();
        tree.root = splay(tree.root.take(), key);
        match &tree.root {
            Some(root) if root.key == *key => Some(root.value.clone()),
            _ => None,
        }
    }

    /// Run `f` against the entry for `key`, if present.
    pub fn with<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut tree = self.inner.lock();
        tree.root = splay(tree.root.take(), key);
        match &mut tree.root {
            Some(root) if root.key == *key => Some(f(&mut root.value)),
            _ => None,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.with(key, |_| ()).is_some()
    }

    /// Remove and return the entry for `key`.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut tree = self.inner.lock();
        tree.root = splay(tree.root.take(), key);
        match &tree.root {
            Some(root) if root.key == *key => {}
            _ => return None,
        }
        remove_root(&mut tree, key)
    }

    /// Atomically adjust the reference count of `key`'s entry, deleting the
    /// entry when the count reaches zero. Returns the updated count, or
    /// `None` when the key is absent.
    pub fn refcnt_update(&self, key: &K, delta: i64) -> Option<i64> {
        let mut tree = self.inner.lock();
        tree.root = splay(tree.root.take(), key);
        let updated = match &mut tree.root {
            Some(root) if root.key == *key => {
                root.refcnt += delta;
                root.refcnt
            }
            _ => return None,
        };
        if updated == 0 {
            remove_root(&mut tree, key);
        }
        Some(updated)
    }

    /// Snapshot every value, in key order. Used by shutdown paths that
    /// visit all entries (stream workers, context states).
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        fn collect<K, V: Clone>(node: &Option<Box<Node<K, V>>>, out: &mut Vec<V>) {
            if let Some(node) = node {
                collect(&node.left, out);
                out.push(node.value.clone());
                collect(&node.right, out);
            }
        }
        let tree = self.inner.lock();
        let mut values = Vec::with_capacity(tree.len);
        collect(&tree.root, &mut values);
        values
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for SplayMap<K, V>
where
    K: Ord + Copy + fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_insert_get() {
        let map: SplayMap<u32, &str> = SplayMap::new();
        map.insert(5, "five");
        map.insert(1, "one");
        map.insert(9, "nine");

        assert_eq!(map.get(&5), Some("five"));
        assert_eq!(map.get(&1), Some("one"));
        assert_eq!(map.get(&9), Some("nine"));
        assert_eq!(map.get(&7), None);
        assert_eq!(map.len(), 3);
    }

    #[test]
    #[should_panic(expected = "duplicate key")]
    fn test_duplicate_insert_panics() {
        let map: SplayMap<u32, u32> = SplayMap::new();
        map.insert(1, 10);
        map.insert(1, 11);
    }

    #[test]
    fn test_remove() {
        let map: SplayMap<u32, u32> = SplayMap::new();
        for k in [4, 2, 6, 1, 3, 5, 7] {
            map.insert(k, k * 10);
        }
        assert_eq!(map.remove(&4), Some(40));
        assert_eq!(map.remove(&4), None);
        assert_eq!(map.len(), 6);
        for k in [1, 2, 3, 5, 6, 7] {
            assert_eq!(map.get(&k), Some(k * 10));
        }
    }

    #[test]
    fn test_get_or_insert_with() {
        let map: SplayMap<u32, u32> = SplayMap::new();
        assert_eq!(map.get_or_insert_with(1, || 10), 10);
        // present: existing value wins, closure ignored
        assert_eq!(map.get_or_insert_with(1, || 99), 10);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_get_or_insert_with_concurrent_first_sight() {
        // every thread races the same fresh key; exactly one value must win
        // and all threads must observe it
        let map: Arc<SplayMap<u32, u32>> = Arc::new(SplayMap::new());
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let map = map.clone();
                std::thread::spawn(move || map.get_or_insert_with(7, || t))
            })
            .collect();
        let seen: Vec<u32> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();
        let winner = map.get(&7).unwrap();
        assert!(seen.iter().all(|&v| v == winner));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_upsert_inserts_then_replaces() {
        let map: SplayMap<u32, u32> = SplayMap::new();
        map.upsert(1, 10);
        assert_eq!(map.get(&1), Some(10));
        map.upsert(1, 20);
        assert_eq!(map.get(&1), Some(20));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_with_mutates_in_place() {
        let map: SplayMap<u32, Vec<u32>> = SplayMap::new();
        map.insert(1, vec![]);
        map.with(&1, |v| v.push(42));
        map.with(&1, |v| v.push(43));
        assert_eq!(map.get(&1), Some(vec![42, 43]));
        assert_eq!(map.with(&2, |_| ()), None);
    }

    #[test]
    fn test_refcnt_deletes_at_zero() {
        let map: SplayMap<u64, &str> = SplayMap::new();
        map.insert(100, "op");

        assert_eq!(map.refcnt_update(&100, 2), Some(2));
        assert_eq!(map.refcnt_update(&100, -1), Some(1));
        assert!(map.contains(&100));
        assert_eq!(map.refcnt_update(&100, -1), Some(0));
        assert!(!map.contains(&100));
        assert_eq!(map.refcnt_update(&100, 1), None);
    }

    #[test]
    fn test_concurrent_disjoint_inserts() {
        let map: Arc<SplayMap<u32, u32>> = Arc::new(SplayMap::new());
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for i in 0..500u32 {
                        map.insert(t * 1000 + i, i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(map.len(), 2000);
        for t in 0..4u32 {
            for i in (0..500).step_by(97) {
                assert_eq!(map.get(&(t * 1000 + i)), Some(i));
            }
        }
    }

    #[test]
    fn test_concurrent_readers_and_removers() {
        let map: Arc<SplayMap<u32, u32>> = Arc::new(SplayMap::new());
        for i in 0..1000 {
            map.insert(i, i);
        }
        let reader = {
            let map = map.clone();
            std::thread::spawn(move || {
                for i in 0..1000 {
                    // entry is either still there or already removed
                    if let Some(v) = map.get(&i) {
                        assert_eq!(v, i);
                    }
                }
            })
        };
        let remover = {
            let map = map.clone();
            std::thread::spawn(move || {
                for i in (0..1000).step_by(2) {
                    map.remove(&i);
                }
            })
        };
        reader.join().unwrap();
        remover.join().unwrap();
        assert_eq!(map.len(), 500);
    }

    proptest! {
        #[test]
        fn prop_matches_btreemap(ops in prop::collection::vec((0u32..64, any::<bool>()), 0..200)) {
            use std::collections::BTreeMap;

            let map: SplayMap<u32, u32> = SplayMap::new();
            let mut model: BTreeMap<u32, u32> = BTreeMap::new();

            for (key, is_insert) in ops {
                if is_insert {
                    if !model.contains_key(&key) {
                        map.insert(key, key + 1);
                        model.insert(key, key + 1);
                    }
                } else {
                    prop_assert_eq!(map.remove(&key), model.remove(&key));
                }
                prop_assert_eq!(map.len(), model.len());
            }
            for (key, value) in model {
                prop_assert_eq!(map.get(&key), Some(value));
            }
        }
    }
}
