//! Lock-free bidirectional channels between pipeline threads
//!
//! A channel is two unordered stacks, one per [`Direction`]. The producer of
//! a direction CAS-splices nodes onto that direction's shared head; the
//! single consumer *steals* the whole chain with one atomic exchange and
//! drains it from a private head no other thread touches. Per-consume
//! synchronization cost is therefore one exchange regardless of chain
//! length.
//!
//! Nodes are never returned to the allocator. After consumption a node is
//! pushed onto the opposite direction, where the original producer reclaims
//! it for its next record; a channel in steady state allocates nothing.
//! Keeping nodes alive forever is also what makes the CAS loops ABA-safe: a
//! node's address can only reappear at a shared head after the unique
//! consumer of that direction has unlinked it, so no racing consumer can
//! observe a stale `next` pointer.
//!
//! Three instantiations exist in the pipeline:
//!
//! * activity channel: monitor thread produces, owning app thread consumes
//! * correlation channel: app thread produces, monitor thread consumes
//! * trace channel: monitor thread produces, stream worker consumes
//!
//! Within one direction, records stolen in one exchange drain in LIFO
//! order; records carry their own ids and timestamps, so no consumer relies
//! on channel order.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

/// The two directions of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Producer → consumer: carries live records
    Forward,
    /// Consumer → producer: carries spent nodes for reuse
    Backward,
}

struct Node<T> {
    /// Owned by whichever thread holds the node; only read after the node
    /// has been acquired from a head
    next: *mut Node<T>,
    entry: Option<T>,
}

/// One direction: a shared head written by the producer side and a private
/// head owned by the direction's unique consumer.
struct Side<T> {
    shared: CachePadded<AtomicPtr<Node<T>>>,
    private: AtomicPtr<Node<T>>,
}

impl<T> Side<T> {
    fn new() -> Self {
        Side {
            shared: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            private: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn push(&self, node: *mut Node<T>) {
        let mut head = self.shared.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` is exclusively owned by this thread until the
            // CAS below publishes it
            unsafe { (*node).next = head };
            match self
                .shared
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }
    }

    /// Move the shared chain to the private head. Called only by the
    /// direction's unique consumer, and only when the private chain is
    /// empty.
    fn steal(&self) {
        if self.private.load(Ordering::Relaxed).is_null() {
            let chain = self.shared.swap(ptr::null_mut(), Ordering::Acquire);
            self.private.store(chain, Ordering::Relaxed);
        }
    }

    /// Pop one node from the private chain. Called only by the unique
    /// consumer; no CAS needed because nothing else touches `private`.
    fn pop(&self) -> *mut Node<T> {
        let head = self.private.load(Ordering::Relaxed);
        if head.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: the node was published with Release by `push` and acquired
        // by `steal`; this consumer now owns it
        let next = unsafe { (*head).next };
        self.private.store(next, Ordering::Relaxed);
        head
    }
}

/// Lock-free bidirectional channel.
///
/// Discipline (not enforced by the type system, asserted by the pipeline's
/// thread structure): each direction has exactly one consumer. The forward
/// consumer is the receiving thread; the backward consumer is the producing
/// thread reclaiming spent nodes.
pub struct BiChannel<T> {
    forward: Side<T>,
    backward: Side<T>,
    _marker: PhantomData<T>,
}

impl<T> std::fmt::Debug for BiChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BiChannel").finish_non_exhaustive()
    }
}

// SAFETY: nodes transfer ownership of `T` across threads through
// acquire/release pairs on the heads
unsafe impl<T: Send> Send for BiChannel<T> {}
unsafe impl<T: Send> Sync for BiChannel<T> {}

impl<T> BiChannel<T> {
    pub fn new() -> Self {
        BiChannel {
            forward: Side::new(),
            backward: Side::new(),
            _marker: PhantomData,
        }
    }

    fn side(&self, direction: Direction) -> &Side<T> {
        match direction {
            Direction::Forward => &self.forward,
            Direction::Backward => &self.backward,
        }
    }

    /// Reclaim a spent node from the backward direction, or allocate the
    /// channel's very first nodes before steady state is reached.
    fn acquire_node(&self) -> *mut Node<T> {
        let mut node = self.backward.pop();
        if node.is_null() {
            self.backward.steal();
            node = self.backward.pop();
        }
        if node.is_null() {
            node = Box::into_raw(Box::new(Node {
                next: ptr::null_mut(),
                entry: None,
            }));
        }
        node
    }

    /// Publish one record on the forward direction (producer side).
    pub fn produce(&self, value: T) {
        let node = self.acquire_node();
        // SAFETY: the node came from `acquire_node`, so this thread owns it
        unsafe { (*node).entry = Some(value) };
        self.forward.push(node);
    }

    /// Drain every record currently visible on the forward direction
    /// (consumer side), recycling nodes to the backward direction. Returns
    /// the number of records handled.
    pub fn consume(&self, mut handle: impl FnMut(T)) -> usize {
        let mut handled = 0;
        loop {
            self.forward.steal();
            let node = self.forward.pop();
            if node.is_null() {
                break;
            }
            // SAFETY: this thread is the forward consumer and owns the node
            // until it is pushed backward
            if let Some(value) = unsafe { (*node).entry.take() } {
                handle(value);
                handled += 1;
            }
            self.backward.push(node);
        }
        handled
    }

    /// Number of records currently staged on the forward shared head.
    /// Advisory only; racing producers may change it immediately.
    pub fn forward_depth(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.forward.shared.load(Ordering::Acquire);
        while !cursor.is_null() {
            count += 1;
            // SAFETY: nodes are never freed while the channel is alive
            cursor = unsafe { (*cursor).next };
        }
        count
    }
}

impl<T> Default for BiChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for BiChannel<T> {
    fn drop(&mut self) {
        // exclusive access: free every chain
        for direction in [Direction::Forward, Direction::Backward] {
            let side = self.side(direction);
            for head in [
                side.shared.swap(ptr::null_mut(), Ordering::Relaxed),
                side.private.swap(ptr::null_mut(), Ordering::Relaxed),
            ] {
                let mut cursor = head;
                while !cursor.is_null() {
                    // SAFETY: `&mut self` guarantees no other thread holds
                    // references into the chains
                    let node = unsafe { Box::from_raw(cursor) };
                    cursor = node.next;
                }
            }
        }
    }
}

/// Registry of per-thread channels the monitor thread sweeps.
///
/// Threads register once, on first use; nothing ever unregisters (a thread
/// that exits leaves an empty channel behind, which sweeps in constant
/// time). Registration CAS-splices onto a singly linked list, so sweeping
/// requires no lock.
pub struct ChannelSet<T> {
    head: AtomicPtr<SetNode<T>>,
}

struct SetNode<T> {
    channel: Arc<BiChannel<T>>,
    next: *mut SetNode<T>,
}

// SAFETY: list nodes are immutable after publication
unsafe impl<T: Send> Send for ChannelSet<T> {}
unsafe impl<T: Send> Sync for ChannelSet<T> {}

impl<T> ChannelSet<T> {
    pub fn new() -> Self {
        ChannelSet {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Register a thread's channel with the sweep set.
    pub fn register(&self, channel: Arc<BiChannel<T>>) {
        let node = Box::into_raw(Box::new(SetNode {
            channel,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: node is unpublished until the CAS succeeds
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }
    }

    /// Visit every registered channel.
    pub fn for_each(&self, mut f: impl FnMut(&BiChannel<T>)) {
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            // SAFETY: set nodes are never freed while the set is alive
            let node = unsafe { &*cursor };
            f(&node.channel);
            cursor = node.next;
        }
    }

    /// Consume every registered channel, in registration-reversed order.
    pub fn consume_all(&self, mut handle: impl FnMut(T)) -> usize {
        let mut handled = 0;
        self.for_each(|channel| {
            handled += channel.consume(&mut handle);
        });
        handled
    }

    pub fn channel_count(&self) -> usize {
        let mut count = 0;
        self.for_each(|_| count += 1);
        count
    }
}

impl<T> Default for ChannelSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for ChannelSet<T> {
    fn drop(&mut self) {
        let mut cursor = self.head.swap(ptr::null_mut(), Ordering::Relaxed);
        while !cursor.is_null() {
            // SAFETY: `&mut self` guarantees exclusive access
            let node = unsafe { Box::from_raw(cursor) };
            cursor = node.next;
        }
    }
}
