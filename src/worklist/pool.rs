//! Concurrent intrusive pools of chunks.
//!
//! A pool holds *full* (or flushed) chunks for other workers to take. The
//! link lives inside the chunk, so pools never allocate. Two shapes with
//! the same interface:
//!
//! - [`ChunkStack`] — LIFO. Publishing is a plain CAS loop on the head;
//!   removal takes a thin lock so the successor read cannot race a
//!   concurrent removal of the same node (the lock, not a tagged pointer,
//!   is what makes the head CAS ABA-safe).
//! - [`ChunkQueue`] — FIFO. Head and tail move under the same thin lock.
//!
//! Uncontended cost is what matters: a worker touches a pool once per
//! chunk, not once per item.

use std::ptr::{self, NonNull};

use crate::sync::{AtomicPtr, Ordering};
use crate::util::PaddedLock;

/// A node that carries its own pool link.
///
/// # Safety
///
/// `link` must return the same embedded `AtomicPtr` for the lifetime of the
/// node, and the node must not be moved or freed while a pool references it.
pub unsafe trait PoolNode: Sized {
    fn link(&self) -> &AtomicPtr<Self>;
}

pub trait ChunkPool<C: PoolNode>: Default + Send + Sync {
    /// Hand a node to the pool. The caller gives up ownership.
    fn push(&self, node: NonNull<C>);

    /// Take one node out, becoming its sole owner.
    fn pop(&self) -> Option<NonNull<C>>;

    /// A racy emptiness hint; exact only in quiescent states.
    fn is_empty(&self) -> bool;
}

/// LIFO pool: the most recently published chunk is taken first.
pub struct ChunkStack<C> {
    head: AtomicPtr<C>,
    pop_lock: PaddedLock,
}

impl<C> Default for ChunkStack<C> {
    fn default() -> Self {
        ChunkStack {
            head: AtomicPtr::new(ptr::null_mut()),
            pop_lock: PaddedLock::new(),
        }
    }
}

impl<C: PoolNode + Send> ChunkPool<C> for ChunkStack<C> {
    fn push(&self, node: NonNull<C>) {
        let node_ptr = node.as_ptr();
        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe { (*node_ptr).link().store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(head, node_ptr, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    fn pop(&self) -> Option<NonNull<C>> {
        if self.head.load(Ordering::Acquire).is_null() {
            return None;
        }

        self.pop_lock.lock();
        let taken = loop {
            let head = self.head.load(Ordering::Acquire);
            let Some(head_ref) = (unsafe { head.as_ref() }) else {
                break None;
            };
            // Removals are serialized by the lock, so `head` stays in the
            // list and its link is stable here; only the CAS below can still
            // lose to a concurrent push, which never reuses this node.
            let next = head_ref.link().load(Ordering::Relaxed);
            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break NonNull::new(head);
            }
        };
        self.pop_lock.unlock();
        taken
    }

    fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

/// FIFO pool: the oldest published chunk is taken first.
pub struct ChunkQueue<C> {
    lock: PaddedLock,
    head: AtomicPtr<C>,
    tail: AtomicPtr<C>,
}

impl<C> Default for ChunkQueue<C> {
    fn default() -> Self {
        ChunkQueue {
            lock: PaddedLock::new(),
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl<C: PoolNode + Send> ChunkPool<C> for ChunkQueue<C> {
    fn push(&self, node: NonNull<C>) {
        let node_ptr = node.as_ptr();
        unsafe { (*node_ptr).link().store(ptr::null_mut(), Ordering::Relaxed) };

        self.lock.lock();
        let tail = self.tail.load(Ordering::Relaxed);
        if tail.is_null() {
            self.head.store(node_ptr, Ordering::Release);
        } else {
            unsafe { (*tail).link().store(node_ptr, Ordering::Relaxed) };
        }
        self.tail.store(node_ptr, Ordering::Relaxed);
        self.lock.unlock();
    }

    fn pop(&self) -> Option<NonNull<C>> {
        if self.head.load(Ordering::Acquire).is_null() {
            return None;
        }

        self.lock.lock();
        let head = self.head.load(Ordering::Relaxed);
        let taken = match unsafe { head.as_ref() } {
            None => None,
            Some(head_ref) => {
                let next = head_ref.link().load(Ordering::Relaxed);
                self.head.store(next, Ordering::Release);
                if next.is_null() {
                    self.tail.store(ptr::null_mut(), Ordering::Relaxed);
                }
                NonNull::new(head)
            }
        };
        self.lock.unlock();
        taken
    }

    fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

#[cfg(test)]
mod test_node {
    use super::*;

    pub struct TestNode {
        pub value: usize,
        link: AtomicPtr<TestNode>,
    }

    impl TestNode {
        pub fn boxed(value: usize) -> NonNull<TestNode> {
            let node = Box::new(TestNode {
                value,
                link: AtomicPtr::new(std::ptr::null_mut()),
            });
            NonNull::new(Box::into_raw(node)).unwrap()
        }

        pub fn unbox(node: NonNull<TestNode>) -> usize {
            unsafe { Box::from_raw(node.as_ptr()).value }
        }
    }

    unsafe impl PoolNode for TestNode {
        fn link(&self) -> &AtomicPtr<TestNode> {
            &self.link
        }
    }
}


#[cfg(loom)]
mod loom_tests {
    use super::test_node::TestNode;
    use super::*;

    // Two pushers and a popper: nothing lost, nothing duplicated.
    #[test]
    fn stack_push_pop_interleavings() {
        loom::model(|| {
            let pool = crate::sync::Arc::new(ChunkStack::<TestNode>::default());

            let mut handles = Vec::new();
            for value in [1usize, 2] {
                let pool = pool.clone();
                handles.push(loom::thread::spawn(move || {
                    pool.push(TestNode::boxed(value));
                }));
            }

            let popper = {
                let pool = pool.clone();
                loom::thread::spawn(move || pool.pop().map(TestNode::unbox))
            };

            for handle in handles {
                handle.join().unwrap();
            }
            let got = popper.join().unwrap();

            let mut remaining = Vec::new();
            while let Some(node) = pool.pop() {
                remaining.push(TestNode::unbox(node));
            }

            let mut all: Vec<usize> = got.into_iter().chain(remaining).collect();
            all.sort_unstable();
            assert_eq!(all, vec![1, 2]);
        });
    }
}
