//! The fixed-capacity ring at the heart of every chunk.

use std::mem::MaybeUninit;

/// A ring of up to `N` items supporting pushes and pops at both ends.
///
/// Items keep their push order; this is what gives the chunked work-lists
/// their within-chunk FIFO/LIFO guarantees. Not a concurrent structure —
/// a ring is always owned by exactly one worker or pool at a time.
pub struct FixedRing<T, const N: usize> {
    buffer: [MaybeUninit<T>; N],
    start: usize,
    len: usize,
}

impl<T, const N: usize> FixedRing<T, N> {
    pub fn new() -> Self {
        FixedRing {
            buffer: [const { MaybeUninit::uninit() }; N],
            start: 0,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == N
    }

    /// Append at the back; hands the item back when full.
    #[inline]
    pub fn push_back(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        let index = (self.start + self.len) % N;
        self.buffer[index].write(item);
        self.len += 1;
        Ok(())
    }

    /// Prepend at the front; hands the item back when full.
    #[inline]
    pub fn push_front(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.start = (self.start + N - 1) % N;
        self.buffer[self.start].write(item);
        self.len += 1;
        Ok(())
    }

    #[inline]
    pub fn pop_back(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        self.len -= 1;
        let index = (self.start + self.len) % N;
        Some(unsafe { self.buffer[index].assume_init_read() })
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let item = unsafe { self.buffer[self.start].assume_init_read() };
        self.start = (self.start + 1) % N;
        self.len -= 1;
        Some(item)
    }
}

impl<T, const N: usize> Drop for FixedRing<T, N> {
    fn drop(&mut self) {
        while self.pop_front().is_some() {}
    }
}

impl<T, const N: usize> Default for FixedRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn back_to_back_is_lifo() {
        let mut ring: FixedRing<u32, 4> = FixedRing::new();
        ring.push_back(1).unwrap();
        ring.push_back(2).unwrap();
        ring.push_back(3).unwrap();

        assert_eq!(ring.pop_back(), Some(3));
        assert_eq!(ring.pop_back(), Some(2));
        assert_eq!(ring.pop_back(), Some(1));
        assert_eq!(ring.pop_back(), None);
    }

    #[test]
    fn back_to_front_is_fifo() {
        let mut ring: FixedRing<u32, 4> = FixedRing::new();
        ring.push_back(1).unwrap();
        ring.push_back(2).unwrap();
        ring.push_back(3).unwrap();

        assert_eq!(ring.pop_front(), Some(1));
        assert_eq!(ring.pop_front(), Some(2));
        assert_eq!(ring.pop_front(), Some(3));
        assert_eq!(ring.pop_front(), None);
    }

    #[test]
    fn full_ring_returns_the_item() {
        let mut ring: FixedRing<u32, 2> = FixedRing::new();
        ring.push_back(1).unwrap();
        ring.push_back(2).unwrap();
        assert!(ring.is_full());
        assert_eq!(ring.push_back(3), Err(3));
        assert_eq!(ring.push_front(4), Err(4));
    }

    #[test]
    fn wraps_around_without_confusion() {
        let mut ring: FixedRing<u32, 3> = FixedRing::new();
        for round in 0..10u32 {
            ring.push_back(round).unwrap();
            ring.push_back(round + 100).unwrap();
            assert_eq!(ring.pop_front(), Some(round));
            assert_eq!(ring.pop_front(), Some(round + 100));
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn drops_leftover_items() {
        use std::rc::Rc;

        let marker = Rc::new(());
        let mut ring: FixedRing<Rc<()>, 8> = FixedRing::new();
        for _ in 0..5 {
            ring.push_back(marker.clone()).unwrap();
        }
        ring.pop_back();
        drop(ring);
        assert_eq!(Rc::strong_count(&marker), 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use std::collections::VecDeque;

        #[derive(Debug, Clone)]
        enum Op {
            PushBack(u32),
            PushFront(u32),
            PopBack,
            PopFront,
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                any::<u32>().prop_map(Op::PushBack),
                any::<u32>().prop_map(Op::PushFront),
                Just(Op::PopBack),
                Just(Op::PopFront),
            ]
        }

        proptest! {
            // The ring behaves exactly like a size-capped VecDeque.
            #[test]
            fn matches_a_deque_model(ops in proptest::collection::vec(op_strategy(), 0..200)) {
                let mut ring: FixedRing<u32, 7> = FixedRing::new();
                let mut model: VecDeque<u32> = VecDeque::new();

                for op in ops {
                    match op {
                        Op::PushBack(v) => {
                            let expect = if model.len() < 7 { model.push_back(v); Ok(()) } else { Err(v) };
                            prop_assert_eq!(ring.push_back(v), expect);
                        }
                        Op::PushFront(v) => {
                            let expect = if model.len() < 7 { model.push_front(v); Ok(()) } else { Err(v) };
                            prop_assert_eq!(ring.push_front(v), expect);
                        }
                        Op::PopBack => prop_assert_eq!(ring.pop_back(), model.pop_back()),
                        Op::PopFront => prop_assert_eq!(ring.pop_front(), model.pop_front()),
                    }
                    prop_assert_eq!(ring.len(), model.len());
                }
            }
        }
    }
}
