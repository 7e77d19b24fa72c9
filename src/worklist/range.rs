//! Seeding a work-list from an initial range.
//!
//! Every worker pushes its own share of the seed, so a big initial range
//! never funnels through one thread. The range type decides what "share"
//! means; the work-list just pushes whatever the local iterator yields.

use crate::core::context::Context;

pub trait InitialRange<T> {
    type Iter<'a>: Iterator<Item = T>
    where
        Self: 'a;

    /// The calling worker's share of the seed.
    fn local_iter<'a>(&'a self, ctx: &Context) -> Self::Iter<'a>;
}

/// The empty seed: a foreach with no initial range starts from whatever the
/// work-list already holds.
impl<T> InitialRange<T> for () {
    type Iter<'a>
        = std::iter::Empty<T>
    where
        Self: 'a;

    fn local_iter<'a>(&'a self, _ctx: &Context) -> Self::Iter<'a> {
        std::iter::empty()
    }
}

fn block(len: usize, ctx: &Context) -> (usize, usize) {
    let n = ctx.num_workers();
    let i = ctx.index();
    (i * len / n, (i + 1) * len / n)
}

/// Partition a slice into contiguous per-worker blocks.
pub struct BlockedRange<'s, T> {
    items: &'s [T],
}

impl<'s, T> BlockedRange<'s, T> {
    pub fn new(items: &'s [T]) -> Self {
        BlockedRange { items }
    }
}

impl<'s, T: Clone> InitialRange<T> for BlockedRange<'s, T> {
    type Iter<'a>
        = std::iter::Cloned<std::slice::Iter<'a, T>>
    where
        Self: 'a;

    fn local_iter<'a>(&'a self, ctx: &Context) -> Self::Iter<'a> {
        let (begin, end) = block(self.items.len(), ctx);
        self.items[begin..end].iter().cloned()
    }
}

/// Partition an index range into contiguous per-worker blocks.
pub struct BlockedIndices {
    range: std::ops::Range<usize>,
}

impl BlockedIndices {
    pub fn new(range: std::ops::Range<usize>) -> Self {
        BlockedIndices { range }
    }
}

impl InitialRange<usize> for BlockedIndices {
    type Iter<'a>
        = std::ops::Range<usize>
    where
        Self: 'a;

    fn local_iter<'a>(&'a self, ctx: &Context) -> Self::Iter<'a> {
        let (begin, end) = block(self.range.len(), ctx);
        self.range.start + begin..self.range.start + end
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::core::topology::Topology;

    #[test]
    fn blocks_cover_without_overlap() {
        let topo = Topology::detect();
        let items: Vec<u32> = (0..103).collect();
        let range = BlockedRange::new(&items);

        let mut seen = Vec::new();
        for i in 0..4 {
            let ctx = Context::new(i, 4, &topo);
            seen.extend(range.local_iter(&ctx));
        }
        assert_eq!(seen, items);
    }

    #[test]
    fn index_blocks_cover_without_overlap() {
        let topo = Topology::detect();
        let range = BlockedIndices::new(10..35);

        let mut seen = Vec::new();
        for i in 0..3 {
            let ctx = Context::new(i, 3, &topo);
            seen.extend(range.local_iter(&ctx));
        }
        assert_eq!(seen, (10..35).collect::<Vec<_>>());
    }
}
