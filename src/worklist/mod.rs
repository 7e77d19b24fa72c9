//! Work-lists: concurrent containers of task items, built from fixed-size
//! chunks.
//!
//! Workers interact with a work-list through their [`Context`]: pushes land
//! in a private chunk, pops drain private chunks first, and full chunks
//! move through shared per-socket pools where idle workers steal them. See
//! [`chunked::ChunkedMaster`] for the machinery and the `Chunked*` /
//! `SocketChunked*` aliases for the concrete shapes.

pub mod chunked;
pub mod pool;
pub mod range;
pub mod ring;

pub use chunked::{
    Chunk, ChunkedFifo, ChunkedLifo, ChunkedMaster, SocketChunkedBag, SocketChunkedFifo,
    SocketChunkedLifo,
};
pub use range::{BlockedIndices, BlockedRange, InitialRange};
pub use ring::FixedRing;

use crate::core::context::Context;
use crate::mem::OutOfMemory;

/// Default chunk capacity of the chunked work-lists.
pub const DEFAULT_CHUNK_SIZE: usize = 64;

/// What the foreach driver needs from a work-list.
///
/// All operations act on behalf of the worker whose context is passed in.
/// A failed push is fatal for the surrounding computation (the item is
/// dropped, nothing is retried).
pub trait WorkList<T: Send>: Send + Sync {
    fn push(&self, ctx: &mut Context, item: T) -> Result<(), OutOfMemory>;

    /// Take the next item from the caller's point of view: private chunks
    /// first, then the shared pools, stealing across sockets if need be.
    /// `None` means every source was observed empty.
    fn pop(&self, ctx: &mut Context) -> Option<T>;

    /// Make the caller's pending pushes visible to other workers.
    fn flush(&self, ctx: &mut Context);

    /// Racy hint that some pool holds chunks.
    fn has_visible_work(&self) -> bool;

    /// Push the caller's share of an initial range.
    fn push_initial<R: InitialRange<T>>(
        &self,
        ctx: &mut Context,
        range: &R,
    ) -> Result<(), OutOfMemory> {
        for item in range.local_iter(ctx) {
            self.push(ctx, item)?;
        }
        Ok(())
    }
}
