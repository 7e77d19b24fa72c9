//! An experimental parallel runtime for irregular workloads that discover
//! new work while they run: graph traversals, tree expansions, mining —
//! anything where the set of items grows under the operator's feet.
//!
//! What we want:
//! - Pushing and popping work should cost a couple of ring operations in
//!   the common case; workers only touch shared state when a whole chunk
//!   of items changes hands.
//! - Work-stealing at chunk granularity, socket-aware, so NUMA machines
//!   keep their memory traffic local.
//! - Memory for chunks and task-local data comes from large pages, owned
//!   per thread, recycled without a global lock.
//! - No implicit global runtime; worker count and topology live in a
//!   handle the caller builds.
//! - Run to quiescence: a region ends exactly when every worker agrees
//!   there is nothing left, not when some central queue looks empty.
//!
//! The entry point is [`Runtime::for_each`] over one of the chunked
//! work-lists:
//!
//! ```
//! use amorph::{Runtime, SocketChunkedBag};
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! let rt = Runtime::builder().with_workers(4).build();
//! let mut worklist: SocketChunkedBag<u64> = SocketChunkedBag::new(&rt);
//! worklist.fill(0..1000).unwrap();
//!
//! let sum = AtomicU64::new(0);
//! rt.for_each(&worklist)
//!     .run(|item, ctx| {
//!         sum.fetch_add(item, Ordering::Relaxed);
//!         if item == 0 {
//!             // Operators may grow the workload while it runs.
//!             ctx.push(1000);
//!         }
//!     })
//!     .unwrap();
//!
//! assert_eq!(sum.load(Ordering::Relaxed), 1000 * 999 / 2 + 1000);
//! ```

mod core;
mod foreach;
pub mod mem;
mod util;
pub mod worklist;

pub use crate::core::context::{Context, Stats};
pub use crate::core::runtime::{Runtime, RuntimeBuilder, WorkerHook};
pub use crate::core::storage::{PerSocket, PerWorker};
pub use crate::core::sync;
pub use crate::core::topology::Topology;
pub use crate::foreach::{ForEachBuilder, ForEachContext, ForEachError};
pub use crate::mem::OutOfMemory;
pub use crate::worklist::{
    BlockedIndices, BlockedRange, ChunkedFifo, ChunkedLifo, InitialRange, SocketChunkedBag,
    SocketChunkedFifo, SocketChunkedLifo, WorkList,
};

pub use crossbeam_utils::CachePadded;
