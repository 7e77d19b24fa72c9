//! The foreach driver: run an operator over a work-list until quiescence.
//!
//! Each worker loops pop → operator → pop; the operator may push new items
//! through its context, so the set of work grows while it runs. The region
//! ends when every worker simultaneously sees the work-list empty (see
//! `core::quiesce`), when the operator raises the break signal, or when
//! something fails — an operator panic or an allocation failure stops every
//! worker at its next loop boundary and surfaces as the region's result.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};

use crossbeam_utils::Backoff;

use crate::core::context::{Context, Stats};
use crate::core::quiesce::Terminator;
use crate::core::runtime::Runtime;
use crate::mem::OutOfMemory;
use crate::sync::{AtomicBool, Mutex, Ordering};
use crate::worklist::{InitialRange, WorkList};

/// Why a foreach ended early. A clean run to quiescence returns `Ok`.
pub enum ForEachError {
    /// The page source or an allocator gave up while growing the work-list.
    OutOfMemory,
    /// The operator panicked on some item; the payload is what the panic
    /// carried. Remaining items were dropped.
    OperatorPanic(Box<dyn Any + Send>),
}

impl fmt::Debug for ForEachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForEachError::OutOfMemory => f.write_str("OutOfMemory"),
            ForEachError::OperatorPanic(_) => f.write_str("OperatorPanic(..)"),
        }
    }
}

impl fmt::Display for ForEachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForEachError::OutOfMemory => f.write_str("out of memory"),
            ForEachError::OperatorPanic(_) => f.write_str("the operator panicked"),
        }
    }
}

impl std::error::Error for ForEachError {}

impl From<OutOfMemory> for ForEachError {
    fn from(_: OutOfMemory) -> Self {
        ForEachError::OutOfMemory
    }
}

// Shared stop/failure state of one foreach region.
struct Signals {
    stop: AtomicBool,
    failed: AtomicBool,
    error: Mutex<Option<ForEachError>>,
}

impl Signals {
    fn new() -> Self {
        Signals {
            stop: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    #[inline]
    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn fail(&self, error: ForEachError) {
        // First failure wins; later ones only reinforce the stop.
        if !self.failed.swap(true, Ordering::SeqCst) {
            *self.error.lock().unwrap() = Some(error);
        }
        self.stop.store(true, Ordering::SeqCst);
    }

    fn into_result(self) -> Result<(), ForEachError> {
        match self.error.into_inner().unwrap() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// What the operator gets alongside each item: its worker identity, a way
/// to feed new items back into the work-list, and the break signal.
pub struct ForEachContext<'e, T: Send, W: WorkList<T>> {
    ctx: &'e mut Context,
    worklist: &'e W,
    signals: &'e Signals,
    _items: PhantomData<fn(T)>,
}

impl<'e, T: Send, W: WorkList<T>> ForEachContext<'e, T, W> {
    /// Add an item to the work-list. It will be seen by some worker of this
    /// region, possibly this one. On allocation failure the whole foreach
    /// aborts and the item is dropped.
    #[inline]
    pub fn push(&mut self, item: T) {
        if let Err(oom) = self.worklist.push(self.ctx, item) {
            self.signals.fail(oom.into());
        }
    }

    /// Raise the break signal: every worker stops at its next loop
    /// boundary and the foreach returns `Ok`. Remaining items stay in the
    /// work-list.
    pub fn stop(&self) {
        self.signals.request_stop();
    }

    pub fn index(&self) -> usize {
        self.ctx.index()
    }

    pub fn num_workers(&self) -> usize {
        self.ctx.num_workers()
    }

    pub fn socket(&self) -> usize {
        self.ctx.socket()
    }

    pub fn stats(&self) -> &Stats {
        self.ctx.stats()
    }

    /// The underlying worker context, for per-worker storage access.
    pub fn worker(&mut self) -> &mut Context {
        self.ctx
    }
}

impl Runtime {
    /// Start building a foreach over `worklist`. Seed it beforehand (e.g.
    /// `fill`) or via [`ForEachBuilder::with_initial`], then call
    /// [`ForEachBuilder::run`].
    pub fn for_each<'a, T, W>(&'a self, worklist: &'a W) -> ForEachBuilder<'a, T, W, ()>
    where
        T: Send,
        W: WorkList<T>,
    {
        ForEachBuilder {
            rt: self,
            worklist,
            seed: None,
            _items: PhantomData,
        }
    }
}

pub struct ForEachBuilder<'a, T: Send, W: WorkList<T>, R> {
    rt: &'a Runtime,
    worklist: &'a W,
    seed: Option<&'a R>,
    _items: PhantomData<fn(T)>,
}

impl<'a, T: Send, W: WorkList<T>, R> ForEachBuilder<'a, T, W, R> {
    /// Seed the work-list from an initial range; each worker pushes its own
    /// share and publishes it before the main loop starts.
    pub fn with_initial<R2>(self, range: &'a R2) -> ForEachBuilder<'a, T, W, R2>
    where
        R2: InitialRange<T> + Sync,
    {
        ForEachBuilder {
            rt: self.rt,
            worklist: self.worklist,
            seed: Some(range),
            _items: PhantomData,
        }
    }

    /// Run `operator` over every item until quiescence.
    pub fn run<F>(self, operator: F) -> Result<(), ForEachError>
    where
        R: InitialRange<T> + Sync,
        F: Fn(T, &mut ForEachContext<T, W>) + Sync,
    {
        profiling::scope!("for_each");

        let signals = Signals::new();
        let terminator = Terminator::new(self.rt.num_workers());
        let worklist = self.worklist;
        let seed = self.seed;
        let operator = &operator;

        self.rt.run_workers(|ctx| {
            worker_loop(ctx, worklist, seed, operator, &signals, &terminator);
        });

        signals.into_result()
    }
}

fn execute_one<T, W, F>(ctx: &mut Context, worklist: &W, signals: &Signals, operator: &F, item: T)
where
    T: Send,
    W: WorkList<T>,
    F: Fn(T, &mut ForEachContext<T, W>) + Sync,
{
    let mut fe_ctx = ForEachContext {
        ctx,
        worklist,
        signals,
        _items: PhantomData,
    };
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| operator(item, &mut fe_ctx))) {
        signals.fail(ForEachError::OperatorPanic(payload));
    }
    ctx.stats.items_executed += 1;
}

fn worker_loop<T, W, R, F>(
    ctx: &mut Context,
    worklist: &W,
    seed: Option<&R>,
    operator: &F,
    signals: &Signals,
    terminator: &Terminator,
) where
    T: Send,
    W: WorkList<T>,
    R: InitialRange<T> + Sync,
    F: Fn(T, &mut ForEachContext<T, W>) + Sync,
{
    if let Some(range) = seed {
        if let Err(oom) = worklist.push_initial(ctx, range) {
            signals.fail(oom.into());
        }
        // Publish the seed so nobody starves while this worker churns
        // through its own share.
        worklist.flush(ctx);
    }

    'main: loop {
        if signals.should_stop() {
            break;
        }

        if let Some(item) = worklist.pop(ctx) {
            execute_one(ctx, worklist, signals, operator, item);
            continue;
        }

        // Out of work everywhere we looked. Count ourselves idle, keep an
        // eye on the pools, and only leave the barrier once we actually
        // took an item back out (never while merely hoping).
        terminator.enter_idle();
        let backoff = Backoff::new();
        loop {
            if signals.should_stop() || terminator.all_idle() {
                break 'main;
            }

            if worklist.has_visible_work() {
                terminator.leave_idle();
                if let Some(item) = worklist.pop(ctx) {
                    execute_one(ctx, worklist, signals, operator, item);
                    continue 'main;
                }
                terminator.enter_idle();
            }

            ctx.stats.idle_spins += 1;
            backoff.snooze();

            #[cfg(loom)]
            loom::thread::yield_now();
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::core::storage::PerWorker;
    use crate::sync::AtomicUsize;
    use crate::worklist::{
        BlockedRange, ChunkedLifo, SocketChunkedBag, SocketChunkedFifo, SocketChunkedLifo,
    };

    #[test]
    fn drains_an_initial_range() {
        let rt = Runtime::builder().with_workers(4).with_sockets(2).build();
        let wl: SocketChunkedBag<u64, 16> = SocketChunkedBag::new(&rt);

        let items: Vec<u64> = (1..=10_000).collect();
        let total = AtomicUsize::new(0);
        rt.for_each(&wl)
            .with_initial(&BlockedRange::new(&items))
            .run(|item, _ctx| {
                total.fetch_add(item as usize, Ordering::Relaxed);
            })
            .unwrap();

        assert_eq!(total.load(Ordering::Relaxed), 10_000 * 10_001 / 2);
    }

    #[test]
    fn self_generating_work_reaches_quiescence() {
        let rt = Runtime::builder().with_workers(4).with_sockets(2).build();
        let mut wl: SocketChunkedFifo<u32, 8> = SocketChunkedFifo::new(&rt);
        wl.fill([10u32]).unwrap();

        let invocations = AtomicUsize::new(0);
        rt.for_each(&wl)
            .run(|value, ctx| {
                invocations.fetch_add(1, Ordering::Relaxed);
                if value > 0 {
                    ctx.push(value - 1);
                    ctx.push(value - 1);
                }
            })
            .unwrap();

        // A full binary tree of depth 10: 2^11 - 1 operator calls.
        assert_eq!(invocations.load(Ordering::Relaxed), 2047);
    }

    #[test]
    fn single_worker_elides_nothing_observable() {
        let rt = Runtime::builder().with_workers(1).build();
        let mut wl: ChunkedLifo<u32> = ChunkedLifo::new(&rt);
        wl.fill([3u32]).unwrap();

        let seen = AtomicUsize::new(0);
        rt.for_each(&wl)
            .run(|value, ctx| {
                seen.fetch_add(1, Ordering::Relaxed);
                if value > 0 {
                    ctx.push(value - 1);
                }
            })
            .unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn per_worker_data_accumulates_and_merges() {
        let rt = Runtime::builder().with_workers(4).build();
        let wl: SocketChunkedBag<u32, 32> = SocketChunkedBag::new(&rt);
        let mut counts: PerWorker<u64> = PerWorker::new(rt.num_workers(), |_| 0);

        let items: Vec<u32> = (0..5000).collect();
        rt.for_each(&wl)
            .with_initial(&BlockedRange::new(&items))
            .run(|_item, ctx| {
                *counts.local_mut(ctx.worker()) += 1;
            })
            .unwrap();

        let total: u64 = counts.iter_mut().map(|c| *c).sum();
        assert_eq!(total, 5000);
    }

    #[test]
    fn break_signal_stops_every_worker() {
        let rt = Runtime::builder().with_workers(4).build();
        let mut wl: SocketChunkedBag<u64, 8> = SocketChunkedBag::new(&rt);
        wl.fill(0..1_000_000u64).unwrap();

        let executed = AtomicUsize::new(0);
        rt.for_each(&wl)
            .run(|_item, ctx| {
                if executed.fetch_add(1, Ordering::Relaxed) == 100 {
                    ctx.stop();
                }
            })
            .unwrap();

        // Stopped long before the million; leftovers stay in the list and
        // are reclaimed when it drops.
        assert!(executed.load(Ordering::Relaxed) < 1_000_000);
    }

    #[test]
    fn operator_panic_surfaces_and_aborts() {
        let rt = Runtime::builder().with_workers(2).build();
        let mut wl: SocketChunkedBag<u32, 8> = SocketChunkedBag::new(&rt);
        wl.fill(0..10_000u32).unwrap();

        let result = rt.for_each(&wl).run(|value, _ctx| {
            if value == 5000 {
                panic!("boom");
            }
        });

        match result {
            Err(ForEachError::OperatorPanic(payload)) => {
                assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
            }
            other => panic!("expected an operator panic, got {:?}", other.err()),
        }
    }

    #[test]
    fn allocator_oom_aborts_the_region() {
        // Single worker so every allocation happens on this thread, where
        // the page budget applies.
        let rt = Runtime::builder().with_workers(1).build();
        let mut wl: ChunkedLifo<[u64; 32], 16> = ChunkedLifo::new(&rt);
        wl.fill([[0u64; 32]]).unwrap();

        crate::mem::page::set_page_budget(Some(2));
        let result = rt.for_each(&wl).run(|item, ctx| {
            // Two children per item: the list grows until the budget runs
            // out.
            ctx.push(item);
            ctx.push(item);
        });
        crate::mem::page::set_page_budget(None);

        assert!(matches!(result, Err(ForEachError::OutOfMemory)));
        // The list still owns whatever was in flight; dropping it reclaims
        // every chunk.
        drop(wl);
    }

    #[test]
    fn stealing_feeds_idle_workers() {
        let rt = Runtime::builder().with_workers(4).with_sockets(4).build();
        let mut wl: SocketChunkedLifo<u64, 8> = SocketChunkedLifo::new(&rt);

        // Everything is seeded into worker 0's territory; the other three
        // only ever see work by stealing chunks across sockets.
        wl.fill(1..=10_000u64).unwrap();

        let sum = AtomicUsize::new(0);
        rt.for_each(&wl)
            .run(|item, _ctx| {
                sum.fetch_add(item as usize, Ordering::Relaxed);
            })
            .unwrap();

        assert_eq!(sum.load(Ordering::Relaxed), 10_000 * 10_001 / 2);
    }
}
