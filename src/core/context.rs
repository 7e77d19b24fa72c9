use crate::core::topology::Topology;

/// A worker's identity inside a parallel region.
///
/// One context exists per worker for the duration of a `for_each` call; it is
/// handed to the operator (wrapped in a `ForEachContext`) and to every
/// work-list and per-worker-storage operation. Holding `&mut Context` is the
/// proof that the caller *is* that worker, which is what makes the exclusive
/// slot accesses in `PerWorker` and the chunked work-lists sound.
pub struct Context {
    index: u32,
    socket: u32,
    num_workers: u32,
    num_sockets: u32,
    pub(crate) stats: Stats,
}

impl Context {
    pub(crate) fn new(index: u32, num_workers: u32, topology: &Topology) -> Self {
        let num_sockets = topology.num_sockets().min(num_workers);
        Context {
            index,
            socket: topology.socket_of(index, num_workers).min(num_sockets - 1),
            num_workers,
            num_sockets,
            stats: Stats::new(),
        }
    }

    /// 0-based worker identity, dense in `0..num_workers()`.
    pub fn index(&self) -> usize { self.index as usize }

    /// The socket (NUMA node) this worker belongs to.
    pub fn socket(&self) -> usize { self.socket as usize }

    pub fn num_workers(&self) -> usize { self.num_workers as usize }

    /// Number of sockets that actually have workers. Per-socket structures
    /// (pools, `PerSocket` storage) are sized by this.
    pub fn num_sockets(&self) -> usize { self.num_sockets as usize }

    // Get some stats for debugging purposes.
    pub fn stats(&self) -> &Stats { &self.stats }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Stats {
    /// Number of items this worker popped and executed.
    pub items_executed: u64,
    /// Chunks taken from this worker's own socket pool.
    pub chunks_popped: u64,
    /// Chunks taken from another socket's pool.
    pub chunks_stolen: u64,
    /// Chunks this worker published to a pool.
    pub chunks_published: u64,
    /// Spins inside the quiescence barrier.
    pub idle_spins: u64,
}

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }
}
