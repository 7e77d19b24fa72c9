use std::thread;

use crate::core::context::Context;
use crate::core::topology::{self, Topology};

/// A handle on the runtime: worker count, topology, and worker-thread
/// configuration.
///
/// Building a `Runtime` is cheap; no threads exist until a parallel region
/// runs. Workers for a region are scoped threads spawned for that region
/// only, with the calling thread acting as worker 0, so operators may borrow
/// from the caller's stack.
pub struct Runtime {
    pub(crate) num_workers: u32,
    pub(crate) topology: Topology,
    pin_workers: bool,
    stack_size: Option<usize>,
    name_handler: Box<dyn Fn(u32) -> String + Send + Sync>,
    hooks: WorkerHooks,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder {
            num_workers: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            num_sockets: None,
            pin_workers: false,
            stack_size: None,
            start_handler: None,
            exit_handler: None,
            name_handler: Box::new(|idx| format!("amorph-worker#{}", idx)),
        }
    }

    /// The ambient worker count every parallel region runs with.
    pub fn num_workers(&self) -> usize {
        self.num_workers as usize
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Number of sockets that will actually host workers.
    pub fn num_sockets(&self) -> usize {
        self.topology.num_sockets().min(self.num_workers) as usize
    }

    /// Run `f` once per worker and collect the results (worker 0 first).
    ///
    /// Worker 0 is the calling thread: with one worker this never spawns and
    /// runs entirely inline. Start/exit hooks run on every worker, including
    /// the caller. Pinning applies to spawned workers only; the caller's
    /// affinity is left alone.
    pub(crate) fn run_workers<R, F>(&self, f: F) -> Vec<R>
    where
        F: Fn(&mut Context) -> R + Sync,
        R: Send,
    {
        let n = self.num_workers;

        thread::scope(|s| {
            let f = &f;
            let mut handles = Vec::with_capacity(n as usize - 1);
            for i in 1..n {
                let builder = {
                    let b = std::thread::Builder::new().name((self.name_handler)(i));
                    match self.stack_size {
                        Some(size) => b.stack_size(size),
                        None => b,
                    }
                };

                let topology = &self.topology;
                let hooks = &self.hooks;
                let pin = self.pin_workers;
                let handle = builder
                    .spawn_scoped(s, move || {
                        profiling::register_thread!("Worker");

                        if pin {
                            topology::pin_current_thread(topology.cpu_of(i));
                        }

                        let mut ctx = Context::new(i, n, topology);
                        if let Some(hook) = &hooks.start {
                            hook.run(i);
                        }
                        let result = f(&mut ctx);
                        if let Some(hook) = &hooks.exit {
                            hook.run(i);
                        }
                        result
                    })
                    .expect("failed to spawn worker thread");
                handles.push(handle);
            }

            let mut ctx = Context::new(0, n, &self.topology);
            if let Some(hook) = &self.hooks.start {
                hook.run(0);
            }
            let first = f(&mut ctx);
            if let Some(hook) = &self.hooks.exit {
                hook.run(0);
            }

            let mut results = Vec::with_capacity(n as usize);
            results.push(first);
            for handle in handles {
                results.push(handle.join().unwrap());
            }
            results
        })
    }
}

pub struct RuntimeBuilder {
    num_workers: u32,
    num_sockets: Option<u32>,
    pin_workers: bool,
    stack_size: Option<usize>,
    start_handler: Option<Box<dyn WorkerHook>>,
    exit_handler: Option<Box<dyn WorkerHook>>,
    name_handler: Box<dyn Fn(u32) -> String + Send + Sync>,
}

impl RuntimeBuilder {
    pub fn with_workers(mut self, num_workers: u32) -> Self {
        self.num_workers = num_workers.max(1);

        // Per-worker structures are small fixed arrays; 64 workers is far
        // beyond what this runtime is tuned for anyway.
        assert!(self.num_workers <= 64);

        self
    }

    /// Override the detected socket count. Mainly useful to exercise the
    /// per-socket work-lists on single-node machines.
    pub fn with_sockets(mut self, num_sockets: u32) -> Self {
        self.num_sockets = Some(num_sockets.max(1));

        self
    }

    /// Pin spawned workers to CPUs, round-robin over the machine.
    pub fn with_pinning(mut self, pin: bool) -> Self {
        self.pin_workers = pin;

        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);

        self
    }

    pub fn with_start_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.start_handler = Some(Box::new(handler));

        self
    }

    pub fn with_exit_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.exit_handler = Some(Box::new(handler));

        self
    }

    pub fn with_thread_names<F>(mut self, handler: F) -> Self
    where
        F: Fn(u32) -> String + Send + Sync + 'static,
    {
        self.name_handler = Box::new(handler);

        self
    }

    pub fn build(self) -> Runtime {
        let topology = match self.num_sockets {
            Some(n) => Topology::with_sockets(n),
            None => Topology::detect(),
        };

        Runtime {
            num_workers: self.num_workers,
            topology,
            pin_workers: self.pin_workers,
            stack_size: self.stack_size,
            name_handler: self.name_handler,
            hooks: WorkerHooks {
                start: self.start_handler,
                exit: self.exit_handler,
            },
        }
    }
}

pub(crate) struct WorkerHooks {
    start: Option<Box<dyn WorkerHook>>,
    exit: Option<Box<dyn WorkerHook>>,
}

pub trait WorkerHook: Send + Sync {
    fn run(&self, worker_id: u32);
}

impl<F> WorkerHook for F
where
    F: Fn(u32) + Send + Sync + 'static,
{
    fn run(&self, worker_id: u32) {
        self(worker_id)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::{AtomicU32, Ordering};

    #[test]
    fn hooks_run_once_per_worker() {
        static STARTED: AtomicU32 = AtomicU32::new(0);
        static EXITED: AtomicU32 = AtomicU32::new(0);

        let rt = Runtime::builder()
            .with_workers(3)
            .with_start_handler(|_id| {
                STARTED.fetch_add(1, Ordering::SeqCst);
            })
            .with_exit_handler(|_id| {
                EXITED.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        let ids = rt.run_workers(|ctx| ctx.index());
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(STARTED.load(Ordering::SeqCst), 3);
        assert_eq!(EXITED.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn single_worker_runs_inline() {
        let rt = Runtime::builder().with_workers(1).build();
        let caller = std::thread::current().id();
        let ids = rt.run_workers(|_ctx| std::thread::current().id());
        assert_eq!(ids, vec![caller]);
    }
}
