//! Machine topology: how many CPUs and sockets there are, and which worker
//! lands on which of them.
//!
//! Socket here means a NUMA node. Detection is best-effort: on anything that
//! isn't linux (or when sysfs is unreadable) we fall back to a single socket,
//! which degrades the per-socket work-lists to their global flavor without
//! changing any semantics.

#[derive(Clone, Debug)]
pub struct Topology {
    num_cpus: u32,
    num_sockets: u32,
}

impl Topology {
    pub fn detect() -> Self {
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        Topology {
            num_cpus,
            num_sockets: detect_sockets().max(1),
        }
    }

    /// Same as `detect` but with the socket count overridden. The main use
    /// is exercising the per-socket code paths on machines with one node.
    pub fn with_sockets(num_sockets: u32) -> Self {
        let mut topo = Self::detect();
        topo.num_sockets = num_sockets.max(1);
        topo
    }

    pub fn num_cpus(&self) -> u32 { self.num_cpus }

    pub fn num_sockets(&self) -> u32 { self.num_sockets }

    /// Socket of the given worker, with workers spread over sockets in
    /// contiguous blocks: with 8 workers on 2 sockets, workers 0-3 map to
    /// socket 0 and workers 4-7 to socket 1.
    pub fn socket_of(&self, worker: u32, num_workers: u32) -> u32 {
        debug_assert!(worker < num_workers);
        ((worker as u64 * self.num_sockets as u64) / num_workers as u64) as u32
    }

    /// CPU the given worker is pinned to (when pinning is enabled),
    /// round-robin over the machine.
    pub fn cpu_of(&self, worker: u32) -> u32 {
        worker % self.num_cpus
    }
}

#[cfg(target_os = "linux")]
fn detect_sockets() -> u32 {
    let Ok(dir) = std::fs::read_dir("/sys/devices/system/node") else {
        return 1;
    };

    let mut nodes = 0;
    for entry in dir.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("node") && name[4..].bytes().all(|b| b.is_ascii_digit()) {
            nodes += 1;
        }
    }

    nodes
}

#[cfg(not(target_os = "linux"))]
fn detect_sockets() -> u32 {
    1
}

/// Pin the calling thread to one CPU. Failure is ignored: pinning is a
/// locality optimization, not a correctness requirement.
#[cfg(target_os = "linux")]
pub(crate) fn pin_current_thread(cpu: u32) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu as usize % libc::CPU_SETSIZE as usize, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn pin_current_thread(_cpu: u32) {}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn detects_something() {
        let topo = Topology::detect();
        assert!(topo.num_cpus() >= 1);
        assert!(topo.num_sockets() >= 1);
    }

    #[test]
    fn block_socket_assignment() {
        let topo = Topology::with_sockets(2);
        assert_eq!(topo.socket_of(0, 8), 0);
        assert_eq!(topo.socket_of(3, 8), 0);
        assert_eq!(topo.socket_of(4, 8), 1);
        assert_eq!(topo.socket_of(7, 8), 1);

        // More sockets than workers: each worker gets its own.
        let topo = Topology::with_sockets(4);
        assert_eq!(topo.socket_of(0, 2), 0);
        assert_eq!(topo.socket_of(1, 2), 2);
    }
}
