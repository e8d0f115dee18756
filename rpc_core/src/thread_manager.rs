//! Per-compartment RPC entry table and idle worker pool.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use rpc_abi::RpcIndex;

use crate::error::RpcError;

/// Opaque worker/thread handle. A real port hands these out from its
/// scheduler's thread-control-block allocator; this crate only ever
/// stores and compares them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

/// Distinguishes application threads from the cooperative scheduler's
/// dedicated RPC machinery with an explicit field, rather than a
/// sign-tagged thread id convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    Application,
    RpcServer,
    RpcWorker,
}

/// Per-(compartment, RPC index) bookkeeping: which worker (if any)
/// currently owns this index, and how many nested calls it is inside.
#[derive(Debug, Clone, Copy, Default)]
pub struct RpcEntry {
    pub thread: Option<ThreadId>,
    pub recursion: u32,
}

/// Idle-thread pool plus the active-entry table, one instance per
/// compartment.
pub struct RpcThreadManager {
    entries: Vec<RpcEntry>,
    idle: VecDeque<ThreadId>,
    thread_cnt: usize,
    idle_cnt: usize,
    max_idle_threads: usize,
    rpc_server_thread: Option<ThreadId>,
}

impl RpcThreadManager {
    pub fn new(num_rpc_indices: usize, max_idle_threads: usize) -> Self {
        RpcThreadManager {
            entries: alloc::vec![RpcEntry::default(); num_rpc_indices],
            idle: VecDeque::new(),
            thread_cnt: 0,
            idle_cnt: 0,
            max_idle_threads,
            rpc_server_thread: None,
        }
    }

    pub fn thread_cnt(&self) -> usize {
        self.thread_cnt
    }

    pub fn idle_cnt(&self) -> usize {
        self.idle_cnt
    }

    pub fn set_rpc_server_thread(&mut self, thread: ThreadId) {
        self.rpc_server_thread = Some(thread);
    }

    pub fn rpc_server_thread(&self) -> Option<ThreadId> {
        self.rpc_server_thread
    }

    /// Registers a freshly created worker thread into the idle pool.
    /// The caller is responsible for actually allocating the thread
    /// (stack, TLS, control block) via its `ContextSwitch`
    /// implementation; this only tracks bookkeeping and enforces the
    /// configured cap.
    pub fn add_idle_rpc_thread(&mut self, thread: ThreadId) -> Result<(), RpcError> {
        if self.thread_cnt == self.max_idle_threads {
            return Err(RpcError::WorkerPoolFull);
        }
        self.idle.push_back(thread);
        self.thread_cnt += 1;
        self.idle_cnt += 1;
        Ok(())
    }

    /// Returns the worker bound to `index`, assigning one if needed:
    /// pop from idle, or allocate a new one via `allocate` when the
    /// idle list is empty. `allocate` must itself respect
    /// `MAX_IDLE_THREADS`; this call refuses to invoke it once the cap
    /// is already reached.
    pub fn assign_rpc_thread(
        &mut self,
        index: RpcIndex,
        mut allocate: impl FnMut() -> Result<ThreadId, RpcError>,
    ) -> Result<ThreadId, RpcError> {
        if let Some(thread) = self.entries[index.get() as usize].thread {
            return Ok(thread);
        }
        let thread = match self.idle.pop_front() {
            Some(t) => {
                self.idle_cnt -= 1;
                t
            }
            None => {
                if self.thread_cnt == self.max_idle_threads {
                    return Err(RpcError::WorkerPoolFull);
                }
                let t = allocate()?;
                self.thread_cnt += 1;
                t
            }
        };
        self.entries[index.get() as usize].thread = Some(thread);
        Ok(thread)
    }

    /// Binds `thread` to `index` directly, without touching the idle
    /// pool or the thread-count cap — used by `execute_rpc` when a
    /// normal application thread becomes, for the duration of one
    /// call, the entry's owning thread (it was never pool-managed).
    pub fn bind_thread(&mut self, index: RpcIndex, thread: ThreadId) {
        self.entries[index.get() as usize].thread = Some(thread);
    }

    pub fn entry_thread(&self, index: RpcIndex) -> Option<ThreadId> {
        self.entries[index.get() as usize].thread
    }

    pub fn unassign_rpc_thread(&mut self, index: RpcIndex) {
        if let Some(thread) = self.entries[index.get() as usize].thread.take() {
            self.idle.push_back(thread);
            self.idle_cnt += 1;
        }
    }

    /// Clears `index`'s owning thread without returning it to the idle
    /// pool — the `bind_thread` counterpart, for a thread that was
    /// bound directly and was never pool-managed to begin with.
    pub fn unbind_thread(&mut self, index: RpcIndex) {
        self.entries[index.get() as usize].thread = None;
    }

    pub fn enter_call(&mut self, index: RpcIndex) {
        self.entries[index.get() as usize].recursion += 1;
    }

    /// Decrements the recursion counter, returning `true` if it has
    /// returned to zero (the outermost call has completed).
    pub fn exit_call(&mut self, index: RpcIndex) -> bool {
        let slot = &mut self.entries[index.get() as usize];
        slot.recursion -= 1;
        slot.recursion == 0
    }

    pub fn recursion(&self, index: RpcIndex) -> u32 {
        self.entries[index.get() as usize].recursion
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_reuses_existing_then_idle_then_allocates() {
        let mut mgr = RpcThreadManager::new(4, 2);
        mgr.add_idle_rpc_thread(ThreadId(100)).unwrap();

        let t = mgr
            .assign_rpc_thread(RpcIndex(0), || panic!("should reuse idle"))
            .unwrap();
        assert_eq!(t, ThreadId(100));
        let t2 = mgr
            .assign_rpc_thread(RpcIndex(0), || panic!("should reuse entry"))
            .unwrap();
        assert_eq!(t2, ThreadId(100));

        let mut next_id = 200u64;
        let t3 = mgr
            .assign_rpc_thread(RpcIndex(1), || {
                next_id += 1;
                Ok(ThreadId(next_id))
            })
            .unwrap();
        assert_eq!(t3, ThreadId(201));
    }

    #[test]
    fn pool_full_rejects_add_and_allocate() {
        let mut mgr = RpcThreadManager::new(2, 1);
        mgr.add_idle_rpc_thread(ThreadId(1)).unwrap();
        assert_eq!(mgr.add_idle_rpc_thread(ThreadId(2)), Err(RpcError::WorkerPoolFull));

        // idle thread 1 gets consumed by index 0, leaving the pool at
        // its cap with nothing idle: index 1 must refuse to allocate.
        mgr.assign_rpc_thread(RpcIndex(0), || panic!("should reuse idle"))
            .unwrap();
        assert_eq!(
            mgr.assign_rpc_thread(RpcIndex(1), || panic!("allocate must not be called")),
            Err(RpcError::WorkerPoolFull)
        );
    }

    #[test]
    fn unassign_returns_thread_to_idle() {
        let mut mgr = RpcThreadManager::new(1, 2);
        mgr.add_idle_rpc_thread(ThreadId(7)).unwrap();
        let t = mgr
            .assign_rpc_thread(RpcIndex(0), || panic!("no alloc expected"))
            .unwrap();
        assert_eq!(t, ThreadId(7));
        assert_eq!(mgr.idle_cnt(), 0);
        mgr.unassign_rpc_thread(RpcIndex(0));
        assert_eq!(mgr.idle_cnt(), 1);
    }

    #[test]
    fn recursion_balances() {
        let mut mgr = RpcThreadManager::new(1, 1);
        mgr.enter_call(RpcIndex(0));
        mgr.enter_call(RpcIndex(0));
        assert_eq!(mgr.recursion(RpcIndex(0)), 2);
        assert!(!mgr.exit_call(RpcIndex(0)));
        assert!(mgr.exit_call(RpcIndex(0)));
        assert_eq!(mgr.recursion(RpcIndex(0)), 0);
    }

    #[test]
    fn bind_thread_skips_pool_accounting() {
        let mut mgr = RpcThreadManager::new(1, 1);
        mgr.bind_thread(RpcIndex(0), ThreadId(42));
        assert_eq!(mgr.entry_thread(RpcIndex(0)), Some(ThreadId(42)));
        assert_eq!(mgr.thread_cnt(), 0);
    }

    #[test]
    fn unbind_thread_clears_entry_without_touching_idle_pool() {
        let mut mgr = RpcThreadManager::new(1, 1);
        mgr.bind_thread(RpcIndex(0), ThreadId(42));
        mgr.unbind_thread(RpcIndex(0));
        assert_eq!(mgr.entry_thread(RpcIndex(0)), None);
        assert_eq!(mgr.idle_cnt(), 0);
        assert_eq!(mgr.thread_cnt(), 0);
    }
}
