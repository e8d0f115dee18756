//! The explicit per-compartment context threaded through every core
//! operation: current compartment id, thread manager, scheduler, and
//! per-thread state are all reached through a value passed by the
//! caller rather than a process-wide global.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use rpc_abi::{rpc_index_bits_for, CompartmentId, RpcIndex};
use spin::Mutex;

use crate::dispatch::FunctionTable;
use crate::scheduler::CooperativeScheduler;
use crate::shared_region::SharedRegion;
use crate::thread_manager::{RpcThreadManager, ThreadId, ThreadRole};

/// Per-thread scheduling metadata private to this compartment: which
/// compartment is currently calling it, which RPC index it is bound
/// to, and whether it is currently acting as an RPC caller.
#[derive(Debug, Clone, Copy)]
pub struct ThreadState {
    pub role: ThreadRole,
    pub rpc_index: Option<RpcIndex>,
    /// Set on an `Application` thread for the duration of an outbound
    /// `execute_rpc` call so the scheduler's worker-exclusion rule
    /// applies to it too.
    pub is_rpc_thread: bool,
}

impl ThreadState {
    pub fn new(role: ThreadRole) -> Self {
        ThreadState {
            role,
            rpc_index: None,
            is_rpc_thread: matches!(role, ThreadRole::RpcWorker),
        }
    }
}

/// Everything one compartment's RPC machinery needs: the shared
/// region handle, its own function table, thread manager, scheduler,
/// and per-thread bookkeeping. One instance per compartment.
pub struct CompartmentRuntime {
    pub id: CompartmentId,
    pub n: u16,
    pub t: u32,
    pub rpc_index_bits: u32,
    pub shared: Arc<SharedRegion>,
    pub function_table: FunctionTable,
    pub threads: Mutex<RpcThreadManager>,
    pub scheduler: Mutex<CooperativeScheduler>,
    pub thread_state: Mutex<BTreeMap<ThreadId, ThreadState>>,
}

impl CompartmentRuntime {
    pub fn new(
        id: CompartmentId,
        n: u16,
        t: u32,
        shared: Arc<SharedRegion>,
        function_table: FunctionTable,
        max_idle_threads: usize,
        rpc_server_thread: ThreadId,
    ) -> Self {
        let mut threads = RpcThreadManager::new(n as usize * t as usize, max_idle_threads);
        threads.set_rpc_server_thread(rpc_server_thread);

        let mut scheduler = CooperativeScheduler::new(rpc_server_thread);
        scheduler.enqueue(rpc_server_thread);

        let mut thread_state = BTreeMap::new();
        thread_state.insert(rpc_server_thread, ThreadState::new(ThreadRole::RpcServer));

        CompartmentRuntime {
            id,
            n,
            t,
            rpc_index_bits: rpc_index_bits_for(n as u32, t),
            shared,
            function_table,
            threads: Mutex::new(threads),
            scheduler: Mutex::new(scheduler),
            thread_state: Mutex::new(thread_state),
        }
    }

    pub fn rpc_index_of(&self, caller_tid_small: u32) -> RpcIndex {
        RpcIndex::new(self.id, caller_tid_small, self.t)
    }

    pub fn register_thread(&self, thread: ThreadId, role: ThreadRole) {
        self.thread_state.lock().insert(thread, ThreadState::new(role));
    }

    pub fn role_of(&self, thread: ThreadId) -> ThreadRole {
        self.thread_state
            .lock()
            .get(&thread)
            .map(|s| s.role)
            .unwrap_or(ThreadRole::Application)
    }

    pub fn set_is_rpc_thread(&self, thread: ThreadId, value: bool) {
        if let Some(state) = self.thread_state.lock().get_mut(&thread) {
            state.is_rpc_thread = value;
        }
    }

    pub fn is_rpc_thread(&self, thread: ThreadId) -> bool {
        self.thread_state
            .lock()
            .get(&thread)
            .map(|s| s.is_rpc_thread)
            .unwrap_or(false)
    }
}
