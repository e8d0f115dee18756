//! Host-side simulation of the cross-compartment RPC core: one OS
//! thread per logical thread (RPC server, RPC worker, application),
//! with explicit park/unpark standing in for the architecture-specific
//! register context switch a bare-metal port would use instead.
//!
//! Within one compartment only one of these OS threads is ever
//! unparked at a time — [`SimSwitch::switch`] hands off by unparking
//! `next` and parking the caller, so the cooperative, non-preemptive
//! contract `rpc_core` assumes still holds even though each logical
//! thread backs onto real OS scheduling.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use rpc_abi::CompartmentId;
use rpc_core::dispatch::FunctionTable;
use rpc_core::scheduler::ContextSwitch;
use rpc_core::server;
use rpc_core::shared_region::SharedRegion;
use rpc_core::thread_manager::{ThreadId, ThreadRole};
use rpc_core::runtime::CompartmentRuntime;

struct ThreadHandle {
    os_thread: thread::Thread,
    runnable: Arc<AtomicBool>,
}

/// Registry of every logical thread's park primitive. One instance is
/// shared across every compartment in a simulated system so thread ids
/// never collide.
pub struct SchedulerBackend {
    next_id: AtomicU64,
    handles: Mutex<HashMap<ThreadId, ThreadHandle>>,
}

impl SchedulerBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(SchedulerBackend {
            next_id: AtomicU64::new(0),
            handles: Mutex::new(HashMap::new()),
        })
    }

    fn reserve_id(&self) -> ThreadId {
        ThreadId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

thread_local! {
    static CURRENT: Cell<Option<ThreadId>> = const { Cell::new(None) };
}

fn wait_for_first_schedule(runnable: &AtomicBool) {
    while !runnable.swap(false, Ordering::AcqRel) {
        thread::park();
    }
}

/// The [`rpc_core::scheduler::ContextSwitch`] implementation backing
/// the simulation.
pub struct SimSwitch {
    backend: Arc<SchedulerBackend>,
    rt: Arc<CompartmentRuntime>,
}

impl SimSwitch {
    fn new(backend: Arc<SchedulerBackend>, rt: Arc<CompartmentRuntime>) -> Self {
        SimSwitch { backend, rt }
    }
}

impl ContextSwitch for SimSwitch {
    fn current_thread(&self) -> ThreadId {
        CURRENT
            .with(|c| c.get())
            .expect("current OS thread was never registered with the simulator")
    }

    /// Spawns an OS thread parked until its first switch-to, which
    /// then runs [`server::rpc_thread_func`] for the lifetime of the
    /// worker.
    fn create_thread(&mut self) -> ThreadId {
        let id = self.backend.reserve_id();
        let runnable = Arc::new(AtomicBool::new(false));
        let backend = Arc::clone(&self.backend);
        let rt = Arc::clone(&self.rt);
        let runnable_for_thread = Arc::clone(&runnable);
        let join = thread::Builder::new()
            .name(format!("rpc-worker-{}", id.0))
            .spawn(move || {
                CURRENT.with(|c| c.set(Some(id)));
                wait_for_first_schedule(&runnable_for_thread);
                let mut cs = SimSwitch::new(backend, Arc::clone(&rt));
                server::rpc_thread_func(&rt, &mut cs);
            })
            .expect("failed to spawn simulated rpc worker thread");
        let os_thread = join.thread().clone();
        self.backend.handles.lock().unwrap().insert(id, ThreadHandle { os_thread, runnable });
        id
    }

    fn switch(&mut self, next: ThreadId) {
        let current = self.current_thread();
        let (next_thread, next_runnable, current_runnable) = {
            let handles = self.backend.handles.lock().unwrap();
            let next_h = handles.get(&next).expect("switch target not registered with the simulator");
            let current_h = handles.get(&current).expect("current thread not registered with the simulator");
            (next_h.os_thread.clone(), Arc::clone(&next_h.runnable), Arc::clone(&current_h.runnable))
        };

        next_runnable.store(true, Ordering::Release);
        next_thread.unpark();

        while !current_runnable.swap(false, Ordering::AcqRel) {
            thread::park();
        }
    }
}

/// One compartment's RPC machinery plus the OS threads backing its
/// logical threads. The RPC server is spawned and running immediately;
/// application threads are added later via [`Compartment::run_application`].
pub struct Compartment {
    pub rt: Arc<CompartmentRuntime>,
    backend: Arc<SchedulerBackend>,
}

impl Compartment {
    pub fn new(
        backend: Arc<SchedulerBackend>,
        id: CompartmentId,
        n: u16,
        t: u32,
        shared: Arc<SharedRegion>,
        function_table: FunctionTable,
        max_idle_threads: usize,
    ) -> Self {
        let server_id = backend.reserve_id();
        let rt = Arc::new(CompartmentRuntime::new(id, n, t, shared, function_table, max_idle_threads, server_id));

        // The server is the compartment's first logical thread: pop it
        // off the runqueue it pre-seeded itself into before handing it
        // a real OS thread to run on.
        let popped = rt.scheduler.lock().schedule_initial();
        debug_assert_eq!(popped, Some(server_id));

        let runnable = Arc::new(AtomicBool::new(true));
        let backend_for_thread = Arc::clone(&backend);
        let rt_for_thread = Arc::clone(&rt);
        let join = thread::Builder::new()
            .name(format!("rpc-server-{}", id.get()))
            .spawn(move || {
                CURRENT.with(|c| c.set(Some(server_id)));
                let mut cs = SimSwitch::new(backend_for_thread, Arc::clone(&rt_for_thread));
                server::server_loop(&rt_for_thread, &mut cs);
            })
            .expect("failed to spawn simulated rpc server thread");
        let os_thread = join.thread().clone();
        backend.handles.lock().unwrap().insert(server_id, ThreadHandle { os_thread, runnable });

        Compartment { rt, backend }
    }

    /// Spawns a new `Application`-role OS thread running `body`, parked
    /// until the scheduler first switches to it, and enqueues it so
    /// the server can hand off to it. Blocks the caller until `body`
    /// returns.
    pub fn run_application<R, F>(&self, body: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&Arc<CompartmentRuntime>, &mut SimSwitch) -> R + Send + 'static,
    {
        let id = self.backend.reserve_id();
        self.rt.register_thread(id, ThreadRole::Application);

        let runnable = Arc::new(AtomicBool::new(false));
        let backend = Arc::clone(&self.backend);
        let rt = Arc::clone(&self.rt);
        let runnable_for_thread = Arc::clone(&runnable);
        let join = thread::Builder::new()
            .name(format!("rpc-app-{}", id.0))
            .spawn(move || {
                CURRENT.with(|c| c.set(Some(id)));
                wait_for_first_schedule(&runnable_for_thread);
                let mut cs = SimSwitch::new(backend, Arc::clone(&rt));
                body(&rt, &mut cs)
            })
            .expect("failed to spawn simulated application thread");
        let os_thread = join.thread().clone();
        self.backend.handles.lock().unwrap().insert(id, ThreadHandle { os_thread, runnable });

        self.rt.scheduler.lock().enqueue(id);
        join.join().expect("simulated application thread panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc_abi::RpcIndex;
    use rpc_core::dispatch::CallProtectionMode;
    use rpc_core::server::execute_rpc;

    const N: u16 = 2;
    const T: u32 = 4;
    const MAX_IDLE: usize = 4;

    fn zero_args(_a: u64, _b: u64, _c: u64, _d: u64, _e: u64, _f: u64) -> u64 {
        0xDEADBEEF
    }

    fn sum6(a: u64, b: u64, c: u64, d: u64, e: u64, f: u64) -> u64 {
        a + b + c + d + e + f
    }

    fn build_pair(
        callee_entries: Vec<Option<rpc_core::dispatch::RpcFn>>,
    ) -> (Arc<SchedulerBackend>, Compartment, Compartment) {
        let backend = SchedulerBackend::new();
        let shared = Arc::new(SharedRegion::new(N, T));
        shared.init();

        let caller_table = FunctionTable::new(CallProtectionMode::Id, vec![None]).unwrap();
        let callee_table = FunctionTable::new(CallProtectionMode::Id, callee_entries).unwrap();

        let caller = Compartment::new(Arc::clone(&backend), CompartmentId::new(0), N, T, Arc::clone(&shared), caller_table, MAX_IDLE);
        let callee = Compartment::new(Arc::clone(&backend), CompartmentId::new(1), N, T, shared, callee_table, MAX_IDLE);
        (backend, caller, callee)
    }

    /// S1: a zero-argument call returns the callee's fixed sentinel.
    #[test]
    fn zero_arg_call_returns_sentinel() {
        let (_backend, caller, _callee) = build_pair(vec![None, Some(zero_args as rpc_core::dispatch::RpcFn)]);
        let target = CompartmentId::new(1);

        let ret = caller.run_application(move |rt, cs| {
            let rpc_index = rt.rpc_index_of(0);
            execute_rpc(rt, cs, rpc_index, target, 1, &[], true)
        });

        assert_eq!(ret, 0xDEADBEEF);
    }

    /// S2: a six-argument call sums all six words.
    #[test]
    fn six_arg_call_sums_all_words() {
        let (_backend, caller, _callee) = build_pair(vec![None, Some(sum6 as rpc_core::dispatch::RpcFn)]);
        let target = CompartmentId::new(1);

        let ret = caller.run_application(move |rt, cs| {
            let rpc_index = rt.rpc_index_of(0);
            execute_rpc(rt, cs, rpc_index, target, 1, &[1, 2, 3, 4, 5, 6], true)
        });

        assert_eq!(ret, 21);
    }

    /// S6: an out-of-range function id is refused rather than jumped
    /// to, and the call still completes with a designated value.
    #[test]
    fn out_of_range_function_id_is_refused_not_jumped() {
        let (_backend, caller, _callee) = build_pair(vec![None, Some(sum6 as rpc_core::dispatch::RpcFn)]);
        let target = CompartmentId::new(1);

        let ret = caller.run_application(move |rt, cs| {
            let rpc_index = rt.rpc_index_of(0);
            execute_rpc(rt, cs, rpc_index, target, 99, &[1, 2, 3], true)
        });

        assert_eq!(ret, 0);
    }

    /// S5: a worker assigned to an RPC index is sticky for the
    /// compartment's lifetime (it is never returned to the idle pool,
    /// so it can be reused directly the next time the same caller
    /// thread calls again) — so sequential calls on three *distinct*
    /// caller indices each need their own dedicated worker rather than
    /// recycling one.
    #[test]
    fn distinct_caller_indices_each_get_a_dedicated_worker() {
        let (_backend, caller, callee) = build_pair(vec![None, Some(zero_args as rpc_core::dispatch::RpcFn)]);
        let target = CompartmentId::new(1);

        for tid_small in 0..3u32 {
            let ret = caller.run_application(move |rt, cs| {
                let rpc_index = RpcIndex::new(CompartmentId::new(0), tid_small, T);
                execute_rpc(rt, cs, rpc_index, target, 1, &[], true)
            });
            assert_eq!(ret, 0xDEADBEEF);
        }

        assert_eq!(callee.rt.threads.lock().thread_cnt(), 3);
        assert_eq!(callee.rt.threads.lock().idle_cnt(), 0);
    }

    /// S5 (repeat calls): calling the *same* caller index again reuses
    /// its already-bound worker rather than allocating another.
    #[test]
    fn repeat_calls_on_the_same_index_reuse_its_bound_worker() {
        let (_backend, caller, callee) = build_pair(vec![None, Some(zero_args as rpc_core::dispatch::RpcFn)]);
        let target = CompartmentId::new(1);

        for _ in 0..3 {
            let ret = caller.run_application(move |rt, cs| {
                let rpc_index = rt.rpc_index_of(0);
                execute_rpc(rt, cs, rpc_index, target, 1, &[], true)
            });
            assert_eq!(ret, 0xDEADBEEF);
        }

        assert_eq!(callee.rt.threads.lock().thread_cnt(), 1);
        assert_eq!(callee.rt.threads.lock().idle_cnt(), 0);
    }
}
