//! The RPC server loop, worker loop, and `execute_rpc`/
//! `tmp_rpc_server_loop` nested-call machinery.
//!
//! Notable control-flow choices: `CALLED` is set before the
//! notification is enqueued; `tmp_rpc_server_loop` runs both right
//! after sending and inside the nested-call re-entry arm; the worker
//! binding is only cleared when the outermost call on an `Application`
//! thread returns.

use rpc_abi::{pack_message, unpack_message, CompartmentId, CtrlState, RpcIndex};

use crate::ctrl::CallView;
use crate::dispatch::FunctionTable;
use crate::error::RpcError;
use crate::runtime::CompartmentRuntime;
use crate::scheduler::{ContextSwitch, RunqueueStatus};
use crate::thread_manager::{ThreadId, ThreadRole};

/// Resolves and invokes the callee for one observed call, bracketing
/// it with the recursion counter (incremented at entry, decremented at
/// exit) so worker-binding cleanup only ever happens for the outermost
/// call. Dispatch failures (out-of-range function id, bad argc) are
/// logged and surfaced as a designated zero return rather than a jump
/// to an arbitrary address.
fn eval_func(rt: &CompartmentRuntime, rpc_index: RpcIndex, view: &CallView) -> u64 {
    rt.threads.lock().enter_call(rpc_index);
    let result = rt
        .function_table
        .resolve(view.func)
        .and_then(|f| FunctionTable::dispatch(f, &view.parameters, view.argc));
    rt.threads.lock().exit_call(rpc_index);
    match result {
        Ok(ret) => ret,
        Err(err) => {
            log::error!("RPC dispatch refused for rpc_index={}: {err:?}", rpc_index.get());
            0
        }
    }
}

/// Assigns (or reuses) the worker owning `rpc_index`, allocating a new
/// one via `cs.create_thread()` if the idle pool is empty, and
/// registers it in the per-thread state table as an `RpcWorker`.
fn assign_rpc_thread(
    rt: &CompartmentRuntime,
    cs: &mut impl ContextSwitch,
    rpc_index: RpcIndex,
) -> Result<ThreadId, RpcError> {
    let thread = rt.threads.lock().assign_rpc_thread(rpc_index, || Ok(cs.create_thread()))?;
    let mut state = rt.thread_state.lock();
    let entry = state
        .entry(thread)
        .or_insert_with(|| crate::runtime::ThreadState::new(ThreadRole::RpcWorker));
    entry.rpc_index = Some(rpc_index);
    entry.is_rpc_thread = true;
    Ok(thread)
}

/// The "key nested-call trick": a worker (or caller) that just posted
/// its own notification must not go to sleep unconditionally — the
/// next event may be its own expected reply or a nested inbound call
/// reusing the same RPC index. Returns once `current`'s own event has
/// arrived; may switch away to service unrelated traffic first.
fn tmp_rpc_server_loop(rt: &CompartmentRuntime, cs: &mut impl ContextSwitch, current: ThreadId, rpc_index: RpcIndex) {
    let status = rt.scheduler.lock().runqueue_status();
    let busy_wait = matches!(status, RunqueueStatus::Empty | RunqueueStatus::RpcServerOnly);

    let own_msgq = rt.shared.msgq(rt.id);
    let msg = if busy_wait {
        own_msgq.get_blocking()
    } else {
        match own_msgq.try_get() {
            Some(m) => m,
            None => {
                let next = rt.scheduler.lock().rpc_yield(current, rt.is_rpc_thread(current));
                if let Some(next) = next {
                    cs.switch(next);
                }
                return;
            }
        }
    };

    let (msg_rpc_index, _other_comp) = unpack_message(msg, rt.rpc_index_bits);
    if msg_rpc_index != rpc_index {
        // `current` is not re-enqueued here: it is parked awaiting its
        // own rpc_index, and is resumed only when that event arrives,
        // via `assign_rpc_thread`'s existing-binding fast path. Putting
        // it on the generic ready queue as well would let an unrelated
        // `rpc_yield`/`yield_now` elsewhere pop and resume it before its
        // awaited CTRL transition has actually happened.
        let next = assign_rpc_thread(rt, cs, msg_rpc_index).expect("worker pool exhausted servicing inbound RPC");
        cs.switch(next);
    }
}

/// The per-compartment RPC server's main loop: drains the receive
/// queue, assigns workers, and switches to them. Never returns.
pub fn server_loop(rt: &CompartmentRuntime, cs: &mut impl ContextSwitch) -> ! {
    let current = cs.current_thread();
    loop {
        let msgq = rt.shared.msgq(rt.id);
        let msg = match msgq.try_get() {
            Some(m) => m,
            None => {
                log::debug!("RPC server yielding, compartment {}", rt.id.get());
                let next = rt.scheduler.lock().rpc_yield(current, false);
                if let Some(next) = next {
                    cs.switch(next);
                }
                continue;
            }
        };

        let (rpc_index, other_comp) = unpack_message(msg, rt.rpc_index_bits);
        let next = assign_rpc_thread(rt, cs, rpc_index).expect("worker pool exhausted accepting inbound RPC");
        log::debug!(
            "compartment {} received rpc_index={} from {}, handing to worker",
            rt.id.get(),
            rpc_index.get(),
            other_comp.get()
        );

        // Make sure the server itself stays in the runqueue.
        rt.scheduler.lock().enqueue(current);
        cs.switch(next);
    }
}

/// A freshly assigned worker's main loop: evaluate one call, reply,
/// then sit in `tmp_rpc_server_loop` until the next one arrives. Never
/// returns (the handle is recycled across calls on the same RPC
/// index).
pub fn rpc_thread_func(rt: &CompartmentRuntime, cs: &mut impl ContextSwitch) -> ! {
    let current = cs.current_thread();
    let rpc_index = rt
        .thread_state
        .lock()
        .get(&current)
        .and_then(|s| s.rpc_index)
        .expect("rpc worker started without an assigned rpc_index");

    let (calling_comp, _) = rpc_index.split(rt.t);

    loop {
        let ctrl = rt.shared.ctrl(rpc_index, rt.id, calling_comp);
        let view = ctrl.read_call(rt.id.get() as u8);
        ctrl.ack_called();

        let ret = eval_func(rt, rpc_index, &view);
        ctrl.write_return(ret, view.has_return, rt.id.get() as u8, view.key_from);

        let reply = pack_message(rpc_index, rt.id, rt.rpc_index_bits);
        let reply_target = CompartmentId::new(view.key_from as u16);
        rt.shared.msgq(reply_target).put(reply, || {
            let next = rt.scheduler.lock().yield_now(current);
            if let Some(next) = next {
                cs.switch(next);
            }
        });

        tmp_rpc_server_loop(rt, cs, current, rpc_index);
    }
}

/// Invokes `func` in `target`, blocking (via cooperative switches,
/// never the caller's OS thread) until the reply arrives. Handles
/// nested inbound calls on the same RPC index along the way.
#[allow(clippy::too_many_arguments)]
pub fn execute_rpc(
    rt: &CompartmentRuntime,
    cs: &mut impl ContextSwitch,
    rpc_index: RpcIndex,
    target: CompartmentId,
    func: u64,
    parameters: &[u64],
    has_return: bool,
) -> u64 {
    let current = cs.current_thread();
    let self_id = rt.id;

    let ctrl = rt.shared.ctrl(rpc_index, self_id, target);
    ctrl.write_call(func, parameters, has_return, self_id.get() as u8, target.get() as u8);

    let already_bound = rt.threads.lock().entry_thread(rpc_index).is_some();
    if !already_bound {
        rt.threads.lock().bind_thread(rpc_index, current);
        rt.set_is_rpc_thread(current, true);
    }

    let msg = pack_message(rpc_index, self_id, rt.rpc_index_bits);
    rt.shared.msgq(target).put(msg, || {
        let next = rt.scheduler.lock().yield_now(current);
        if let Some(next) = next {
            cs.switch(next);
        }
    });

    tmp_rpc_server_loop(rt, cs, current, rpc_index);

    loop {
        let ctrl = rt.shared.ctrl(rpc_index, self_id, target);

        match ctrl.state() {
            CtrlState::Called => {
                // Nested re-entry: the callee has called back into us
                // on the same RPC index before replying.
                let view = ctrl.read_call(self_id.get() as u8);
                ctrl.ack_called();
                let ret = eval_func(rt, rpc_index, &view);
                ctrl.write_return(ret, view.has_return, self_id.get() as u8, view.key_from);

                let reply = pack_message(rpc_index, self_id, rt.rpc_index_bits);
                let reply_target = CompartmentId::new(view.key_from as u16);
                rt.shared.msgq(reply_target).put(reply, || {
                    let next = rt.scheduler.lock().yield_now(current);
                    if let Some(next) = next {
                        cs.switch(next);
                    }
                });
                tmp_rpc_server_loop(rt, cs, current, rpc_index);
            }
            CtrlState::Returned => {
                let ret = ctrl.take_return(self_id.get() as u8);
                let recursion_zero = rt.threads.lock().recursion(rpc_index) == 0;
                if recursion_zero && rt.role_of(current) == ThreadRole::Application {
                    // `current` was bound via `bind_thread`, not pool-managed
                    // (it was never counted by `add_idle_rpc_thread`/`allocate`),
                    // so clear the entry directly rather than returning it to
                    // the idle worker pool.
                    rt.threads.lock().unbind_thread(rpc_index);
                    rt.set_is_rpc_thread(current, false);
                }
                return ret;
            }
            CtrlState::Idle => panic!("protocol violation: CTRL idle while caller awaits reply"),
        }
    }
}
