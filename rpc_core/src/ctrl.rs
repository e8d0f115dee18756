//! The RPC control block (CTRL): the shared-memory rendezvous for one
//! caller/callee pair at one RPC index.

use core::sync::atomic::{AtomicU64, Ordering};

use rpc_abi::{pack_extended_state, pack_f_info, unpack_extended_state, unpack_f_info, CtrlState, MAX_ARGS};

use crate::error::RpcError;

/// A snapshot of a call read out of a CTRL after it transitioned to
/// `Called`.
#[derive(Debug, Clone, Copy)]
pub struct CallView {
    pub func: u64,
    pub parameters: [u64; MAX_ARGS],
    pub argc: u8,
    pub has_return: bool,
    pub key_from: u8,
    pub key_to: u8,
}

/// One RPC control block. All fields are atomics: the `extended_state`
/// transitions use Release/Acquire to establish happens-before for the
/// plain data words, which are themselves accessed with `Relaxed`
/// ordering — the standard release/acquire message-passing idiom.
pub struct CtrlRecord {
    func: AtomicU64,
    extended_state: AtomicU64,
    parameters: [AtomicU64; MAX_ARGS],
    ret: AtomicU64,
    f_info: AtomicU64,
}

impl CtrlRecord {
    pub const fn new() -> Self {
        CtrlRecord {
            func: AtomicU64::new(0),
            extended_state: AtomicU64::new(pack_extended_state(0, 0, CtrlState::Idle)),
            parameters: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            ret: AtomicU64::new(0),
            f_info: AtomicU64::new(0),
        }
    }

    /// Resets to the `Idle` state with zeroed keys. Only safe to call
    /// before the CTRL is shared, i.e. at init time.
    pub fn reset(&self) {
        self.func.store(0, Ordering::Relaxed);
        self.ret.store(0, Ordering::Relaxed);
        self.f_info.store(0, Ordering::Relaxed);
        for p in &self.parameters {
            p.store(0, Ordering::Relaxed);
        }
        self.extended_state
            .store(pack_extended_state(0, 0, CtrlState::Idle), Ordering::Release);
    }

    pub fn state(&self) -> CtrlState {
        let (state, _, _) = unpack_extended_state(self.extended_state.load(Ordering::Acquire));
        state
    }

    fn keys(&self) -> (u8, u8) {
        let (_, key_from, key_to) = unpack_extended_state(self.extended_state.load(Ordering::Acquire));
        (key_from, key_to)
    }

    /// Caller-only: writes arguments and `func`/`f_info`, then
    /// transitions `Idle -> Called` with a release store. Panics (a
    /// protocol violation, per the error-handling policy) if the CTRL
    /// was not `Idle`.
    pub fn write_call(
        &self,
        func: u64,
        parameters: &[u64],
        has_return: bool,
        key_from: u8,
        key_to: u8,
    ) {
        assert!(
            parameters.len() <= MAX_ARGS,
            "argc {} exceeds MAX_ARGS {MAX_ARGS}",
            parameters.len()
        );
        let prior = self.state();
        assert_eq!(
            prior,
            CtrlState::Idle,
            "write_call on CTRL not Idle (found {prior:?}) — protocol violation"
        );

        self.func.store(func, Ordering::Relaxed);
        for (i, slot) in self.parameters.iter().enumerate() {
            slot.store(parameters.get(i).copied().unwrap_or(0), Ordering::Relaxed);
        }
        self.f_info
            .store(pack_f_info(parameters.len() as u8, has_return), Ordering::Relaxed);
        self.extended_state.store(
            pack_extended_state(key_from, key_to, CtrlState::Called),
            Ordering::Release,
        );
    }

    /// Callee-only: reads a `Called` CTRL's contents. Panics if the
    /// CTRL is not `Called` — a protocol violation.
    pub fn read_call(&self, expected_key_to: u8) -> CallView {
        let ext = self.extended_state.load(Ordering::Acquire);
        let (state, key_from, key_to) = unpack_extended_state(ext);
        assert_eq!(
            state,
            CtrlState::Called,
            "read_call on CTRL not Called (found {state:?}) — protocol violation"
        );
        assert_eq!(
            key_to, expected_key_to,
            "read_call observed key_to={key_to}, expected {expected_key_to} — protocol violation"
        );
        let f_info = self.f_info.load(Ordering::Relaxed);
        let (argc, has_return) = unpack_f_info(f_info);
        assert!(argc as usize <= MAX_ARGS, "argc {argc} exceeds MAX_ARGS {MAX_ARGS}");
        let mut parameters = [0u64; MAX_ARGS];
        for (i, slot) in self.parameters.iter().enumerate() {
            parameters[i] = slot.load(Ordering::Relaxed);
        }
        CallView {
            func: self.func.load(Ordering::Relaxed),
            parameters,
            argc,
            has_return,
            key_from,
            key_to,
        }
    }

    /// Callee-only: acknowledges take-over by moving `Called -> Idle`
    /// (zeroed keys) before evaluating the function. This is the
    /// "acknowledging take-over" step of the worker/nested-re-entry
    /// loop.
    pub fn ack_called(&self) {
        let prior = self.state();
        assert_eq!(
            prior,
            CtrlState::Called,
            "ack_called on CTRL not Called (found {prior:?}) — protocol violation"
        );
        self.extended_state
            .store(pack_extended_state(0, 0, CtrlState::Idle), Ordering::Release);
    }

    /// Callee-only: writes the return word (if any) and transitions to
    /// `Returned` with the keys swapped (`key_from` becomes the
    /// callee, `key_to` becomes the original caller).
    pub fn write_return(&self, ret: u64, has_return: bool, key_from: u8, key_to: u8) {
        if has_return {
            self.ret.store(ret, Ordering::Relaxed);
        }
        self.extended_state.store(
            pack_extended_state(key_from, key_to, CtrlState::Returned),
            Ordering::Release,
        );
    }

    /// Caller-only: reads the return value of a `Returned` CTRL and
    /// transitions it back to `Idle`, completing the state cycle.
    pub fn take_return(&self, expected_key_to: u8) -> u64 {
        let ext = self.extended_state.load(Ordering::Acquire);
        let (state, _key_from, key_to) = unpack_extended_state(ext);
        assert_eq!(
            state,
            CtrlState::Returned,
            "take_return on CTRL not Returned (found {state:?}) — protocol violation"
        );
        assert_eq!(
            key_to, expected_key_to,
            "take_return observed key_to={key_to}, expected {expected_key_to} — protocol violation"
        );
        let ret = self.ret.load(Ordering::Relaxed);
        self.extended_state
            .store(pack_extended_state(0, 0, CtrlState::Idle), Ordering::Release);
        ret
    }

    /// Returns `Ok(())` if the CTRL is back to the closed state
    /// (`Idle`, both keys zero), else a descriptive `RpcError` for
    /// callers that prefer a `Result` over a panic.
    pub fn check_closed(&self) -> Result<(), RpcError> {
        let ext = self.extended_state.load(Ordering::Acquire);
        let (state, key_from, key_to) = unpack_extended_state(ext);
        if state == CtrlState::Idle && key_from == 0 && key_to == 0 {
            Ok(())
        } else {
            Err(RpcError::ProtocolViolation {
                expected: CtrlState::Idle,
                actual: state,
            })
        }
    }
}

impl Default for CtrlRecord {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_call_and_return() {
        let ctrl = CtrlRecord::new();
        ctrl.write_call(0xDEAD, &[1, 2, 3], true, 0, 1);
        assert_eq!(ctrl.state(), CtrlState::Called);

        let view = ctrl.read_call(1);
        assert_eq!(view.func, 0xDEAD);
        assert_eq!(view.argc, 3);
        assert!(view.has_return);
        assert_eq!(&view.parameters[..3], &[1, 2, 3]);

        ctrl.ack_called();
        assert_eq!(ctrl.state(), CtrlState::Idle);

        ctrl.write_return(0xBEEF, true, view.key_to, view.key_from);
        assert_eq!(ctrl.state(), CtrlState::Returned);

        let ret = ctrl.take_return(0);
        assert_eq!(ret, 0xBEEF);
        assert!(ctrl.check_closed().is_ok());
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn write_call_on_non_idle_panics() {
        let ctrl = CtrlRecord::new();
        ctrl.write_call(1, &[], false, 0, 1);
        ctrl.write_call(2, &[], false, 0, 1);
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn read_call_before_called_panics() {
        let ctrl = CtrlRecord::new();
        let _ = ctrl.read_call(0);
    }
}
