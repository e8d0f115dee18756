//! Function-id indirection and the fixed-arity dispatch trampoline.

use alloc::vec::Vec;

use rpc_abi::MAX_ARGS;

use crate::error::RpcError;

/// A resolved RPC callee: the only shape of function this core ever
/// calls (`fn(u64,u64,u64,u64,u64,u64) -> u64`), which sidesteps
/// needing an architecture-specific trampoline for the portable core.
pub type RpcFn = fn(u64, u64, u64, u64, u64, u64) -> u64;

/// Call-protection mode, selected at `FunctionTable` construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallProtectionMode {
    /// Raw function pointer carried in the CTRL, no validation.
    /// Benchmarking baseline only; gated behind the
    /// `insecure-raw-pointer-calls` feature so a default build can
    /// never construct a table in this mode.
    None,
    /// Small integer index validated against a callee-local table.
    Id,
    /// Reserved, unimplemented: constructing a table with this mode
    /// fails immediately.
    PtrCheck,
}

/// A callee-local, read-only table resolving small integer ids to
/// function pointers. Index 0 is reserved for "invalid".
pub struct FunctionTable {
    mode: CallProtectionMode,
    entries: Vec<Option<RpcFn>>,
}

impl FunctionTable {
    pub fn new(mode: CallProtectionMode, entries: Vec<Option<RpcFn>>) -> Result<Self, RpcError> {
        if mode == CallProtectionMode::PtrCheck {
            return Err(RpcError::UnimplementedCallProtectionMode);
        }
        if mode == CallProtectionMode::None && cfg!(not(feature = "insecure-raw-pointer-calls")) {
            return Err(RpcError::UnimplementedCallProtectionMode);
        }
        Ok(FunctionTable { mode, entries })
    }

    pub fn mode(&self) -> CallProtectionMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves `func` (a table index in `Id` mode, a raw pointer
    /// encoded as `u64` in `None` mode) to a callable, or refuses with
    /// [`RpcError::FunctionIndexOutOfRange`] without ever jumping to an
    /// arbitrary address. Index 0 is always refused, matching the
    /// "index 0 reserved for invalid" convention.
    pub fn resolve(&self, func: u64) -> Result<RpcFn, RpcError> {
        match self.mode {
            CallProtectionMode::Id => {
                let index = func as usize;
                if index == 0 {
                    return Err(RpcError::FunctionIndexOutOfRange {
                        index: 0,
                        size: self.entries.len().min(u16::MAX as usize) as u16,
                    });
                }
                match self.entries.get(index).copied().flatten() {
                    Some(f) => Ok(f),
                    None => Err(RpcError::FunctionIndexOutOfRange {
                        index: func.min(u16::MAX as u64) as u16,
                        size: self.entries.len().min(u16::MAX as usize) as u16,
                    }),
                }
            }
            CallProtectionMode::None => {
                #[cfg(feature = "insecure-raw-pointer-calls")]
                {
                    if func == 0 {
                        return Err(RpcError::FunctionIndexOutOfRange { index: 0, size: 0 });
                    }
                    // SAFETY: caller configured `None` mode and is
                    // responsible for `func` being a valid `RpcFn`
                    // pointer. Benchmarking baseline, never the
                    // default.
                    let f: RpcFn = unsafe { core::mem::transmute::<usize, RpcFn>(func as usize) };
                    Ok(f)
                }
                #[cfg(not(feature = "insecure-raw-pointer-calls"))]
                {
                    let _ = func;
                    unreachable!("FunctionTable::new refuses None without the feature enabled")
                }
            }
            CallProtectionMode::PtrCheck => unreachable!("FunctionTable::new refuses PtrCheck"),
        }
    }

    /// Dispatches `f` with the first `argc` words of `parameters`
    /// live, the rest zero-filled — the fixed six-register trampoline.
    pub fn dispatch(f: RpcFn, parameters: &[u64; MAX_ARGS], argc: u8) -> Result<u64, RpcError> {
        if argc as usize > MAX_ARGS {
            return Err(RpcError::InvalidArgCount { argc });
        }
        Ok(f(
            parameters[0],
            parameters[1],
            parameters[2],
            parameters[3],
            parameters[4],
            parameters[5],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum6(a: u64, b: u64, c: u64, d: u64, e: u64, f: u64) -> u64 {
        a + b + c + d + e + f
    }

    fn zero_args(_a: u64, _b: u64, _c: u64, _d: u64, _e: u64, _f: u64) -> u64 {
        0xDEADBEEF
    }

    #[test]
    fn id_mode_resolves_and_dispatches() {
        let table = FunctionTable::new(
            CallProtectionMode::Id,
            alloc::vec![None, Some(zero_args as RpcFn), Some(sum6 as RpcFn)],
        )
        .unwrap();

        let f = table.resolve(1).unwrap();
        assert_eq!(FunctionTable::dispatch(f, &[0; MAX_ARGS], 0).unwrap(), 0xDEADBEEF);

        let f = table.resolve(2).unwrap();
        let params = [1, 2, 3, 4, 5, 6];
        assert_eq!(FunctionTable::dispatch(f, &params, 6).unwrap(), 21);
    }

    #[test]
    fn id_mode_refuses_index_zero_and_out_of_range() {
        let table = FunctionTable::new(CallProtectionMode::Id, alloc::vec![None, Some(sum6 as RpcFn)]).unwrap();
        assert_eq!(
            table.resolve(0),
            Err(RpcError::FunctionIndexOutOfRange { index: 0, size: 2 })
        );
        assert_eq!(
            table.resolve(2),
            Err(RpcError::FunctionIndexOutOfRange { index: 2, size: 2 })
        );
    }

    #[test]
    fn ptr_check_mode_is_refused_at_construction() {
        assert_eq!(
            FunctionTable::new(CallProtectionMode::PtrCheck, alloc::vec![]).unwrap_err(),
            RpcError::UnimplementedCallProtectionMode
        );
    }

    #[test]
    fn dispatch_rejects_argc_over_max() {
        assert_eq!(
            FunctionTable::dispatch(sum6 as RpcFn, &[0; MAX_ARGS], 7),
            Err(RpcError::InvalidArgCount { argc: 7 })
        );
    }
}
