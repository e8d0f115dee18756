//! Error taxonomy for the RPC core (see the error-handling design:
//! resource exhaustion and MSGQ-full/idle-pool-empty are locally
//! recoverable; everything else is a fatal protocol violation, usually
//! surfaced as a panic at the point of detection rather than through
//! this enum).

use rpc_abi::CtrlState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcError {
    /// `add_idle_rpc_thread` hit `MAX_IDLE_THREADS`.
    WorkerPoolFull,
    /// The scheduler's thread/stack/TLS allocator failed.
    AllocationFailed,
    /// A CTRL was observed in an unexpected state.
    ProtocolViolation { expected: CtrlState, actual: CtrlState },
    /// A function-id dispatch index was `>= TABLE_SIZE`, or index 0
    /// ("invalid") was used.
    FunctionIndexOutOfRange { index: u16, size: u16 },
    /// `argc > 6`, or `argc` otherwise inconsistent with the call.
    InvalidArgCount { argc: u8 },
    /// A `try_put` found the message queue full.
    MsgQueueFull,
    /// A `FunctionTable` was constructed with the reserved,
    /// unimplemented `PtrCheck` call-protection mode.
    UnimplementedCallProtectionMode,
}
