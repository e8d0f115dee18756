//! Cross-compartment RPC core for a compartmentalized unikernel.
//!
//! This crate implements the CTRL/MSGQ shared-memory protocol, the
//! per-compartment RPC thread manager, the RPC server/worker loops
//! (with nested-call re-entry), a function-id indirection table, a
//! bitfield primitive for free-slot selection, and the RPC-aware
//! cooperative scheduler hooks. Physical EPT setup, boot ordering and
//! the low-level register context switch are external collaborators
//! (see [`scheduler::ContextSwitch`]); this crate only specifies what
//! they must guarantee.
//!
//! Host-testable: built with `std` under `cargo test` (see the
//! `cfg_attr` below), `no_std` otherwise.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bitfield;
pub mod ctrl;
pub mod dispatch;
pub mod error;
pub mod init_barrier;
pub mod msgq;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod shared_region;
pub mod thread_manager;

pub use rpc_abi as abi;
