#![no_std]

//! Wire types and bit-packing for the cross-compartment RPC shared region.
//!
//! This crate carries no logic, only the layout that must be bit-exact
//! across every compartment that maps the shared region: the message
//! encoding, the CTRL `extended_state`/`f_info` packing, and the
//! pair-chunk addressing formula. Keeping it dependency-free means a
//! bare-metal consumer can place these types at a fixed virtual
//! address without pulling in `rpc_core`'s scheduler/alloc-using logic.

/// Maximum number of machine-word arguments a single RPC can carry.
pub const MAX_ARGS: usize = 6;

/// Usable capacity of a message queue ring (one slot is a sentinel).
pub const MSGQ_CAPACITY: usize = 7;

/// A compartment identifier, `[0, N)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompartmentId(pub u16);

impl CompartmentId {
    pub const fn new(id: u16) -> Self {
        CompartmentId(id)
    }

    pub const fn get(self) -> u16 {
        self.0
    }
}

/// The RPC index: `caller_comp * T + caller_tid_small`, the only
/// identifier exchanged over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RpcIndex(pub u32);

impl RpcIndex {
    /// Computes the RPC index for a caller compartment and its
    /// in-compartment small thread index, given the per-compartment
    /// thread-slot count `t`.
    pub fn new(caller_comp: CompartmentId, caller_tid_small: u32, t: u32) -> Self {
        RpcIndex(caller_comp.get() as u32 * t + caller_tid_small)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// Recovers `(caller_comp, caller_tid_small)` given `t`.
    pub fn split(self, t: u32) -> (CompartmentId, u32) {
        (CompartmentId::new((self.0 / t) as u16), self.0 % t)
    }
}

/// State of an RPC control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CtrlState {
    Idle = 0,
    Called = 1,
    Returned = 2,
}

impl CtrlState {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CtrlState::Idle),
            1 => Some(CtrlState::Called),
            2 => Some(CtrlState::Returned),
            _ => None,
        }
    }
}

/// Packs `{key_from, key_to, state}` into the CTRL `extended_state` word.
///
/// Layout: `(key_from << 16) | (key_to << 8) | state`.
pub const fn pack_extended_state(key_from: u8, key_to: u8, state: CtrlState) -> u64 {
    ((key_from as u64) << 16) | ((key_to as u64) << 8) | (state as u64)
}

/// Unpacks `(state, key_from, key_to)` from a CTRL `extended_state` word.
///
/// Panics if the low byte does not encode a valid `CtrlState`; a
/// malformed state word is a protocol violation, not a recoverable
/// condition (see `RpcError::ProtocolViolation`).
pub fn unpack_extended_state(word: u64) -> (CtrlState, u8, u8) {
    let state = CtrlState::from_u8((word & 0xff) as u8)
        .unwrap_or_else(|| panic!("corrupt CTRL state byte: {:#x}", word & 0xff));
    let key_to = ((word >> 8) & 0xff) as u8;
    let key_from = ((word >> 16) & 0xff) as u8;
    (state, key_from, key_to)
}

/// Packs `{argc, has_return}` into the CTRL `f_info` word.
pub const fn pack_f_info(argc: u8, has_return: bool) -> u64 {
    ((has_return as u64) << 8) | (argc as u64)
}

/// Unpacks `(argc, has_return)` from an `f_info` word.
pub const fn unpack_f_info(word: u64) -> (u8, bool) {
    ((word & 0xff) as u8, (word >> 8) & 1 != 0)
}

/// Packs `{rpc_index, other_compartment}` into a 16-bit message payload.
///
/// The bit split depends on the configured `n` (compartment count) and
/// `t` (thread slots per compartment): `rpc_index` needs
/// `ceil(log2(n*t))` bits, the rest go to `other_compartment`. This must
/// be re-derived per build configuration and is asserted to fit in 16
/// bits — there is no single fixed split, unlike the CTRL packings
/// above.
pub fn pack_message(rpc_index: RpcIndex, other_comp: CompartmentId, rpc_index_bits: u32) -> u16 {
    assert!(rpc_index_bits <= 16, "rpc_index_bits must fit in 16 bits");
    assert!(
        rpc_index.get() < (1u32 << rpc_index_bits),
        "rpc_index {} does not fit in {} bits",
        rpc_index.get(),
        rpc_index_bits
    );
    let other_comp_bits = 16 - rpc_index_bits;
    assert!(
        (other_comp.get() as u32) < (1u32 << other_comp_bits),
        "other_comp {} does not fit in {} bits",
        other_comp.get(),
        other_comp_bits
    );
    (((other_comp.get() as u32) << rpc_index_bits) | rpc_index.get()) as u16
}

/// Inverse of [`pack_message`].
pub fn unpack_message(word: u16, rpc_index_bits: u32) -> (RpcIndex, CompartmentId) {
    let mask = (1u32 << rpc_index_bits) - 1;
    let word = word as u32;
    let rpc_index = RpcIndex(word & mask);
    let other_comp = CompartmentId::new((word >> rpc_index_bits) as u16);
    (rpc_index, other_comp)
}

/// The minimum number of bits needed to represent `n * t` distinct RPC
/// indices, asserted (by the caller) to leave room for the
/// `other_compartment` field in a 16-bit message word.
pub const fn rpc_index_bits_for(n: u32, t: u32) -> u32 {
    let total = n * t;
    if total <= 1 {
        1
    } else {
        32 - (total - 1).leading_zeros()
    }
}

/// Pair-chunk index for the unordered compartment pair `{a, b}`,
/// `a < b`, within a triangular array of `n*(n-1)/2` chunks.
///
/// `chunk_index(n, a, b) = a*n - a*(a+3)/2 - 1 + b`.
pub fn chunk_index(n: u16, comp_a: CompartmentId, comp_b: CompartmentId) -> usize {
    assert_ne!(comp_a, comp_b, "chunk_index requires distinct compartments");
    let (a, b) = if comp_a.get() < comp_b.get() {
        (comp_a.get(), comp_b.get())
    } else {
        (comp_b.get(), comp_a.get())
    };
    let n = n as i64;
    let a = a as i64;
    let b = b as i64;
    (a * n - (a * (a + 3)) / 2 - 1 + b) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_state_round_trips() {
        let w = pack_extended_state(3, 7, CtrlState::Called);
        assert_eq!(unpack_extended_state(w), (CtrlState::Called, 3, 7));
    }

    #[test]
    fn f_info_round_trips() {
        assert_eq!(unpack_f_info(pack_f_info(6, true)), (6, true));
        assert_eq!(unpack_f_info(pack_f_info(0, false)), (0, false));
    }

    #[test]
    fn message_round_trips() {
        let bits = rpc_index_bits_for(4, 8); // n*t = 32 -> 5 bits
        assert_eq!(bits, 5);
        let idx = RpcIndex::new(CompartmentId::new(2), 5, 8);
        let word = pack_message(idx, CompartmentId::new(3), bits);
        assert_eq!(unpack_message(word, bits), (idx, CompartmentId::new(3)));
    }

    #[test]
    fn chunk_index_covers_all_pairs_exactly_once() {
        let n: u16 = 5;
        let mut seen = [false; 10];
        for a in 0..n {
            for b in (a + 1)..n {
                let idx = chunk_index(n, CompartmentId::new(a), CompartmentId::new(b));
                assert!(!seen[idx], "duplicate chunk index {idx} for ({a},{b})");
                seen[idx] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn rpc_index_split_inverts_new() {
        let idx = RpcIndex::new(CompartmentId::new(3), 5, 8);
        assert_eq!(idx.split(8), (CompartmentId::new(3), 5));
    }
}
