//! The cross-compartment shared-memory region: message queues, CTRL
//! chunks, and the init barrier.

use alloc::vec::Vec;

use rpc_abi::{chunk_index, CompartmentId, RpcIndex};

use crate::ctrl::CtrlRecord;
use crate::init_barrier::InitBarrier;
use crate::msgq::MsgQueue;

/// Heap-backed stand-in for a fixed-virtual-address mapping. A
/// bare-metal port would construct this over an `mmap`-at-fixed-address
/// region instead; callers only ever see the accessors below, per the
/// `shared_region() -> &SharedLayout` abstraction.
pub struct SharedRegion {
    n: u16,
    t: u32,
    barrier: InitBarrier,
    msgqs: Vec<MsgQueue>,
    /// `n*(n-1)/2` chunks, each holding `t` CTRL records.
    ctrl_chunks: Vec<Vec<CtrlRecord>>,
}

impl SharedRegion {
    pub fn new(n: u16, t: u32) -> Self {
        assert!(n >= 1, "compartment count must be at least 1");
        let mut msgqs = Vec::with_capacity(n as usize);
        msgqs.resize_with(n as usize, MsgQueue::new);

        let num_chunks = (n as usize) * (n as usize).saturating_sub(1) / 2;
        let mut ctrl_chunks = Vec::with_capacity(num_chunks);
        for _ in 0..num_chunks {
            let mut chunk = Vec::with_capacity(t as usize);
            chunk.resize_with(t as usize, CtrlRecord::new);
            ctrl_chunks.push(chunk);
        }

        SharedRegion {
            n,
            t,
            barrier: InitBarrier::new(n),
            msgqs,
            ctrl_chunks,
        }
    }

    pub fn n(&self) -> u16 {
        self.n
    }

    pub fn t(&self) -> u32 {
        self.t
    }

    pub fn init_barrier(&self) -> &InitBarrier {
        &self.barrier
    }

    pub fn msgq(&self, comp: CompartmentId) -> &MsgQueue {
        &self.msgqs[comp.get() as usize]
    }

    /// The CTRL record for RPC index `index` shared between `comp_a`
    /// and `comp_b` (direction is irrelevant for addressing — both
    /// directions of a pair share the same chunk, distinguished only
    /// by `key_from`/`key_to`).
    pub fn ctrl(&self, index: RpcIndex, comp_a: CompartmentId, comp_b: CompartmentId) -> &CtrlRecord {
        let chunk = chunk_index(self.n, comp_a, comp_b);
        let (_, small) = index.split(self.t);
        &self.ctrl_chunks[chunk][small as usize]
    }

    /// Zeroes every MSGQ and CTRL in the region. Only compartment 0
    /// (the app compartment) calls this, exactly once, before any other
    /// compartment touches shared state.
    pub fn init(&self) {
        for q in &self.msgqs {
            q.init();
        }
        for chunk in &self.ctrl_chunks {
            for ctrl in chunk {
                ctrl.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctrl_addressing_is_consistent_across_direction() {
        let region = SharedRegion::new(3, 4);
        let a = CompartmentId::new(0);
        let b = CompartmentId::new(2);
        let idx = RpcIndex::new(a, 1, 4);
        let ctrl_ab = region.ctrl(idx, a, b) as *const _;
        let ctrl_ba = region.ctrl(idx, b, a) as *const _;
        assert_eq!(ctrl_ab, ctrl_ba);
    }

    #[test]
    fn init_resets_all_msgqs_and_ctrls() {
        let region = SharedRegion::new(2, 2);
        let a = CompartmentId::new(0);
        let b = CompartmentId::new(1);
        region.msgq(a).try_put(7).unwrap();
        let idx = RpcIndex::new(a, 0, 2);
        region.ctrl(idx, a, b).write_call(1, &[], false, 0, 1);

        region.init();
        assert!(region.msgq(a).is_empty());
        assert!(region.ctrl(idx, a, b).check_closed().is_ok());
    }
}
