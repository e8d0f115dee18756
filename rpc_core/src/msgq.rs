//! Bounded single-consumer message queue used as the doorbell channel
//! between compartments.

use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};

use rpc_abi::MSGQ_CAPACITY;

use crate::error::RpcError;

const SLOTS: usize = MSGQ_CAPACITY + 1;

/// A bounded ring of doorbell notifications. One producer lock
/// (`write_lock`, test-and-set); the consumer side is lock-free and
/// requires single-consumer discipline, enforced by the RPC
/// server/worker cooperation (see `server` module), not by this type.
pub struct MsgQueue {
    head: AtomicU32,
    tail: AtomicU32,
    write_lock: AtomicBool,
    messages: [AtomicU16; SLOTS],
}

impl MsgQueue {
    pub const fn new() -> Self {
        MsgQueue {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            write_lock: AtomicBool::new(false),
            messages: [
                AtomicU16::new(0),
                AtomicU16::new(0),
                AtomicU16::new(0),
                AtomicU16::new(0),
                AtomicU16::new(0),
                AtomicU16::new(0),
                AtomicU16::new(0),
                AtomicU16::new(0),
            ],
        }
    }

    pub fn init(&self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        self.write_lock.store(false, Ordering::Release);
    }

    fn lock(&self) {
        while self
            .write_lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.write_lock.store(false, Ordering::Release);
    }

    /// Number of pending messages, `(head - tail) mod (C+1)`.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire) as usize;
        let tail = self.tail.load(Ordering::Acquire) as usize;
        (head + SLOTS - tail) % SLOTS
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Attempts to enqueue without blocking. Acquires the producer
    /// lock; on a full queue releases it and returns
    /// `Err(RpcError::MsgQueueFull)`.
    pub fn try_put(&self, msg: u16) -> Result<(), RpcError> {
        self.lock();
        let head = self.head.load(Ordering::Relaxed) as usize;
        let tail = self.tail.load(Ordering::Acquire) as usize;
        if (head + 1) % SLOTS == tail {
            self.unlock();
            return Err(RpcError::MsgQueueFull);
        }
        self.messages[head].store(msg, Ordering::Relaxed);
        self.head.store(((head + 1) % SLOTS) as u32, Ordering::Release);
        self.unlock();
        Ok(())
    }

    /// Enqueues `msg`, calling `on_full` (expected to yield to the
    /// cooperative scheduler) and retrying until there is room. Loops
    /// rather than failing.
    pub fn put(&self, msg: u16, mut on_full: impl FnMut()) {
        loop {
            match self.try_put(msg) {
                Ok(()) => return,
                Err(RpcError::MsgQueueFull) => on_full(),
                Err(e) => unreachable!("try_put returned unexpected error {e:?}"),
            }
        }
    }

    /// Lock-free single-consumer dequeue. Returns `None` if empty.
    pub fn try_get(&self) -> Option<u16> {
        let head = self.head.load(Ordering::Acquire) as usize;
        let tail = self.tail.load(Ordering::Relaxed) as usize;
        if head == tail {
            return None;
        }
        let msg = self.messages[tail].load(Ordering::Relaxed);
        self.tail.store(((tail + 1) % SLOTS) as u32, Ordering::Release);
        Some(msg)
    }

    /// Spins with a CPU-relaxation hint until a message is available,
    /// then dequeues it. Only safe to call when at least one other
    /// runnable thread exists to eventually produce a message — the
    /// caller must guarantee that or it spins forever.
    pub fn get_blocking(&self) -> u16 {
        loop {
            if let Some(msg) = self.try_get() {
                return msg;
            }
            core::hint::spin_loop();
        }
    }
}

impl Default for MsgQueue {
    fn default() -> Self {
        Self::new()
    }
}
