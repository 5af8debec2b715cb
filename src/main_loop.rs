//! Signals and task queue that drive the single main-loop thread.
//!
//! The audio-ready signals are plain bits in an atomic word so device
//! threads can raise them without taking a lock. Scheduled tasks go through a
//! mutex-protected FIFO and raise [`SCHEDULE_EVENT`].

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use crate::util::lock;

pub const SCHEDULE_EVENT: u32 = 1 << 0;
pub const AUDIO_INPUT_READY_EVENT: u32 = 1 << 1;
pub const AUDIO_OUTPUT_READY_EVENT: u32 = 1 << 2;
pub const SHUTDOWN_EVENT: u32 = 1 << 3;

pub const ALL_EVENTS: u32 =
    SCHEDULE_EVENT | AUDIO_INPUT_READY_EVENT | AUDIO_OUTPUT_READY_EVENT | SHUTDOWN_EVENT;

/// Event bits with exactly one waiting consumer.
///
/// `set_bits` is lock-free and may be called from any thread. The first
/// thread to call `wait_bits` becomes the consumer.
#[derive(Default)]
pub struct EventGroup {
    bits: AtomicU32,
    waiter: OnceLock<Thread>,
}

impl EventGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bits(&self, bits: u32) {
        self.bits.fetch_or(bits, Ordering::AcqRel);
        if let Some(waiter) = self.waiter.get() {
            waiter.unpark();
        }
    }

    /// Wait until any bit in `mask` is set, clear those bits and return them.
    /// Returns 0 if `timeout` elapses first.
    pub fn wait_bits(&self, mask: u32, timeout: Option<Duration>) -> u32 {
        let waiter = self.waiter.get_or_init(thread::current);
        debug_assert_eq!(waiter.id(), thread::current().id());

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let bits = self.bits.fetch_and(!mask, Ordering::AcqRel) & mask;
            if bits != 0 {
                return bits;
            }
            match deadline {
                None => thread::park(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return 0;
                    }
                    thread::park_timeout(deadline - now);
                }
            }
        }
    }
}

pub type Task<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

/// FIFO of deferred closures run on the main loop against its context `C`.
pub struct TaskQueue<C> {
    tasks: Mutex<VecDeque<Task<C>>>,
}

impl<C> Default for TaskQueue<C> {
    fn default() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
        }
    }
}

impl<C> TaskQueue<C> {
    pub fn push(&self, task: Task<C>) {
        lock(&self.tasks).push_back(task);
    }

    /// Take everything queued so far. Tasks pushed while the snapshot runs
    /// stay queued for the next cycle.
    pub fn take_all(&self) -> VecDeque<Task<C>> {
        std::mem::take(&mut *lock(&self.tasks))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }
}
