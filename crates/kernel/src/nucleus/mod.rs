//! The nucleus: process representation, ready queue, semaphore blocking,
//! round-robin scheduling, interrupt dispatch and the privileged syscalls.

pub mod asl;
pub mod exceptions;
pub mod interrupts;
pub mod pcb;
pub mod scheduler;

use self::asl::Asl;
use self::pcb::{PcbPool, Pid, ProcQueue};

/// Nucleus-wide state, initialized once at boot and threaded explicitly
/// into every handler.
#[derive(Debug)]
pub struct Nucleus {
    pub pcbs: PcbPool,
    pub asl: Asl,
    /// FIFO of ready processes; the scheduler dispatches its head.
    pub ready: ProcQueue,
    /// The process owning the processor, if any.
    pub current: Option<Pid>,
    /// Created but not yet terminated processes.
    pub process_count: u32,
    /// Processes waiting on an I/O or timer event.
    pub soft_block_count: u32,
    /// Time-of-day stamp taken when the current process was dispatched.
    pub start_tod: u64,
    /// Device completions acknowledged with nobody waiting (see the
    /// interrupt handler).
    pub spurious_interrupts: u64,
}

impl Default for Nucleus {
    fn default() -> Self {
        Self::new()
    }
}

impl Nucleus {
    pub fn new() -> Self {
        Self {
            pcbs: PcbPool::new(),
            asl: Asl::new(),
            ready: ProcQueue::new(),
            current: None,
            process_count: 0,
            soft_block_count: 0,
            start_tod: 0,
            spurious_interrupts: 0,
        }
    }
}
