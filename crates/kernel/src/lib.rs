//! The mikron kernel: nucleus, support level and delay facility for a
//! simulated MIPS-like machine with a software-managed TLB.
//!
//! Three layers share this crate. The nucleus owns process control
//! blocks, the ready queue, the Active Semaphore List, preemptive
//! round-robin scheduling, interrupt dispatch and the eight privileged
//! syscalls. The support level runs in kernel mode on behalf of one user
//! address space: demand paging against per-process flash devices and
//! the user-facing services (terminate, time-of-day, character and block
//! device I/O, delay). The delay facility is a daemon with a sorted
//! wake-time list.
//!
//! Everything is driven by exceptions: the machine vectors here through
//! the pass-up vector, and control returns by loading a saved state.

pub mod bios;
pub mod error;
pub mod instantiator;
pub mod nucleus;
pub mod support;

use mikron_machine::{MachineConfig, Outcome, Sim};

pub use crate::bios::{Kcpu, Ksim};
pub use crate::error::KernelError;
pub use crate::instantiator::UserProgram;
pub use crate::nucleus::Nucleus;
pub use crate::support::SupportLevel;

/// Syscall numbers. 1..8 are privileged and served by the nucleus;
/// 9..18 belong to the support level.
pub mod sysno {
    pub const CREATE: u32 = 1;
    pub const TERMINATE_PROCESS: u32 = 2;
    pub const PASSEREN: u32 = 3;
    pub const VERHOGEN: u32 = 4;
    pub const WAIT_IO: u32 = 5;
    pub const GET_CPU_TIME: u32 = 6;
    pub const WAIT_CLOCK: u32 = 7;
    pub const GET_SUPPORT: u32 = 8;
    pub const TERMINATE: u32 = 9;
    pub const GET_TOD: u32 = 10;
    pub const WRITE_PRINTER: u32 = 11;
    pub const WRITE_TERMINAL: u32 = 12;
    pub const READ_TERMINAL: u32 = 13;
    pub const DISK_PUT: u32 = 14;
    pub const DISK_GET: u32 = 15;
    pub const FLASH_PUT: u32 = 16;
    pub const FLASH_GET: u32 = 17;
    pub const DELAY: u32 = 18;
}

/// The whole kernel state, threaded through every handler as the
/// machine's payload.
#[derive(Debug, Default)]
pub struct Kernel {
    pub nucleus: Nucleus,
    pub support: SupportLevel,
}

impl Kernel {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Boot configuration: the machine to simulate and one program per user
/// ASID (1..).
pub struct BootConfig {
    pub machine: MachineConfig,
    pub programs: Vec<UserProgram>,
}

/// Power on the machine, boot the kernel, run every user program to
/// conclusion and return the outcome plus the final state.
pub fn run(config: BootConfig) -> Result<(Outcome, Sim<Kernel>), KernelError> {
    if config.programs.len() > support::UPROC_MAX {
        return Err(KernelError::TooManyUserProcs {
            max: support::UPROC_MAX,
        });
    }
    let programs = config.programs;
    Ok(mikron_machine::boot(
        config.machine,
        Kernel::new(),
        Box::new(move |cpu| instantiator::kernel_main(cpu, programs)),
    ))
}
