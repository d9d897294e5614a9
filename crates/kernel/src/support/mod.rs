//! The support level: per-user-process demand paging and the user-facing
//! syscalls, running in kernel mode on behalf of one address space.

pub mod delay;
pub mod dma;
pub mod pager;
pub mod syscalls;

use mikron_machine::{Killed, ProcessorState, TlbEntry};

use crate::bios::Kcpu;
use crate::sysno;
use self::delay::Adl;
use self::pager::SwapEntry;

/// P on a semaphore word through SYS3.
pub fn p(cpu: &mut Kcpu, sem_addr: u32) -> Result<(), Killed> {
    cpu.syscall(sysno::PASSEREN, sem_addr, 0, 0)?;
    Ok(())
}

/// V on a semaphore word through SYS4.
pub fn v(cpu: &mut Kcpu, sem_addr: u32) -> Result<(), Killed> {
    cpu.syscall(sysno::VERHOGEN, sem_addr, 0, 0)?;
    Ok(())
}

/// Maximum concurrent user processes (ASIDs 1..=UPROC_MAX).
pub const UPROC_MAX: usize = 8;

/// Entries in a private page table: 31 mappable pages plus the stack page.
pub const PAGE_TABLE_SIZE: usize = 32;

/// Index of the page-fault slot in the support structure.
pub const PGFAULT_EXCEPT: usize = 0;
/// Index of the general-exception slot in the support structure.
pub const GENERAL_EXCEPT: usize = 1;

/// A pre-built exception context: where `LDCXT` lands when the nucleus
/// passes an exception up.
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub stack_ptr: u32,
    pub status: u32,
    pub pc: u32,
}

/// Per-user-process support structure.
#[derive(Debug, Clone, Default)]
pub struct SupportStruct {
    pub asid: u32,
    /// Saved exception states: page-fault slot and general slot.
    pub except_state: [ProcessorState; 2],
    /// Contexts entering the pager and the support dispatcher.
    pub except_context: [Context; 2],
    /// Private page table; entry 31 is keyed to the stack page.
    pub page_table: [TlbEntry; PAGE_TABLE_SIZE],
    /// RAM word of the private semaphore used for sleep/wake.
    pub delay_sem_addr: u32,
    /// Tops of the two reserved exception stacks.
    pub stack_tlb_top: u32,
    pub stack_gen_top: u32,
}

/// Support-level shared state: one structure per user ASID, the swap
/// pool, and the Active Delay List.
#[derive(Debug)]
pub struct SupportLevel {
    /// Indexed by ASID; slot 0 is unused.
    pub supports: Vec<SupportStruct>,
    pub swap_pool: Vec<SwapEntry>,
    /// Round-robin frame replacement cursor.
    pub swap_cursor: usize,
    pub adl: Adl,
    /// Number of user processes the instantiator launched.
    pub uproc_count: u32,
}

impl Default for SupportLevel {
    fn default() -> Self {
        Self::new()
    }
}

impl SupportLevel {
    pub fn new() -> Self {
        Self {
            supports: vec![SupportStruct::default(); UPROC_MAX + 1],
            swap_pool: vec![SwapEntry::default(); 2 * UPROC_MAX],
            swap_cursor: 0,
            adl: Adl::new(),
            uproc_count: 0,
        }
    }
}
