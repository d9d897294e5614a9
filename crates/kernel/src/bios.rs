//! Bridge glue over the BIOS and bus: time-of-day, timer loads, the saved
//! exception page, kernel semaphore words and the synthetic text addresses
//! the pass-up vector and `LDCXT` resolve handlers through.
//!
//! Kept thin on purpose; the interesting machinery lives in the nucleus
//! and the support level.

use mikron_machine::layout::*;
use mikron_machine::state::Status;
use mikron_machine::{Cpu, ProcessorState, Sim};

use crate::Kernel;

/// The processor session type every kernel routine runs against.
pub type Kcpu<'a> = Cpu<'a, Kernel>;
/// The shared machine + kernel state.
pub type Ksim = Sim<Kernel>;

// Synthetic text addresses for the kernel's entry points. The simulated
// machine maps program counters to handler functions through a registry;
// these are the addresses the kernel registers at boot.
pub const EXC_VECTOR_PC: u32 = 0x0001_0000;
pub const REFILL_VECTOR_PC: u32 = 0x0001_0040;
pub const PAGER_PC: u32 = 0x0001_0080;
pub const SUPPORT_GENERAL_PC: u32 = 0x0001_00C0;
pub const INSTANTIATOR_PC: u32 = 0x0001_0100;
pub const DELAY_DAEMON_PC: u32 = 0x0001_0140;

/// Boot staging area for the processor states handed to SYS1.
pub const STATE_STAGING_BASE: u32 = 0x2000_1800;

/// Read the time-of-day clock, microseconds since power-on.
pub fn stck(cpu: &mut Kcpu) -> u64 {
    cpu.sim().hw.tod()
}

/// Load the system-wide interval timer.
pub fn ldit(cpu: &mut Kcpu, us: u64) {
    cpu.sim().hw.load_interval_timer(us);
}

/// Load the processor local timer.
pub fn set_timer(cpu: &mut Kcpu, us: u32) {
    cpu.sim().hw.set_timer(us);
}

/// Remaining microseconds on the processor local timer.
pub fn get_timer(cpu: &mut Kcpu) -> u32 {
    cpu.sim().hw.get_timer()
}

/// Saved exception state from the BIOS data page.
pub fn saved_exception_state(cpu: &mut Kcpu) -> ProcessorState {
    cpu.sim().hw.bios_state.clone()
}

/// Clear the global interrupt-enable bit of the running status.
pub fn disable_interrupts(cpu: &mut Kcpu) {
    cpu.sim().hw.cpu.status.remove(Status::IEC);
}

/// Set the global interrupt-enable bit of the running status.
pub fn enable_interrupts(cpu: &mut Kcpu) {
    cpu.sim().hw.cpu.status.insert(Status::IEC);
}

// Semaphores are words in the kernel data region of RAM, so the Active
// Semaphore List can key on their physical addresses.

/// Read a semaphore word.
pub fn sem_read(cpu: &mut Kcpu, addr: u32) -> i32 {
    cpu.sim().hw.ram.read_u32(addr) as i32
}

/// Write a semaphore word.
pub fn sem_write(cpu: &mut Kcpu, addr: u32, value: i32) {
    cpu.sim().hw.ram.write_u32(addr, value as u32);
}

/// Address of the sub-device semaphore at `index` (pseudo-clock last).
pub fn dev_sem_addr(index: u32) -> u32 {
    debug_assert!(index < DEV_SEM_COUNT);
    DEV_SEM_BASE + index * WORD_LEN
}

/// Address of the pseudo-clock semaphore.
pub fn pseudo_clock_sem_addr() -> u32 {
    dev_sem_addr(PSEUDO_CLOCK_IDX)
}

/// Whether `addr` falls inside the device semaphore array. Processes
/// blocked there are soft-blocked: the device interrupt, not a V, will
/// eventually increment the semaphore.
pub fn is_device_sem(addr: u32) -> bool {
    (DEV_SEM_BASE..DEV_SEM_BASE + DEV_SEM_COUNT * WORD_LEN).contains(&addr)
}

/// Address of the support-level mutex for a sub-device (terminal
/// transmitters sit one bank of eight above the receivers).
pub fn dev_mutex_addr(index: u32) -> u32 {
    debug_assert!(index < DEV_SEM_COUNT - 1);
    DEV_MUTEX_BASE + index * WORD_LEN
}

/// Address of the private delay semaphore for a user ASID.
pub fn delay_sem_addr(asid: u32) -> u32 {
    DELAY_SEM_BASE + asid * WORD_LEN
}

/// Sub-device semaphore index for (line, device); terminal transmitters
/// occupy a second bank offset by the devices-per-line count.
pub fn dev_index(line: u32, dev: u32, transmit: bool) -> u32 {
    let mut index = (line - DISK_LINE) * DEV_PER_LINE + dev;
    if line == TERM_LINE && transmit {
        index += DEV_PER_LINE;
    }
    index
}

/// The "address" of a support structure, as returned by SYS8. Zero means
/// no support structure.
pub fn support_addr(asid: u32) -> u32 {
    SUPPORT_BASE + asid * SUPPORT_SIZE
}

/// Resolve a support structure address back to its ASID.
pub fn support_asid(addr: u32) -> Option<u32> {
    if addr < SUPPORT_BASE {
        return None;
    }
    let asid = (addr - SUPPORT_BASE) / SUPPORT_SIZE;
    (asid > 0).then_some(asid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_semaphore_indexing() {
        assert_eq!(dev_index(DISK_LINE, 0, false), 0);
        assert_eq!(dev_index(FLASH_LINE, 3, false), 11);
        assert_eq!(dev_index(TERM_LINE, 0, false), 32);
        assert_eq!(dev_index(TERM_LINE, 0, true), 40);
        assert_eq!(dev_index(TERM_LINE, 7, true), 47);
    }

    #[test]
    fn device_semaphore_range() {
        assert!(is_device_sem(dev_sem_addr(0)));
        assert!(is_device_sem(pseudo_clock_sem_addr()));
        assert!(!is_device_sem(DEV_SEM_BASE + DEV_SEM_COUNT * WORD_LEN));
        assert!(!is_device_sem(MASTER_SEM_ADDR));
    }

    #[test]
    fn support_addresses_round_trip() {
        for asid in 1..=8 {
            assert_eq!(support_asid(support_addr(asid)), Some(asid));
        }
        assert_eq!(support_asid(0), None);
    }
}
