//! Demand paging: the TLB-refill handler, the pager, and the swap pool.
//!
//! User pages live in a shared pool of RAM frames backed by each
//! process's flash device (block = page index). The pager replaces
//! frames round-robin, always writes the evicted page back, and keeps
//! the TLB consistent with the page tables by mutating both under
//! disabled interrupts.

use log::trace;
use mikron_machine::layout::*;
use mikron_machine::state::{exc_code, EXC_TLB_MOD, VPN_MASK, VPN_SHIFT};
use mikron_machine::tlb::{ENTRYLO_DIRTY, ENTRYLO_VALID};
use mikron_machine::{Killed, Run};

use crate::bios::{self, Kcpu};
use crate::nucleus::exceptions;
use crate::support::{self, syscalls, PAGE_TABLE_SIZE, PGFAULT_EXCEPT};
use crate::sysno;

/// One physical frame of the swap pool: who owns it and which page table
/// entry points back at it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwapEntry {
    /// Owning ASID; `None` marks the frame free.
    pub asid: Option<u32>,
    /// Virtual page number of the occupant.
    pub vpn: u32,
    /// Index of the occupant's page-table entry (its back-pointer).
    pub pte_index: usize,
}

/// Page index of a translation key within the 32-entry private table.
pub fn page_index(entry_hi: u32) -> usize {
    (((entry_hi & VPN_MASK) >> VPN_SHIFT) as usize) % PAGE_TABLE_SIZE
}

/// Physical address of swap-pool frame `index`.
pub fn frame_addr(index: usize) -> u32 {
    SWAP_POOL_ADDR + (index as u32) * PAGE_SIZE
}

/// Reset the swap-pool table and its mutual-exclusion semaphore; invoked
/// once by the instantiator.
pub fn init_swap_structs(cpu: &mut Kcpu) {
    {
        let support = &mut cpu.sim().kernel.support;
        for entry in &mut support.swap_pool {
            *entry = SwapEntry::default();
        }
        support.swap_cursor = 0;
    }
    bios::sem_write(cpu, SWAP_SEM_ADDR, 1);
}

/// TLB-refill handler: copy the missing page-table entry into the TLB
/// with a random write and retry. Runs with no locks and no syscalls.
pub fn tlb_refill(cpu: &mut Kcpu) -> Run {
    let saved = bios::saved_exception_state(cpu);
    let page = page_index(saved.entry_hi);
    let support = {
        let sim = cpu.sim();
        let current = sim
            .kernel
            .nucleus
            .current
            .expect("TLB refill with no current process");
        sim.kernel.nucleus.pcbs.get(current).support
    };
    let Some(asid) = support else {
        // Only processes with a support structure own translated pages.
        return exceptions::tlb_trap(cpu);
    };
    let sim = cpu.sim();
    let pte = sim.kernel.support.supports[asid as usize].page_table[page];
    sim.hw.tlb.write_random(pte.hi, pte.lo);
    cpu.ldst(&saved)
}

/// The pager: entered through the support structure's page-fault context
/// on a TLB-invalid exception.
pub fn pager_entry(cpu: &mut Kcpu) -> Run {
    let sup_addr = cpu.syscall(sysno::GET_SUPPORT, 0, 0, 0)?;
    let asid = bios::support_asid(sup_addr).expect("pager entered without a support structure");
    let saved = cpu.sim().kernel.support.supports[asid as usize].except_state[PGFAULT_EXCEPT].clone();

    // A modification fault in user mode is a program trap, not a miss.
    if exc_code(saved.cause) == EXC_TLB_MOD {
        return syscalls::terminate_uproc(cpu, None);
    }

    support::p(cpu, SWAP_SEM_ADDR)?;

    let page = page_index(saved.entry_hi);
    let frame = {
        let support = &mut cpu.sim().kernel.support;
        let frame = support.swap_cursor;
        support.swap_cursor = (support.swap_cursor + 1) % support.swap_pool.len();
        frame
    };
    let frame_pa = frame_addr(frame);
    trace!("pager: asid {asid} page {page} -> frame {frame}");

    // Evict the occupant: invalidate its mapping atomically, then write
    // the frame back to its flash block.
    let occupant = cpu.sim().kernel.support.swap_pool[frame];
    if let Some(occ_asid) = occupant.asid {
        let lo = cpu.sim().kernel.support.supports[occ_asid as usize].page_table[occupant.pte_index].lo;
        set_pte_and_tlb(cpu, occ_asid, occupant.pte_index, lo & !ENTRYLO_VALID);
        let status = flash_io(cpu, occ_asid, occupant.pte_index as u32, frame_pa, true)?;
        if status != STATUS_READY {
            return syscalls::terminate_uproc(cpu, Some(SWAP_SEM_ADDR));
        }
    }

    // Bring the missing page in from the current process's flash.
    let status = flash_io(cpu, asid, page as u32, frame_pa, false)?;
    if status != STATUS_READY {
        return syscalls::terminate_uproc(cpu, Some(SWAP_SEM_ADDR));
    }

    {
        let support = &mut cpu.sim().kernel.support;
        support.swap_pool[frame] = SwapEntry {
            asid: Some(asid),
            vpn: saved.entry_hi & VPN_MASK,
            pte_index: page,
        };
    }
    set_pte_and_tlb(cpu, asid, page, frame_pa | ENTRYLO_VALID | ENTRYLO_DIRTY);

    support::v(cpu, SWAP_SEM_ADDR)?;
    cpu.ldst(&saved)
}

/// Write a page-table entry and, if it is cached, the matching TLB entry
/// in one uninterruptible step.
pub fn set_pte_and_tlb(cpu: &mut Kcpu, asid: u32, index: usize, new_lo: u32) {
    bios::disable_interrupts(cpu);
    let sim = cpu.sim();
    let pte = &mut sim.kernel.support.supports[asid as usize].page_table[index];
    pte.lo = new_lo;
    let hi = pte.hi;
    if let Some(slot) = sim.hw.tlb.probe(hi) {
        sim.hw.tlb.write_index(slot, hi, new_lo);
    }
    bios::enable_interrupts(cpu);
}

/// One paging transfer between a swap frame and the owner's flash device
/// (device number = ASID - 1): stage the frame address, then issue the
/// command and the I/O wait as one uninterruptible pair.
///
/// Called with the swap-pool mutex held; flash mutexes nest strictly
/// inside it and are never held across a pageable access.
fn flash_io(cpu: &mut Kcpu, asid: u32, block: u32, frame_pa: u32, write: bool) -> Result<u32, Killed> {
    let dev = asid - 1;
    let mutex = bios::dev_mutex_addr(bios::dev_index(FLASH_LINE, dev, false));
    support::p(cpu, mutex)?;
    cpu.sim()
        .hw
        .dev_write(FLASH_LINE, dev as usize, DevField::Data0, frame_pa);
    bios::disable_interrupts(cpu);
    let op = if write { CMD_FLASH_WRITE } else { CMD_FLASH_READ };
    cpu.sim().hw.dev_write(
        FLASH_LINE,
        dev as usize,
        DevField::Command,
        (block << FLASH_BLOCK_SHIFT) | op,
    );
    let status = cpu.syscall(sysno::WAIT_IO, FLASH_LINE, dev, 0)?;
    bios::enable_interrupts(cpu);
    support::v(cpu, mutex)?;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::SupportLevel;

    #[test]
    fn page_index_wraps_modulo_table_size() {
        assert_eq!(page_index(0x8000_0000), 0);
        assert_eq!(page_index(0x8000_5000), 5);
        // The stack page key lands on entry 31.
        assert_eq!(page_index(STACK_PAGE_VPN), 31);
    }

    #[test]
    fn frame_addresses_step_by_page() {
        assert_eq!(frame_addr(0), SWAP_POOL_ADDR);
        assert_eq!(frame_addr(3), SWAP_POOL_ADDR + 3 * PAGE_SIZE);
    }

    #[test]
    fn swap_cursor_rotates_over_the_pool() {
        let mut level = SupportLevel::new();
        let len = level.swap_pool.len();
        let mut seen = Vec::new();
        for _ in 0..len * 2 {
            seen.push(level.swap_cursor);
            level.swap_cursor = (level.swap_cursor + 1) % len;
        }
        assert_eq!(&seen[..len], &seen[len..]);
        assert_eq!(seen[0], 0);
        assert_eq!(seen[len - 1], len - 1);
    }
}
