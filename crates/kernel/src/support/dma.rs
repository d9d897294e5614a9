//! Block-device DMA services: flash block I/O in one phase, disk I/O in
//! two (seek, then transfer), both staged through sixteen fixed 4 KB
//! buffers in low RAM, partitioned eight for disks and eight for flashes.
//!
//! The user-page copies in and out of the staging buffers run with no
//! device mutex held: a copy can fault into the pager, and the pager
//! acquires flash mutexes of its own.

use mikron_machine::layout::*;
use mikron_machine::{Killed, Run};

use crate::bios::{self, Kcpu};
use crate::support::{self, syscalls, GENERAL_EXCEPT};

/// Physical address of the DMA staging buffer for a device.
pub fn dma_buf_addr(line: u32, dev: u32) -> u32 {
    let slot = if line == DISK_LINE { dev } else { DEV_PER_LINE + dev };
    DMA_BUF_BASE + slot * PAGE_SIZE
}

/// Whether a full page at `vaddr` lies inside the user segment.
pub fn user_page_ok(vaddr: u32) -> bool {
    vaddr >= KUSEG && vaddr <= STACK_TOP - PAGE_SIZE
}

/// Split a linear sector number against a `(maxcyl, maxhead, maxsect)`
/// geometry word.
pub fn decompose_sector(geometry: u32, sector: u32) -> Option<(u32, u32, u32)> {
    let cylinders = geometry >> 16;
    let heads = (geometry >> 8) & 0xFF;
    let sectors = geometry & 0xFF;
    if sector >= cylinders * heads * sectors {
        return None;
    }
    let cyl = sector / (heads * sectors);
    let rem = sector % (heads * sectors);
    Some((cyl, rem / sectors, rem % sectors))
}

/// SYS14/SYS15: write or read one 4 KB sector of a disk. Phase one seeks
/// the cylinder, phase two transfers through the staging buffer.
pub fn disk_io(cpu: &mut Kcpu, asid: u32, vaddr: u32, disk_no: u32, sector: u32, write: bool) -> Run {
    if !user_page_ok(vaddr) || disk_no >= DEV_PER_LINE {
        return syscalls::terminate_uproc(cpu, None);
    }
    let geometry = cpu.sim().hw.dev_read(DISK_LINE, disk_no as usize, DevField::Data1);
    let Some((cyl, head, sec)) = decompose_sector(geometry, sector) else {
        return syscalls::terminate_uproc(cpu, None);
    };
    let buf = dma_buf_addr(DISK_LINE, disk_no);
    // Stage outside the mutex: the copy may fault into the pager.
    if write {
        copy_user_to_buf(cpu, vaddr, buf)?;
    }
    let mutex = bios::dev_mutex_addr(bios::dev_index(DISK_LINE, disk_no, false));
    support::p(cpu, mutex)?;

    let status = syscalls::issue_and_wait(
        cpu,
        DISK_LINE,
        disk_no,
        DevField::Command,
        (cyl << 8) | CMD_DISK_SEEK,
        false,
    )?;
    if status != STATUS_READY {
        support::v(cpu, mutex)?;
        return resume(cpu, asid, syscalls::neg_status(status));
    }

    cpu.sim()
        .hw
        .dev_write(DISK_LINE, disk_no as usize, DevField::Data0, buf);
    let op = if write { CMD_DISK_WRITE } else { CMD_DISK_READ };
    let status = syscalls::issue_and_wait(
        cpu,
        DISK_LINE,
        disk_no,
        DevField::Command,
        (head << 16) | (sec << 8) | op,
        false,
    )?;
    if status != STATUS_READY {
        support::v(cpu, mutex)?;
        return resume(cpu, asid, syscalls::neg_status(status));
    }
    support::v(cpu, mutex)?;
    if !write {
        copy_buf_to_user(cpu, buf, vaddr)?;
    }
    resume(cpu, asid, STATUS_READY)
}

/// SYS16/SYS17: write or read one flash block. Blocks below
/// [`FLASH_USER_BASE`] back the demand-paged pages and are off limits.
pub fn flash_io(cpu: &mut Kcpu, asid: u32, vaddr: u32, flash_no: u32, block: u32, write: bool) -> Run {
    if !user_page_ok(vaddr) || flash_no >= DEV_PER_LINE {
        return syscalls::terminate_uproc(cpu, None);
    }
    let max_block = cpu.sim().hw.dev_read(FLASH_LINE, flash_no as usize, DevField::Data1);
    if block < FLASH_USER_BASE || block >= max_block {
        return syscalls::terminate_uproc(cpu, None);
    }
    let buf = dma_buf_addr(FLASH_LINE, flash_no);
    // Stage outside the mutex: the copy may fault into the pager, and
    // the pager needs this very device for the eviction and the load.
    if write {
        copy_user_to_buf(cpu, vaddr, buf)?;
    }
    let mutex = bios::dev_mutex_addr(bios::dev_index(FLASH_LINE, flash_no, false));
    support::p(cpu, mutex)?;

    cpu.sim()
        .hw
        .dev_write(FLASH_LINE, flash_no as usize, DevField::Data0, buf);
    let op = if write { CMD_FLASH_WRITE } else { CMD_FLASH_READ };
    let status = syscalls::issue_and_wait(
        cpu,
        FLASH_LINE,
        flash_no,
        DevField::Command,
        (block << FLASH_BLOCK_SHIFT) | op,
        !write,
    )?;
    if status != STATUS_READY {
        support::v(cpu, mutex)?;
        return resume(cpu, asid, syscalls::neg_status(status));
    }
    support::v(cpu, mutex)?;
    if !write {
        copy_buf_to_user(cpu, buf, vaddr)?;
    }
    resume(cpu, asid, STATUS_READY)
}

/// Copy one page from a user virtual address into a staging buffer; the
/// loads translate, so a missing page simply faults into the pager.
/// Called with no device mutex held.
fn copy_user_to_buf(cpu: &mut Kcpu, vaddr: u32, buf: u32) -> Result<(), Killed> {
    for i in 0..PAGE_SIZE {
        let byte = cpu.load_u8(vaddr + i)?;
        let pa = buf + i;
        cpu.sim().hw.ram.write_u8(pa, byte);
    }
    Ok(())
}

/// Copy one page from a staging buffer out to a user virtual address.
/// Called with no device mutex held.
fn copy_buf_to_user(cpu: &mut Kcpu, buf: u32, vaddr: u32) -> Result<(), Killed> {
    for i in 0..PAGE_SIZE {
        let byte = cpu.sim().hw.ram.read_u8(buf + i);
        cpu.store_u8(vaddr + i, byte)?;
    }
    Ok(())
}

fn resume(cpu: &mut Kcpu, asid: u32, result: u32) -> Run {
    let state = {
        let sup = &mut cpu.sim().kernel.support.supports[asid as usize];
        sup.except_state[GENERAL_EXCEPT].set_v0(result);
        sup.except_state[GENERAL_EXCEPT].clone()
    };
    cpu.ldst(&state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_buffers_are_partitioned() {
        assert_eq!(dma_buf_addr(DISK_LINE, 0), DMA_BUF_BASE);
        assert_eq!(dma_buf_addr(DISK_LINE, 7), DMA_BUF_BASE + 7 * PAGE_SIZE);
        assert_eq!(dma_buf_addr(FLASH_LINE, 0), DMA_BUF_BASE + 8 * PAGE_SIZE);
        assert_eq!(dma_buf_addr(FLASH_LINE, 7), DMA_BUF_BASE + 15 * PAGE_SIZE);
    }

    #[test]
    fn user_window_bounds() {
        assert!(user_page_ok(KUSEG));
        assert!(user_page_ok(STACK_TOP - PAGE_SIZE));
        assert!(!user_page_ok(STACK_TOP));
        assert!(!user_page_ok(KUSEG - PAGE_SIZE));
        assert!(!user_page_ok(0));
    }

    #[test]
    fn sector_decomposition_matches_geometry() {
        // 32 cylinders, 2 heads, 8 sectors.
        let geometry = (32 << 16) | (2 << 8) | 8;
        assert_eq!(decompose_sector(geometry, 0), Some((0, 0, 0)));
        assert_eq!(decompose_sector(geometry, 60), Some((3, 1, 4)));
        assert_eq!(decompose_sector(geometry, 511), Some((31, 1, 7)));
        assert_eq!(decompose_sector(geometry, 512), None);
    }
}
