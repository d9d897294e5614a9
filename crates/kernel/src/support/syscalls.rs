//! Support-level syscall dispatcher (SYS9..SYS18) and the character
//! device services.
//!
//! Entered through the support structure's general-exception context.
//! Every service runs on the support's dedicated kernel-mode stack and
//! ends by loading the saved user state; failed device operations
//! surface as the negative of the device status.
//!
//! The character loops fault user pages while holding their printer or
//! terminal mutex; the pager takes only the swap-pool and flash mutexes,
//! never these.

use log::trace;
use mikron_machine::layout::*;
use mikron_machine::state::exc_code;
use mikron_machine::state::EXC_SYSCALL;
use mikron_machine::{Killed, Run};

use crate::bios::{self, Kcpu};
use crate::support::{self, delay, dma, GENERAL_EXCEPT};
use crate::sysno;

/// Longest string accepted by the printer and terminal writers.
pub const MAX_STRING_LEN: u32 = 128;

/// Entry point for pass-ups of general exceptions.
pub fn general_entry(cpu: &mut Kcpu) -> Run {
    let sup_addr = cpu.syscall(sysno::GET_SUPPORT, 0, 0, 0)?;
    let asid = bios::support_asid(sup_addr).expect("support dispatcher entered without a support structure");
    let saved = cpu.sim().kernel.support.supports[asid as usize].except_state[GENERAL_EXCEPT].clone();

    // Anything that is not a syscall is a program trap at this level.
    if exc_code(saved.cause) != EXC_SYSCALL {
        return terminate_uproc(cpu, None);
    }

    let number = saved.a0();
    trace!("support SYS{number} from asid {asid}");
    match number {
        sysno::TERMINATE => terminate_uproc(cpu, nullable_sem(saved.a1())),
        sysno::GET_TOD => get_tod(cpu, asid),
        sysno::WRITE_PRINTER => write_printer(cpu, asid, saved.a1(), saved.a2()),
        sysno::WRITE_TERMINAL => write_terminal(cpu, asid, saved.a1(), saved.a2()),
        sysno::READ_TERMINAL => read_terminal(cpu, asid, saved.a1()),
        sysno::DISK_PUT => dma::disk_io(cpu, asid, saved.a1(), saved.a2(), saved.a3(), true),
        sysno::DISK_GET => dma::disk_io(cpu, asid, saved.a1(), saved.a2(), saved.a3(), false),
        sysno::FLASH_PUT => dma::flash_io(cpu, asid, saved.a1(), saved.a2(), saved.a3(), true),
        sysno::FLASH_GET => dma::flash_io(cpu, asid, saved.a1(), saved.a2(), saved.a3(), false),
        sysno::DELAY => delay::delay_syscall(cpu, asid, saved.a1() as i32),
        _ => terminate_uproc(cpu, None),
    }
}

fn nullable_sem(addr: u32) -> Option<u32> {
    (addr != 0).then_some(addr)
}

/// SYS9: orderly death of a user process. A semaphore the caller still
/// holds can be passed in so the shared resource is not wedged; the
/// master semaphore is V'ed so the instantiator can account for us.
pub fn terminate_uproc(cpu: &mut Kcpu, release: Option<u32>) -> Run {
    if let Some(sem_addr) = release {
        support::v(cpu, sem_addr)?;
    }
    support::v(cpu, MASTER_SEM_ADDR)?;
    cpu.syscall(sysno::TERMINATE_PROCESS, 0, 0, 0)?;
    unreachable!("terminate returned")
}

/// Load the saved user state back, optionally planting a result in `v0`.
fn resume_user(cpu: &mut Kcpu, asid: u32, result: Option<u32>) -> Run {
    let state = {
        let sup = &mut cpu.sim().kernel.support.supports[asid as usize];
        if let Some(value) = result {
            sup.except_state[GENERAL_EXCEPT].set_v0(value);
        }
        sup.except_state[GENERAL_EXCEPT].clone()
    };
    cpu.ldst(&state)
}

/// SYS10: microseconds since boot.
fn get_tod(cpu: &mut Kcpu, asid: u32) -> Run {
    let now = bios::stck(cpu);
    resume_user(cpu, asid, Some(now as u32))
}

/// SYS11: write `len` bytes to the printer paired with this ASID. One
/// character per command; the command write and the I/O wait form an
/// uninterruptible pair.
fn write_printer(cpu: &mut Kcpu, asid: u32, vaddr: u32, len: u32) -> Run {
    if len > MAX_STRING_LEN {
        return terminate_uproc(cpu, None);
    }
    let dev = asid - 1;
    let mutex = bios::dev_mutex_addr(bios::dev_index(PRINTER_LINE, dev, false));
    support::p(cpu, mutex)?;
    for i in 0..len {
        let ch = cpu.load_u8(vaddr + i)?;
        cpu.sim()
            .hw
            .dev_write(PRINTER_LINE, dev as usize, DevField::Data0, ch as u32);
        let status = issue_and_wait(cpu, PRINTER_LINE, dev, DevField::Command, CMD_PRINT_CHR, false)?;
        if status & TERM_STATUS_MASK != STATUS_READY {
            support::v(cpu, mutex)?;
            return resume_user(cpu, asid, Some(neg_status(status)));
        }
    }
    support::v(cpu, mutex)?;
    resume_user(cpu, asid, Some(len))
}

/// SYS12: transmit `len` bytes on the terminal paired with this ASID.
fn write_terminal(cpu: &mut Kcpu, asid: u32, vaddr: u32, len: u32) -> Run {
    if len > MAX_STRING_LEN {
        return terminate_uproc(cpu, None);
    }
    let dev = asid - 1;
    let mutex = bios::dev_mutex_addr(bios::dev_index(TERM_LINE, dev, true));
    support::p(cpu, mutex)?;
    for i in 0..len {
        let ch = cpu.load_u8(vaddr + i)?;
        let command = ((ch as u32) << TERM_CHAR_SHIFT) | CMD_TRANSMIT;
        let status = issue_and_wait(cpu, TERM_LINE, dev, DevField::Data1, command, false)?;
        if status & TERM_STATUS_MASK != STATUS_CHAR_OK {
            support::v(cpu, mutex)?;
            return resume_user(cpu, asid, Some(neg_status(status)));
        }
    }
    support::v(cpu, mutex)?;
    resume_user(cpu, asid, Some(len))
}

/// SYS13: receive characters into the user buffer until a newline
/// arrives; the received byte sits in the upper byte of the status.
fn read_terminal(cpu: &mut Kcpu, asid: u32, vaddr: u32) -> Run {
    let dev = asid - 1;
    let mutex = bios::dev_mutex_addr(bios::dev_index(TERM_LINE, dev, false));
    support::p(cpu, mutex)?;
    let mut count = 0u32;
    loop {
        let status = issue_and_wait(cpu, TERM_LINE, dev, DevField::Command, CMD_RECEIVE, true)?;
        if status & TERM_STATUS_MASK != STATUS_CHAR_OK {
            support::v(cpu, mutex)?;
            return resume_user(cpu, asid, Some(neg_status(status)));
        }
        let ch = ((status >> TERM_CHAR_SHIFT) & 0xFF) as u8;
        cpu.store_u8(vaddr + count, ch)?;
        count += 1;
        if ch == b'\n' {
            break;
        }
    }
    support::v(cpu, mutex)?;
    resume_user(cpu, asid, Some(count))
}

/// Issue a device command and block on its completion as one
/// uninterruptible pair, so the completion interrupt cannot slip in
/// between the write and the wait.
pub fn issue_and_wait(
    cpu: &mut Kcpu,
    line: u32,
    dev: u32,
    field: DevField,
    command: u32,
    read_flag: bool,
) -> Result<u32, Killed> {
    bios::disable_interrupts(cpu);
    cpu.sim().hw.dev_write(line, dev as usize, field, command);
    let status = cpu.syscall(sysno::WAIT_IO, line, dev, read_flag as u32)?;
    bios::enable_interrupts(cpu);
    Ok(status)
}

/// Device failures return as the negated status code.
pub fn neg_status(status: u32) -> u32 {
    (status & TERM_STATUS_MASK).wrapping_neg()
}
