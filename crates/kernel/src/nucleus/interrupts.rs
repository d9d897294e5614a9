//! Device and timer interrupt handling.
//!
//! Entry stamps the time of day and the remaining quantum, then serves
//! the highest-priority pending line: 1 (quantum expiry), 2 (pseudo-clock
//! tick), 3..7 (peripheral completions, lowest line and device first,
//! transmitter before receiver on a signaling terminal).

use log::{debug, trace};
use mikron_machine::layout::*;
use mikron_machine::state::ip_line;
use mikron_machine::{Killed, ProcessorState};

use crate::bios::{self, Kcpu};
use crate::nucleus::scheduler::move_state;

/// What the caller should do once the interrupt is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntAction {
    /// Resume the interrupted current process.
    ReturnToCurrent,
    /// No current process: run the scheduler.
    Schedule,
}

/// Serve the highest-priority pending interrupt recorded in the saved
/// exception state.
pub fn handle(cpu: &mut Kcpu) -> Result<IntAction, Killed> {
    let entry_tod = bios::stck(cpu);
    let remaining = bios::get_timer(cpu);
    let saved = bios::saved_exception_state(cpu);

    if ip_line(saved.cause, PLT_LINE) {
        return plt_interrupt(cpu, &saved, entry_tod);
    }
    if ip_line(saved.cause, INTERVAL_LINE) {
        return interval_interrupt(cpu, &saved, entry_tod, remaining);
    }
    io_interrupt(cpu, &saved, entry_tod, remaining)
}

/// Line 1: the current process's quantum expired. Fold in its CPU time
/// and send it to the back of the ready queue.
fn plt_interrupt(
    cpu: &mut Kcpu,
    saved: &ProcessorState,
    entry_tod: u64,
) -> Result<IntAction, Killed> {
    if cpu.sim().kernel.nucleus.current.is_none() {
        cpu.bios_panic("local timer interrupt with no current process")?;
    }
    bios::set_timer(cpu, TIMER_NEVER);
    let sim = cpu.sim();
    let nucleus = &mut sim.kernel.nucleus;
    let pid = nucleus.current.take().unwrap();
    let pcb = nucleus.pcbs.get_mut(pid);
    move_state(saved, &mut pcb.state);
    pcb.cpu_time += entry_tod.saturating_sub(nucleus.start_tod);
    let mut ready = nucleus.ready;
    nucleus.pcbs.insert_proc_q(&mut ready, pid);
    nucleus.ready = ready;
    trace!("quantum expired for pid {pid}");
    Ok(IntAction::Schedule)
}

/// Line 2: pseudo-clock tick. Reload the interval timer, release every
/// process sleeping on the pseudo-clock semaphore and reset it. The
/// handling time is charged to nobody.
fn interval_interrupt(
    cpu: &mut Kcpu,
    saved: &ProcessorState,
    entry_tod: u64,
    remaining: u32,
) -> Result<IntAction, Killed> {
    bios::ldit(cpu, CLOCK_INTERVAL);
    let sem_addr = bios::pseudo_clock_sem_addr();
    {
        let sim = cpu.sim();
        let nucleus = &mut sim.kernel.nucleus;
        while let Some(pid) = nucleus.asl.remove_blocked(&mut nucleus.pcbs, sem_addr) {
            let mut ready = nucleus.ready;
            nucleus.pcbs.insert_proc_q(&mut ready, pid);
            nucleus.ready = ready;
            nucleus.soft_block_count -= 1;
        }
    }
    bios::sem_write(cpu, sem_addr, 0);
    Ok(return_from_interrupt(cpu, saved, entry_tod, remaining))
}

/// Lines 3..7: a peripheral completed. Latch its status, acknowledge the
/// hardware, V the sub-device semaphore and deliver the status to the
/// unblocked process, if there is one.
fn io_interrupt(
    cpu: &mut Kcpu,
    saved: &ProcessorState,
    entry_tod: u64,
    remaining: u32,
) -> Result<IntAction, Killed> {
    let Some(line) = (DISK_LINE..=TERM_LINE).find(|&line| ip_line(saved.cause, line)) else {
        cpu.bios_panic("I/O interrupt with no pending line")?;
        unreachable!()
    };
    let bitmap = cpu.sim().hw.interrupt_bitmap(line);
    let Some(dev) = (0..DEV_PER_LINE).find(|dev| bitmap & (1 << dev) != 0) else {
        // Line went quiet between the trap and now; nothing to serve.
        cpu.sim().kernel.nucleus.spurious_interrupts += 1;
        return Ok(return_from_interrupt(cpu, saved, entry_tod, remaining));
    };

    // A signaling terminal transmitter takes priority over its receiver.
    let transmit = line == TERM_LINE && {
        let transm_status = cpu.sim().hw.dev_read(line, dev as usize, DevField::Data0);
        !matches!(transm_status & 0x0F, STATUS_READY | STATUS_BUSY)
    };
    let (status, ack_field) = if transmit {
        let status = cpu.sim().hw.dev_read(line, dev as usize, DevField::Data0);
        (status, DevField::Data1)
    } else {
        let status = cpu.sim().hw.dev_read(line, dev as usize, DevField::Status);
        (status, DevField::Command)
    };
    cpu.sim().hw.dev_write(line, dev as usize, ack_field, CMD_ACK);

    // V on the sub-device semaphore.
    let sem_addr = bios::dev_sem_addr(bios::dev_index(line, dev, transmit));
    let unblocked = {
        let sim = cpu.sim();
        let nucleus = &mut sim.kernel.nucleus;
        nucleus.asl.remove_blocked(&mut nucleus.pcbs, sem_addr)
    };
    let value = bios::sem_read(cpu, sem_addr);
    bios::sem_write(cpu, sem_addr, value + 1);

    match unblocked {
        None => {
            // Completion with an empty FIFO: acknowledged, counted, and
            // control goes back to whoever was running.
            debug!("spurious completion on line {line} device {dev}");
            cpu.sim().kernel.nucleus.spurious_interrupts += 1;
        }
        Some(pid) => {
            let now = bios::stck(cpu);
            let sim = cpu.sim();
            let nucleus = &mut sim.kernel.nucleus;
            let pcb = nucleus.pcbs.get_mut(pid);
            pcb.state.set_v0(status);
            pcb.cpu_time += now.saturating_sub(entry_tod);
            let mut ready = nucleus.ready;
            nucleus.pcbs.insert_proc_q(&mut ready, pid);
            nucleus.ready = ready;
            nucleus.soft_block_count -= 1;
            trace!("I/O complete on line {line} dev {dev}: pid {pid} status {status:#x}");
        }
    }
    Ok(return_from_interrupt(cpu, saved, entry_tod, remaining))
}

/// Return to the interrupted process with its remaining quantum, or ask
/// for the scheduler when nothing was running.
fn return_from_interrupt(
    cpu: &mut Kcpu,
    saved: &ProcessorState,
    entry_tod: u64,
    remaining: u32,
) -> IntAction {
    let current = cpu.sim().kernel.nucleus.current;
    match current {
        Some(pid) => {
            bios::set_timer(cpu, remaining);
            let sim = cpu.sim();
            let nucleus = &mut sim.kernel.nucleus;
            let pcb = nucleus.pcbs.get_mut(pid);
            move_state(saved, &mut pcb.state);
            pcb.cpu_time += entry_tod.saturating_sub(nucleus.start_tod);
            IntAction::ReturnToCurrent
        }
        None => IntAction::Schedule,
    }
}
