//! Preemptive round-robin scheduler with a 5 ms quantum, plus the
//! empty-ready-queue policy: halt when nothing is left, wait when
//! soft-blocked processes will come back, panic on deadlock.

use log::trace;
use mikron_machine::layout::{QUANTUM, TIMER_NEVER};
use mikron_machine::state::Status;
use mikron_machine::{ProcessorState, Run};

use crate::bios::{self, Kcpu};
use crate::nucleus::interrupts::{self, IntAction};
use crate::nucleus::pcb::Pid;

/// Full copy of a saved processor state between two locations; used
/// whenever the nucleus lifts the BIOS-saved exception state into a PCB.
pub fn move_state(source: &ProcessorState, dest: &mut ProcessorState) {
    dest.clone_from(source);
}

/// Make `pid` the current process, stamp its dispatch time and transfer
/// control to its saved state.
pub fn load_processor_state(cpu: &mut Kcpu, pid: Pid) -> Run {
    let now = bios::stck(cpu);
    let state = {
        let sim = cpu.sim();
        sim.kernel.nucleus.current = Some(pid);
        sim.kernel.nucleus.start_tod = now;
        sim.kernel.nucleus.pcbs.get(pid).state.clone()
    };
    cpu.ldst(&state)
}

/// Resume the current process after an interrupt or a non-blocking
/// syscall.
pub fn resume_current(cpu: &mut Kcpu) -> Run {
    let pid = cpu
        .sim()
        .kernel
        .nucleus
        .current
        .expect("resume with no current process");
    load_processor_state(cpu, pid)
}

/// Dispatch the next ready process, or apply the empty-queue policy.
pub fn switch_process(cpu: &mut Kcpu) -> Run {
    loop {
        let next = {
            let sim = cpu.sim();
            let nucleus = &mut sim.kernel.nucleus;
            let mut ready = nucleus.ready;
            let next = nucleus.pcbs.remove_proc_q(&mut ready);
            nucleus.ready = ready;
            next
        };
        if let Some(pid) = next {
            trace!("dispatch pid {pid}");
            bios::set_timer(cpu, QUANTUM as u32);
            return load_processor_state(cpu, pid);
        }

        let (process_count, soft_blocked) = {
            let nucleus = &cpu.sim().kernel.nucleus;
            (nucleus.process_count, nucleus.soft_block_count)
        };
        if process_count == 0 {
            return cpu.halt();
        }
        if soft_blocked == 0 {
            return cpu.bios_panic("deadlock: live processes, none ready, none soft-blocked");
        }

        // Wait state: open the interrupt mask, park the quantum timer and
        // stall for the next device or timer event. The interrupt handler
        // runs here directly; dispatching resumes at the top of the loop.
        cpu.sim().hw.cpu.status = Status::IEC | Status::IM_ALL;
        bios::set_timer(cpu, TIMER_NEVER);
        cpu.wait_for_interrupt()?;
        if let IntAction::ReturnToCurrent = interrupts::handle(cpu)? {
            // Unreachable in the wait state (there is no current
            // process), but honoring it keeps the contract local.
            return resume_current(cpu);
        }
    }
}

/// Fold the time since dispatch into the current process's accounting.
pub fn charge_current(cpu: &mut Kcpu) {
    let now = bios::stck(cpu);
    let sim = cpu.sim();
    let nucleus = &mut sim.kernel.nucleus;
    if let Some(pid) = nucleus.current {
        let elapsed = now.saturating_sub(nucleus.start_tod);
        nucleus.pcbs.get_mut(pid).cpu_time += elapsed;
        nucleus.start_tod = now;
    }
}
