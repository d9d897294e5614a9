//! Exception routing and the eight privileged syscalls.
//!
//! The general exception vector decodes the saved Cause: interrupts go to
//! the interrupt handler, TLB exceptions and syscalls 9+ pass up to the
//! support level (or kill the offender), kernel-mode SYS1..SYS8 are
//! served here, and everything else is a program trap.

use log::trace;
use mikron_machine::layout::{TERM_LINE, WORD_LEN};
use mikron_machine::state::{
    exc_code, mk_cause, Status, CAUSE_EXC_MASK, EXC_INTERRUPT, EXC_RESERVED_INSTRUCTION,
    EXC_SYSCALL,
};
use mikron_machine::Run;

use crate::bios::{self, Kcpu};
use crate::nucleus::interrupts::{self, IntAction};
use crate::nucleus::pcb::Pid;
use crate::nucleus::scheduler::{self, move_state};
use crate::support::{GENERAL_EXCEPT, PGFAULT_EXCEPT};
use crate::sysno;

/// Entry point installed in the pass-up vector for every non-refill
/// exception.
pub fn general_exception(cpu: &mut Kcpu) -> Run {
    let cause = bios::saved_exception_state(cpu).cause;
    match exc_code(cause) {
        EXC_INTERRUPT => match interrupts::handle(cpu)? {
            IntAction::ReturnToCurrent => scheduler::resume_current(cpu),
            IntAction::Schedule => scheduler::switch_process(cpu),
        },
        1..=3 => tlb_trap(cpu),
        EXC_SYSCALL => syscall_exception(cpu),
        _ => program_trap(cpu),
    }
}

/// TLB exceptions pass up to the support structure's page-fault slot.
pub fn tlb_trap(cpu: &mut Kcpu) -> Run {
    pass_up_or_die(cpu, PGFAULT_EXCEPT)
}

/// Program traps pass up to the support structure's general slot.
pub fn program_trap(cpu: &mut Kcpu) -> Run {
    pass_up_or_die(cpu, GENERAL_EXCEPT)
}

fn syscall_exception(cpu: &mut Kcpu) -> Run {
    // Step the saved PC past the SYSCALL instruction first, so neither a
    // blocking resumption nor a pass-up re-executes it.
    cpu.sim().hw.bios_state.pc += WORD_LEN;
    let saved = bios::saved_exception_state(cpu);
    let number = saved.a0();

    // Numbers outside the privileged range belong to the support level.
    if !(sysno::CREATE..=sysno::GET_SUPPORT).contains(&number) {
        return pass_up_or_die(cpu, GENERAL_EXCEPT);
    }

    // A privileged request from user mode is a reserved-instruction trap.
    if saved.status.contains(Status::KUP) {
        let sim = cpu.sim();
        sim.hw.bios_state.cause = reserved_instruction_cause(sim.hw.bios_state.cause);
        return program_trap(cpu);
    }

    // Lift the saved state into the current PCB before serving.
    let current = {
        let sim = cpu.sim();
        let pid = sim.kernel.nucleus.current.expect("syscall with no current process");
        let lifted = sim.hw.bios_state.clone();
        move_state(&lifted, &mut sim.kernel.nucleus.pcbs.get_mut(pid).state);
        pid
    };
    trace!("SYS{number} from pid {current}");

    match number {
        sysno::CREATE => sys_create(cpu, current),
        sysno::TERMINATE_PROCESS => sys_terminate(cpu, current),
        sysno::PASSEREN => sys_passeren(cpu, saved.a1()),
        sysno::VERHOGEN => sys_verhogen(cpu, saved.a1()),
        sysno::WAIT_IO => sys_wait_io(cpu, saved.a1(), saved.a2(), saved.a3()),
        sysno::GET_CPU_TIME => sys_get_cpu_time(cpu, current),
        sysno::WAIT_CLOCK => sys_wait_clock(cpu),
        sysno::GET_SUPPORT => sys_get_support(cpu, current),
        _ => unreachable!("syscall number already range-checked"),
    }
}

/// SYS1: allocate a PCB for the state at `a1`, optionally bind the
/// support structure named by `a2`, make it a child of the caller and a
/// member of the ready queue. Returns 0, or -1 on pool exhaustion.
fn sys_create(cpu: &mut Kcpu, current: Pid) -> Run {
    let (state_addr, support_word) = {
        let state = &cpu.sim().kernel.nucleus.pcbs.get(current).state;
        (state.a1(), state.a2())
    };
    let result = {
        let sim = cpu.sim();
        match sim.kernel.nucleus.pcbs.alloc() {
            Err(_) => u32::MAX,
            Ok(new_pid) => {
                let new_state = sim.hw.read_state(state_addr);
                let nucleus = &mut sim.kernel.nucleus;
                let pcb = nucleus.pcbs.get_mut(new_pid);
                pcb.state = new_state;
                pcb.support = bios::support_asid(support_word);
                let mut ready = nucleus.ready;
                nucleus.pcbs.insert_proc_q(&mut ready, new_pid);
                nucleus.ready = ready;
                nucleus.pcbs.insert_child(current, new_pid);
                nucleus.process_count += 1;
                0
            }
        }
    };
    cpu.sim().kernel.nucleus.pcbs.get_mut(current).state.set_v0(result);
    scheduler::charge_current(cpu);
    scheduler::resume_current(cpu)
}

/// SYS2: cascade-terminate the caller and its whole progeny, then let
/// the scheduler find other work.
fn sys_terminate(cpu: &mut Kcpu, current: Pid) -> Run {
    terminate_progeny(cpu, current);
    cpu.sim().kernel.nucleus.current = None;
    scheduler::switch_process(cpu)
}

/// Remove one process (and, first, its progeny) from wherever it lives:
/// the processor, an ASL FIFO, or the ready queue.
pub fn terminate_progeny(cpu: &mut Kcpu, pid: Pid) {
    loop {
        let child = cpu.sim().kernel.nucleus.pcbs.remove_child(pid);
        match child {
            Some(child) => terminate_progeny(cpu, child),
            None => break,
        }
    }

    let (sem_key, ctx, is_current) = {
        let nucleus = &cpu.sim().kernel.nucleus;
        let pcb = nucleus.pcbs.get(pid);
        (pcb.sem_key, pcb.state.ctx, nucleus.current == Some(pid))
    };

    if is_current {
        cpu.sim().kernel.nucleus.pcbs.out_child(pid);
    } else if let Some(key) = sem_key {
        {
            let sim = cpu.sim();
            let nucleus = &mut sim.kernel.nucleus;
            nucleus.asl.out_blocked(&mut nucleus.pcbs, pid);
        }
        if bios::is_device_sem(key) {
            // The device's own interrupt will increment the semaphore.
            cpu.sim().kernel.nucleus.soft_block_count -= 1;
        } else {
            let value = bios::sem_read(cpu, key);
            bios::sem_write(cpu, key, value + 1);
        }
    } else {
        let sim = cpu.sim();
        let nucleus = &mut sim.kernel.nucleus;
        let mut ready = nucleus.ready;
        nucleus.pcbs.out_proc_q(&mut ready, pid);
        nucleus.ready = ready;
    }

    {
        let sim = cpu.sim();
        sim.kernel.nucleus.pcbs.free(pid);
        sim.kernel.nucleus.process_count -= 1;
    }
    cpu.kill_context(ctx);
    trace!("terminated pid {pid}");
}

/// Block the current process on the semaphore at `key`.
fn block_current(cpu: &mut Kcpu, key: u32) {
    scheduler::charge_current(cpu);
    let insert_failed = {
        let sim = cpu.sim();
        let nucleus = &mut sim.kernel.nucleus;
        let pid = nucleus.current.take().expect("blocking with no current process");
        nucleus.asl.insert_blocked(&mut nucleus.pcbs, key, pid).is_err()
    };
    if insert_failed {
        // One descriptor per blocked PCB; running dry means corruption.
        let _ = cpu.bios_panic("active semaphore list descriptor pool exhausted");
    }
}

/// SYS3: P. Drive the counter down; below zero the caller blocks.
fn sys_passeren(cpu: &mut Kcpu, sem_addr: u32) -> Run {
    let value = bios::sem_read(cpu, sem_addr) - 1;
    bios::sem_write(cpu, sem_addr, value);
    if value < 0 {
        block_current(cpu, sem_addr);
        return scheduler::switch_process(cpu);
    }
    scheduler::charge_current(cpu);
    scheduler::resume_current(cpu)
}

/// SYS4: V. Raise the counter; at or below zero one waiter wakes.
fn sys_verhogen(cpu: &mut Kcpu, sem_addr: u32) -> Run {
    let value = bios::sem_read(cpu, sem_addr) + 1;
    bios::sem_write(cpu, sem_addr, value);
    if value <= 0 {
        let sim = cpu.sim();
        let nucleus = &mut sim.kernel.nucleus;
        if let Some(pid) = nucleus.asl.remove_blocked(&mut nucleus.pcbs, sem_addr) {
            let mut ready = nucleus.ready;
            nucleus.pcbs.insert_proc_q(&mut ready, pid);
            nucleus.ready = ready;
        }
    }
    scheduler::charge_current(cpu);
    scheduler::resume_current(cpu)
}

/// SYS5: wait for I/O on (line, device, sub-device). Always blocks; the
/// interrupt handler delivers the device status in `v0`.
fn sys_wait_io(cpu: &mut Kcpu, line: u32, dev: u32, read_flag: u32) -> Run {
    let transmit = line == TERM_LINE && read_flag == 0;
    let sem_addr = bios::dev_sem_addr(bios::dev_index(line, dev, transmit));
    cpu.sim().kernel.nucleus.soft_block_count += 1;
    let value = bios::sem_read(cpu, sem_addr) - 1;
    bios::sem_write(cpu, sem_addr, value);
    block_current(cpu, sem_addr);
    scheduler::switch_process(cpu)
}

/// SYS6: accumulated CPU time including the running quantum.
fn sys_get_cpu_time(cpu: &mut Kcpu, current: Pid) -> Run {
    scheduler::charge_current(cpu);
    let sim = cpu.sim();
    let time = sim.kernel.nucleus.pcbs.get(current).cpu_time;
    sim.kernel.nucleus.pcbs.get_mut(current).state.set_v0(time as u32);
    scheduler::resume_current(cpu)
}

/// SYS7: sleep until the next pseudo-clock tick.
fn sys_wait_clock(cpu: &mut Kcpu) -> Run {
    let sem_addr = bios::pseudo_clock_sem_addr();
    let value = bios::sem_read(cpu, sem_addr) - 1;
    bios::sem_write(cpu, sem_addr, value);
    cpu.sim().kernel.nucleus.soft_block_count += 1;
    block_current(cpu, sem_addr);
    scheduler::switch_process(cpu)
}

/// SYS8: the caller's support structure address, or 0 if it has none.
fn sys_get_support(cpu: &mut Kcpu, current: Pid) -> Run {
    let sim = cpu.sim();
    let addr = sim
        .kernel
        .nucleus
        .pcbs
        .get(current)
        .support
        .map(bios::support_addr)
        .unwrap_or(0);
    sim.kernel.nucleus.pcbs.get_mut(current).state.set_v0(addr);
    scheduler::charge_current(cpu);
    scheduler::resume_current(cpu)
}

/// Deliver the saved exception state to the support level through the
/// pre-built context for `slot`, or cascade-terminate a process that has
/// no support structure.
pub fn pass_up_or_die(cpu: &mut Kcpu, slot: usize) -> Run {
    let current = cpu
        .sim()
        .kernel
        .nucleus
        .current
        .expect("exception pass-up with no current process");
    let support = cpu.sim().kernel.nucleus.pcbs.get(current).support;
    match support {
        Some(asid) => {
            let context = {
                let sim = cpu.sim();
                let saved = sim.hw.bios_state.clone();
                let sup = &mut sim.kernel.support.supports[asid as usize];
                move_state(&saved, &mut sup.except_state[slot]);
                sup.except_context[slot]
            };
            scheduler::charge_current(cpu);
            cpu.ldcxt(context.stack_ptr, context.status, context.pc)
        }
        None => {
            terminate_progeny(cpu, current);
            cpu.sim().kernel.nucleus.current = None;
            scheduler::switch_process(cpu)
        }
    }
}

/// Rewrite a Cause value to the reserved-instruction code, keeping the
/// pending-interrupt bits.
fn reserved_instruction_cause(cause: u32) -> u32 {
    (cause & !CAUSE_EXC_MASK) | mk_cause(EXC_RESERVED_INSTRUCTION, 0)
}
