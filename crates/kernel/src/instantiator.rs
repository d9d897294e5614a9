//! Boot-time wiring: the kernel entry point and the instantiator process.
//!
//! The entry point installs the pass-up vector, arms the interval timer
//! and creates a single process running the instantiator, which in turn
//! builds the support level (swap pool, ADL + daemon, device mutexes),
//! launches one user process per supplied program, waits on the master
//! termination semaphore once per launch, and terminates, driving the
//! process count to zero so the nucleus halts.

use log::{info, warn};
use mikron_machine::layout::*;
use mikron_machine::state::{Status, ASID_SHIFT, R_SP, R_T9, STATE_SIZE, VPN_SHIFT};
use mikron_machine::tlb::ENTRYLO_DIRTY;
use mikron_machine::{Body, PassUpVector, ProcessorState, Run, TlbEntry};

use crate::bios::{self, Kcpu, EXC_VECTOR_PC, INSTANTIATOR_PC, PAGER_PC, REFILL_VECTOR_PC,
    STATE_STAGING_BASE, SUPPORT_GENERAL_PC};
use crate::nucleus::{exceptions, scheduler};
use crate::support::{self, delay, pager, syscalls, Context, GENERAL_EXCEPT, PAGE_TABLE_SIZE,
    PGFAULT_EXCEPT, UPROC_MAX};
use crate::sysno;
use crate::Kernel;

/// A user program to run under its own ASID.
pub type UserProgram = Body<Kernel>;

/// Install the pass-up vector and the kernel's handler entry points.
pub fn install_vectors(cpu: &mut Kcpu) {
    let sim = cpu.sim();
    sim.hw.passup = PassUpVector {
        refill_pc: REFILL_VECTOR_PC,
        refill_sp: NUCLEUS_STACK,
        exception_pc: EXC_VECTOR_PC,
        exception_sp: NUCLEUS_STACK,
    };
    sim.register_handler(EXC_VECTOR_PC, exceptions::general_exception);
    sim.register_handler(REFILL_VECTOR_PC, pager::tlb_refill);
    sim.register_handler(PAGER_PC, pager::pager_entry);
    sim.register_handler(SUPPORT_GENERAL_PC, syscalls::general_entry);
}

/// Kernel entry point, run as the first execution context after power-on.
pub fn kernel_main(cpu: &mut Kcpu, programs: Vec<UserProgram>) -> Run {
    install_vectors(cpu);
    bios::ldit(cpu, CLOCK_INTERVAL);

    let ram_top = cpu.sim().hw.ram.top();
    let ctx = cpu.spawn_context(Box::new(move |cpu: &mut Kcpu| instantiator(cpu, programs)));
    {
        let sim = cpu.sim();
        let pid = sim
            .kernel
            .nucleus
            .pcbs
            .alloc()
            .expect("fresh PCB pool cannot be empty");
        let pcb = sim.kernel.nucleus.pcbs.get_mut(pid);
        pcb.state.pc = INSTANTIATOR_PC;
        pcb.state.regs[R_T9] = INSTANTIATOR_PC;
        pcb.state.regs[R_SP] = ram_top;
        pcb.state.status = Status::IEP | Status::IM_ALL | Status::TE;
        pcb.state.ctx = ctx;
        let nucleus = &mut sim.kernel.nucleus;
        let mut ready = nucleus.ready;
        nucleus.pcbs.insert_proc_q(&mut ready, pid);
        nucleus.ready = ready;
        nucleus.process_count += 1;
    }
    info!("nucleus up; dispatching the instantiator");
    scheduler::switch_process(cpu)
}

/// The instantiator process (kernel ASID 0).
fn instantiator(cpu: &mut Kcpu, programs: Vec<UserProgram>) -> Run {
    let count = programs.len() as u32;
    pager::init_swap_structs(cpu);
    delay::init_adl(cpu)?;
    for index in 0..DEV_SEM_COUNT - 1 {
        bios::sem_write(cpu, bios::dev_mutex_addr(index), 1);
    }
    bios::sem_write(cpu, MASTER_SEM_ADDR, 0);
    cpu.sim().kernel.support.uproc_count = count;

    for (index, program) in programs.into_iter().enumerate() {
        let asid = (index + 1) as u32;
        let ctx = cpu.spawn_context(program);
        build_support_structure(cpu, asid);
        bios::sem_write(cpu, bios::delay_sem_addr(asid), 0);

        let mut state = ProcessorState {
            ctx,
            ..ProcessorState::default()
        };
        state.pc = TEXT_AREA_START;
        state.regs[R_T9] = TEXT_AREA_START;
        state.regs[R_SP] = STACK_TOP;
        state.status = Status::IEP | Status::KUP | Status::IM_ALL | Status::TE;
        state.entry_hi = KUSEG | (asid << ASID_SHIFT);

        let staging = STATE_STAGING_BASE + asid * STATE_SIZE;
        cpu.sim().hw.write_state(staging, &state);
        let result = cpu.syscall(sysno::CREATE, staging, bios::support_addr(asid), 0)?;
        if result != 0 {
            warn!("user process {asid} creation failed");
            cpu.syscall(sysno::TERMINATE_PROCESS, 0, 0, 0)?;
        }
    }

    // One P per launched user process; each SYS9 V's the master
    // semaphore on its way out.
    for _ in 0..count {
        support::p(cpu, MASTER_SEM_ADDR)?;
    }
    info!("all user processes concluded");
    cpu.syscall(sysno::TERMINATE_PROCESS, 0, 0, 0)?;
    unreachable!("terminate returned")
}

/// Fill in one user process's support structure: exception contexts into
/// the pager and the support dispatcher, and an all-invalid page table
/// with the stack page keyed at the last entry.
fn build_support_structure(cpu: &mut Kcpu, asid: u32) {
    debug_assert!((1..=UPROC_MAX as u32).contains(&asid));
    let kernel_context = (Status::IEP | Status::IM_ALL | Status::TE).bits();
    let stack_base = SUPPORT_STACK_BASE + (asid - 1) * 2 * PAGE_SIZE;
    let sup = &mut cpu.sim().kernel.support.supports[asid as usize];
    sup.asid = asid;
    sup.stack_tlb_top = stack_base + PAGE_SIZE;
    sup.stack_gen_top = stack_base + 2 * PAGE_SIZE;
    sup.except_context[PGFAULT_EXCEPT] = Context {
        stack_ptr: sup.stack_tlb_top,
        status: kernel_context,
        pc: PAGER_PC,
    };
    sup.except_context[GENERAL_EXCEPT] = Context {
        stack_ptr: sup.stack_gen_top,
        status: kernel_context,
        pc: SUPPORT_GENERAL_PC,
    };
    for (index, entry) in sup.page_table.iter_mut().enumerate() {
        *entry = TlbEntry {
            hi: ((KUSEG_PAGE_BASE + index as u32) << VPN_SHIFT) | (asid << ASID_SHIFT),
            lo: ENTRYLO_DIRTY,
        };
    }
    sup.page_table[PAGE_TABLE_SIZE - 1].hi = STACK_PAGE_VPN | (asid << ASID_SHIFT);
    sup.delay_sem_addr = bios::delay_sem_addr(asid);
}
