//! Nucleus-level scenarios: kernel-mode processes driving the scheduler,
//! semaphores, the pseudo-clock and cascade termination.

use mikron_kernel::bios::Kcpu;
use mikron_kernel::instantiator::UserProgram;
use mikron_kernel::nucleus::pcb::MAX_PROC;
use mikron_kernel::sysno;
use mikron_machine::layout::{CMD_PRINT_CHR, CMD_RECEIVE, PRINTER_LINE, TERM_LINE};
use mikron_machine::{DevField, MachineConfig, Outcome};
use mikron_testing::*;

#[test]
fn quantum_expiry_requeues_and_charges_time() {
    let log = event_log();
    let (la, lb) = (log.clone(), log.clone());
    let a: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        note_now(cpu, &la, "a:start");
        cpu.compute(7_000)?;
        let time = cpu.syscall(sysno::GET_CPU_TIME, 0, 0, 0)?;
        note(&la, "a:cpu_time", time as u64);
        cpu.syscall(sysno::TERMINATE_PROCESS, 0, 0, 0)?;
        unreachable!()
    });
    let b: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        note_now(cpu, &lb, "b:start");
        cpu.syscall(sysno::TERMINATE_PROCESS, 0, 0, 0)?;
        unreachable!()
    });

    let (outcome, sim) = run_nucleus_scenario(MachineConfig::default(), vec![a, b]);

    assert_eq!(outcome, Outcome::Halt);
    // B gets the processor when A's 5 ms quantum expires.
    let b_start = logged(&log, "b:start");
    assert!((5_000..=5_500).contains(&b_start), "b started at {b_start}");
    // A is charged for its full computation, quantum boundary included.
    let a_time = logged(&log, "a:cpu_time");
    assert!((6_900..=7_600).contains(&a_time), "a was charged {a_time}");
    assert_eq!(sim.kernel.nucleus.process_count, 0);
}

#[test]
fn passeren_blocks_until_verhogen_releases() {
    let log = event_log();
    let (la, lb) = (log.clone(), log.clone());
    let sem = scratch_sem(0);
    let a: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        note_now(cpu, &la, "a:p");
        cpu.syscall(sysno::PASSEREN, sem, 0, 0)?;
        note_now(cpu, &la, "a:resumed");
        cpu.syscall(sysno::TERMINATE_PROCESS, 0, 0, 0)?;
        unreachable!()
    });
    let b: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        note_now(cpu, &lb, "b:v");
        cpu.syscall(sysno::VERHOGEN, sem, 0, 0)?;
        note_now(cpu, &lb, "b:after_v");
        cpu.syscall(sysno::TERMINATE_PROCESS, 0, 0, 0)?;
        unreachable!()
    });

    let (outcome, sim) = run_nucleus_scenario(MachineConfig::default(), vec![a, b]);

    assert_eq!(outcome, Outcome::Halt);
    assert!(logged_before(&log, "a:p", "b:v"));
    // The V does not yield: B keeps the processor, A resumes from the
    // tail of the ready queue afterwards.
    assert!(logged_before(&log, "b:after_v", "a:resumed"));
    // A non-device block never touches the soft-block count.
    assert_eq!(sim.kernel.nucleus.soft_block_count, 0);
    assert_eq!(sim.hw.ram.read_u32(sem), 0);
}

fn blocker(label: &'static str, log: EventLog, sem: u32) -> UserProgram {
    Box::new(move |cpu: &mut Kcpu| {
        note_now(cpu, &log, label);
        cpu.syscall(sysno::PASSEREN, sem, 0, 0)?;
        unreachable!("terminated while blocked")
    })
}

#[test]
fn cascade_terminate_reclaims_the_whole_subtree() {
    let log = event_log();
    let lp = log.clone();
    let gate = scratch_sem(1);
    let block = scratch_sem(2);

    let parent: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        let lmid = lp.clone();
        let mid: UserProgram = Box::new(move |cpu: &mut Kcpu| {
            // The middle child spawns two of its own, then releases the
            // parent and parks itself.
            create_child(cpu, 3, blocker("d1:up", lmid.clone(), block))?;
            create_child(cpu, 4, blocker("d2:up", lmid.clone(), block))?;
            cpu.syscall(sysno::VERHOGEN, gate, 0, 0)?;
            cpu.syscall(sysno::PASSEREN, block, 0, 0)?;
            unreachable!("terminated while blocked")
        });
        create_child(cpu, 0, mid)?;
        create_child(cpu, 1, blocker("c2:up", lp.clone(), block))?;
        create_child(cpu, 2, blocker("c3:up", lp.clone(), block))?;
        // Wait until the grandchildren exist, then take the whole tree
        // down with one SYS2.
        cpu.syscall(sysno::PASSEREN, gate, 0, 0)?;
        note_now(cpu, &lp, "parent:terminating");
        cpu.syscall(sysno::TERMINATE_PROCESS, 0, 0, 0)?;
        unreachable!()
    });

    let (outcome, sim) = run_nucleus_scenario(MachineConfig::default(), vec![parent]);

    assert_eq!(outcome, Outcome::Halt);
    assert!(has_logged(&log, "parent:terminating"));
    assert_eq!(sim.kernel.nucleus.process_count, 0);
    // Every PCB is back in the free pool, fields cleared by the allocator.
    assert_eq!(sim.kernel.nucleus.pcbs.free_count(), MAX_PROC);
    // Terminating blocked victims re-increments the non-device semaphore.
    assert_eq!(sim.hw.ram.read_u32(block), 0);
}

#[test]
fn deadlock_with_no_soft_blocks_panics() {
    let lone: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        // P on a fresh semaphore nobody will ever V.
        cpu.syscall(sysno::PASSEREN, scratch_sem(3), 0, 0)?;
        unreachable!()
    });

    let (outcome, _sim) = run_nucleus_scenario(MachineConfig::default(), vec![lone]);

    match outcome {
        Outcome::Panic(msg) => assert!(msg.contains("deadlock"), "unexpected panic: {msg}"),
        other => panic!("expected a deadlock panic, got {other:?}"),
    }
}

#[test]
fn create_reports_pool_exhaustion() {
    let log = event_log();
    let lp = log.clone();
    let parent: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        // One PCB is ours; the pool holds MAX_PROC in total.
        for slot in 0..MAX_PROC as u32 {
            let blocked: UserProgram = Box::new(move |cpu: &mut Kcpu| {
                cpu.syscall(sysno::PASSEREN, scratch_sem(4), 0, 0)?;
                unreachable!()
            });
            let result = create_child(cpu, slot, blocked)?;
            if result == u32::MAX {
                note(&lp, "exhausted_at", slot as u64);
                break;
            }
        }
        cpu.syscall(sysno::TERMINATE_PROCESS, 0, 0, 0)?;
        unreachable!()
    });

    let (outcome, sim) = run_nucleus_scenario(MachineConfig::default(), vec![parent]);

    assert_eq!(outcome, Outcome::Halt);
    assert_eq!(logged(&log, "exhausted_at"), (MAX_PROC - 1) as u64);
    assert_eq!(sim.kernel.nucleus.pcbs.free_count(), MAX_PROC);
}

#[test]
fn wait_clock_wakes_on_the_next_tick() {
    let log = event_log();
    let la = log.clone();
    let sleeper: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        note_now(cpu, &la, "before");
        cpu.syscall(sysno::WAIT_CLOCK, 0, 0, 0)?;
        note_now(cpu, &la, "after");
        cpu.syscall(sysno::TERMINATE_PROCESS, 0, 0, 0)?;
        unreachable!()
    });

    let (outcome, _sim) = run_nucleus_scenario(MachineConfig::default(), vec![sleeper]);

    assert_eq!(outcome, Outcome::Halt);
    let woke = logged(&log, "after");
    assert!((100_000..=101_000).contains(&woke), "woke at {woke}");
}

#[test]
fn unclaimed_completion_counts_as_spurious() {
    let log = event_log();
    let lw = log.clone();
    // Fire a printer command and die without waiting for it.
    let firer: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        cpu.sim()
            .hw
            .dev_write(PRINTER_LINE, 0, DevField::Data0, b'!' as u32);
        cpu.sim()
            .hw
            .dev_write(PRINTER_LINE, 0, DevField::Command, CMD_PRINT_CHR);
        cpu.syscall(sysno::TERMINATE_PROCESS, 0, 0, 0)?;
        unreachable!()
    });
    let watcher: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        cpu.syscall(sysno::WAIT_CLOCK, 0, 0, 0)?;
        let spurious = cpu.sim().kernel.nucleus.spurious_interrupts;
        note(&lw, "spurious", spurious);
        cpu.syscall(sysno::TERMINATE_PROCESS, 0, 0, 0)?;
        unreachable!()
    });

    let (outcome, _sim) = run_nucleus_scenario(MachineConfig::default(), vec![watcher, firer]);

    assert_eq!(outcome, Outcome::Halt);
    assert_eq!(logged(&log, "spurious"), 1);
}

#[test]
fn terminal_transmitter_preempts_receiver_on_the_same_line() {
    // Issue both terminal sub-device operations, then wait on each; the
    // transmitter completion must carry the transmit status.
    let log = event_log();
    let la = log.clone();
    let proc: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        cpu.sim()
            .hw
            .dev_write(TERM_LINE, 0, DevField::Command, CMD_RECEIVE);
        cpu.sim()
            .hw
            .dev_write(TERM_LINE, 0, DevField::Data1, ((b'z' as u32) << 8) | 2);
        let status = cpu.syscall(sysno::WAIT_IO, TERM_LINE, 0, 0)?;
        note(&la, "transmit_status", status as u64);
        cpu.syscall(sysno::TERMINATE_PROCESS, 0, 0, 0)?;
        unreachable!()
    });

    let (outcome, _sim) = run_nucleus_scenario(MachineConfig::default(), vec![proc]);

    assert_eq!(outcome, Outcome::Halt);
    // Character transmitted: status 5 with the byte in the upper byte.
    assert_eq!(logged(&log, "transmit_status"), ((b'z' as u64) << 8) | 5);
}
