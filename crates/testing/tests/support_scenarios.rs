//! Full-stack scenarios: user-mode processes under demand paging, the
//! support syscalls, the DMA paths and the delay facility.

use mikron_kernel::bios::Kcpu;
use mikron_kernel::instantiator::UserProgram;
use mikron_kernel::sysno;
use mikron_machine::layout::{KUSEG, PAGE_SIZE, SWAP_POOL_ADDR};
use mikron_machine::tlb::{ENTRYLO_PFN_MASK, ENTRYLO_VALID};
use mikron_machine::{MachineConfig, Outcome};
use mikron_testing::*;

#[test]
fn pager_round_trip_survives_eviction_through_flash() {
    let log = event_log();
    let la = log.clone();
    let prog: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        cpu.store_u32(KUSEG + 0x40, 0xDEAD_BEEF)?;
        // Touch enough pages to cycle the 16-frame swap pool and force
        // page 0 out to flash and back.
        for page in 1..=16u32 {
            cpu.store_u32(KUSEG + page * PAGE_SIZE, page)?;
        }
        let first = cpu.load_u32(KUSEG + 0x40)?;
        note(&la, "page0", first as u64);
        let fifth = cpu.load_u32(KUSEG + 5 * PAGE_SIZE)?;
        note(&la, "page5", fifth as u64);
        cpu.syscall(sysno::TERMINATE, 0, 0, 0)?;
        unreachable!()
    });

    let (outcome, sim) = run_user_scenario(MachineConfig::default(), vec![prog]);

    assert_eq!(outcome, Outcome::Halt);
    assert_eq!(logged(&log, "page0"), 0xDEAD_BEEF);
    assert_eq!(logged(&log, "page5"), 5);
    // The evicted page really went through ASID 1's flash device.
    let block0 = sim.hw.devices.flash_block(0, 0);
    assert_eq!(&block0[0x40..0x44], &0xDEAD_BEEFu32.to_le_bytes());
    // Every occupied frame is mirrored by a valid page-table entry whose
    // frame field points straight back at it.
    for (index, entry) in sim.kernel.support.swap_pool.iter().enumerate() {
        if let Some(asid) = entry.asid {
            let pte = sim.kernel.support.supports[asid as usize].page_table[entry.pte_index];
            assert_ne!(pte.lo & ENTRYLO_VALID, 0, "frame {index} owner not valid");
            assert_eq!(
                pte.lo & ENTRYLO_PFN_MASK,
                SWAP_POOL_ADDR + (index as u32) * PAGE_SIZE
            );
        }
    }
}

#[test]
fn address_spaces_are_isolated_by_asid() {
    let log = event_log();
    let (la, lb) = (log.clone(), log.clone());
    let writer = |label: &'static str, value: u32, log: EventLog| -> UserProgram {
        Box::new(move |cpu: &mut Kcpu| {
            cpu.store_u32(KUSEG, value)?;
            // Outlive a quantum so the other process interleaves.
            cpu.compute(7_000)?;
            let seen = cpu.load_u32(KUSEG)?;
            note(&log, label, seen as u64);
            cpu.syscall(sysno::TERMINATE, 0, 0, 0)?;
            unreachable!()
        })
    };

    let (outcome, _sim) = run_user_scenario(
        MachineConfig::default(),
        vec![writer("first", 0x1111_1111, la), writer("second", 0x2222_2222, lb)],
    );

    assert_eq!(outcome, Outcome::Halt);
    assert_eq!(logged(&log, "first"), 0x1111_1111);
    assert_eq!(logged(&log, "second"), 0x2222_2222);
}

#[test]
fn delay_returns_within_one_pseudo_clock_granule() {
    let log = event_log();
    let la = log.clone();
    let prog: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        let before = cpu.syscall(sysno::GET_TOD, 0, 0, 0)?;
        cpu.syscall(sysno::DELAY, 1, 0, 0)?;
        let after = cpu.syscall(sysno::GET_TOD, 0, 0, 0)?;
        note(&la, "slept", (after - before) as u64);
        cpu.syscall(sysno::TERMINATE, 0, 0, 0)?;
        unreachable!()
    });

    let (outcome, _sim) = run_user_scenario(MachineConfig::default(), vec![prog]);

    assert_eq!(outcome, Outcome::Halt);
    let slept = logged(&log, "slept");
    assert!(
        (1_000_000..=1_100_000).contains(&slept),
        "slept {slept} microseconds"
    );
}

#[test]
fn terminal_write_then_read_line() {
    let log = event_log();
    let la = log.clone();
    let machine = MachineConfig {
        term_inputs: vec![(0, b"ok\n".to_vec())],
        ..MachineConfig::default()
    };
    let prog: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        for (i, byte) in b"hi!\n".iter().enumerate() {
            cpu.store_u8(KUSEG + i as u32, *byte)?;
        }
        let written = cpu.syscall(sysno::WRITE_TERMINAL, KUSEG, 4, 0)?;
        note(&la, "written", written as u64);

        let buf = KUSEG + PAGE_SIZE;
        let read = cpu.syscall(sysno::READ_TERMINAL, buf, 0, 0)?;
        note(&la, "read", read as u64);
        for i in 0..read {
            let byte = cpu.load_u8(buf + i)?;
            note(&la, &format!("in{i}"), byte as u64);
        }
        cpu.syscall(sysno::TERMINATE, 0, 0, 0)?;
        unreachable!()
    });

    let (outcome, sim) = run_user_scenario(machine, vec![prog]);

    assert_eq!(outcome, Outcome::Halt);
    assert_eq!(logged(&log, "written"), 4);
    assert_eq!(sim.hw.devices.terminal_output(0), b"hi!\n");
    assert_eq!(logged(&log, "read"), 3);
    assert_eq!(logged(&log, "in0"), b'o' as u64);
    assert_eq!(logged(&log, "in1"), b'k' as u64);
    assert_eq!(logged(&log, "in2"), b'\n' as u64);
}

#[test]
fn printer_write_reports_character_count() {
    let log = event_log();
    let la = log.clone();
    let prog: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        for (i, byte) in b"pr".iter().enumerate() {
            cpu.store_u8(KUSEG + i as u32, *byte)?;
        }
        let written = cpu.syscall(sysno::WRITE_PRINTER, KUSEG, 2, 0)?;
        note(&la, "written", written as u64);
        cpu.syscall(sysno::TERMINATE, 0, 0, 0)?;
        unreachable!()
    });

    let (outcome, sim) = run_user_scenario(MachineConfig::default(), vec![prog]);

    assert_eq!(outcome, Outcome::Halt);
    assert_eq!(logged(&log, "written"), 2);
    assert_eq!(sim.hw.devices.printer_output(0), b"pr");
}

#[test]
fn disk_put_get_round_trip() {
    let log = event_log();
    let la = log.clone();
    let prog: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        cpu.store_u32(KUSEG, 0x1234_5678)?;
        cpu.store_u32(KUSEG + 4, 99)?;
        let put = cpu.syscall(sysno::DISK_PUT, KUSEG, 0, 60)?;
        note(&la, "put", put as u64);

        let back = KUSEG + 2 * PAGE_SIZE;
        let get = cpu.syscall(sysno::DISK_GET, back, 0, 60)?;
        note(&la, "get", get as u64);
        note(&la, "word0", cpu.load_u32(back)? as u64);
        note(&la, "word1", cpu.load_u32(back + 4)? as u64);
        cpu.syscall(sysno::TERMINATE, 0, 0, 0)?;
        unreachable!()
    });

    let (outcome, _sim) = run_user_scenario(MachineConfig::default(), vec![prog]);

    assert_eq!(outcome, Outcome::Halt);
    assert_eq!(logged(&log, "put"), 1);
    assert_eq!(logged(&log, "get"), 1);
    assert_eq!(logged(&log, "word0"), 0x1234_5678);
    assert_eq!(logged(&log, "word1"), 99);
}

#[test]
fn flash_block_io_round_trip() {
    let log = event_log();
    let la = log.clone();
    let prog: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        cpu.store_u32(KUSEG, 0xCAFE_F00D)?;
        let put = cpu.syscall(sysno::FLASH_PUT, KUSEG, 0, 40)?;
        note(&la, "put", put as u64);
        let back = KUSEG + PAGE_SIZE;
        let get = cpu.syscall(sysno::FLASH_GET, back, 0, 40)?;
        note(&la, "get", get as u64);
        note(&la, "word", cpu.load_u32(back)? as u64);
        cpu.syscall(sysno::TERMINATE, 0, 0, 0)?;
        unreachable!()
    });

    let (outcome, _sim) = run_user_scenario(MachineConfig::default(), vec![prog]);

    assert_eq!(outcome, Outcome::Halt);
    assert_eq!(logged(&log, "put"), 1);
    assert_eq!(logged(&log, "get"), 1);
    assert_eq!(logged(&log, "word"), 0xCAFE_F00D);
}

#[test]
fn flash_io_pages_its_buffer_through_the_paging_device() {
    let log = event_log();
    let la = log.clone();
    let prog: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        cpu.store_u32(KUSEG, 0xFEED_C0DE)?;
        // Sixteen more pages fill every swap frame and push the buffer
        // page back out to flash.
        for page in 1..=16u32 {
            cpu.store_u32(KUSEG + page * PAGE_SIZE, page)?;
        }
        // Staging the non-resident buffer page faults into the pager,
        // whose eviction and reload both go through this ASID's own
        // flash device, before the transfer takes that device's mutex.
        let put = cpu.syscall(sysno::FLASH_PUT, KUSEG, 0, 40)?;
        note(&la, "put", put as u64);
        // The read-back lands on a fresh page, so the copy out of the
        // staging buffer faults as well.
        let out = KUSEG + 17 * PAGE_SIZE;
        let get = cpu.syscall(sysno::FLASH_GET, out, 0, 40)?;
        note(&la, "get", get as u64);
        note(&la, "word", cpu.load_u32(out)? as u64);
        cpu.syscall(sysno::TERMINATE, 0, 0, 0)?;
        unreachable!()
    });

    let (outcome, _sim) = run_user_scenario(MachineConfig::default(), vec![prog]);

    assert_eq!(outcome, Outcome::Halt);
    assert_eq!(logged(&log, "put"), 1);
    assert_eq!(logged(&log, "get"), 1);
    assert_eq!(logged(&log, "word"), 0xFEED_C0DE);
}

#[test]
fn flash_access_to_paging_blocks_is_fatal() {
    let log = event_log();
    let la = log.clone();
    let prog: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        note_now(cpu, &la, "before");
        // Blocks below 32 back the demand-paged pages; touching them
        // terminates the process.
        cpu.syscall(sysno::FLASH_PUT, KUSEG, 0, 2)?;
        note_now(cpu, &la, "after");
        cpu.syscall(sysno::TERMINATE, 0, 0, 0)?;
        unreachable!()
    });

    let (outcome, _sim) = run_user_scenario(MachineConfig::default(), vec![prog]);

    // The victim still V's the master semaphore, so shutdown is orderly.
    assert_eq!(outcome, Outcome::Halt);
    assert!(has_logged(&log, "before"));
    assert!(!has_logged(&log, "after"));
}

#[test]
fn privileged_syscall_from_user_mode_is_fatal() {
    let log = event_log();
    let la = log.clone();
    let prog: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        note_now(cpu, &la, "before");
        cpu.syscall(sysno::PASSEREN, KUSEG, 0, 0)?;
        note_now(cpu, &la, "after");
        cpu.syscall(sysno::TERMINATE, 0, 0, 0)?;
        unreachable!()
    });

    let (outcome, _sim) = run_user_scenario(MachineConfig::default(), vec![prog]);

    assert_eq!(outcome, Outcome::Halt);
    assert!(has_logged(&log, "before"));
    assert!(!has_logged(&log, "after"));
}

#[test]
fn negative_delay_is_fatal() {
    let log = event_log();
    let la = log.clone();
    let prog: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        note_now(cpu, &la, "before");
        cpu.syscall(sysno::DELAY, (-1i32) as u32, 0, 0)?;
        note_now(cpu, &la, "after");
        cpu.syscall(sysno::TERMINATE, 0, 0, 0)?;
        unreachable!()
    });

    let (outcome, _sim) = run_user_scenario(MachineConfig::default(), vec![prog]);

    assert_eq!(outcome, Outcome::Halt);
    assert!(!has_logged(&log, "after"));
}

#[test]
fn time_of_day_advances_with_computation() {
    let log = event_log();
    let la = log.clone();
    let prog: UserProgram = Box::new(move |cpu: &mut Kcpu| {
        let before = cpu.syscall(sysno::GET_TOD, 0, 0, 0)?;
        cpu.compute(2_000)?;
        let after = cpu.syscall(sysno::GET_TOD, 0, 0, 0)?;
        note(&la, "elapsed", (after - before) as u64);
        cpu.syscall(sysno::TERMINATE, 0, 0, 0)?;
        unreachable!()
    });

    let (outcome, _sim) = run_user_scenario(MachineConfig::default(), vec![prog]);

    assert_eq!(outcome, Outcome::Halt);
    assert!(logged(&log, "elapsed") >= 2_000);
}
