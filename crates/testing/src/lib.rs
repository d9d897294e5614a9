//! Scenario harness for the mikron kernel.
//!
//! Two entry points: [`run_user_scenario`] boots the full stack (the
//! instantiator launches one user-mode process per program), while
//! [`run_nucleus_scenario`] skips the support level and runs the given
//! bodies as kernel-mode processes, the way a nucleus-level test harness
//! would. Bodies record observations through a shared [`EventLog`] that
//! the test inspects after shutdown.

use std::sync::{Arc, Mutex, Once};

use mikron_kernel::bios::{self, Kcpu, STATE_STAGING_BASE};
use mikron_kernel::instantiator::{self, UserProgram};
use mikron_kernel::nucleus::scheduler;
use mikron_kernel::{sysno, BootConfig, Kernel};
use mikron_machine::layout::CLOCK_INTERVAL;
use mikron_machine::state::{Status, R_SP, R_T9, STATE_SIZE};
use mikron_machine::{Killed, MachineConfig, Outcome, ProcessorState, Sim};

/// Decorative program counter for harness-created kernel bodies.
pub const TEST_BODY_PC: u32 = 0x0002_0000;

/// Scratch RAM words usable as fresh semaphores in nucleus scenarios.
pub fn scratch_sem(index: u32) -> u32 {
    0x2000_3000 + index * 4
}

/// Timestamped observations recorded by scenario bodies.
pub type EventLog = Arc<Mutex<Vec<(String, u64)>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Record `(label, value)`; most entries use the current time of day.
pub fn note(log: &EventLog, label: &str, value: u64) {
    log.lock().unwrap().push((label.to_string(), value));
}

/// Record `label` at the current time of day.
pub fn note_now(cpu: &mut Kcpu, log: &EventLog, label: &str) {
    let now = cpu.sim().hw.tod();
    note(log, label, now);
}

/// Fetch the value recorded under `label`, panicking if absent.
pub fn logged(log: &EventLog, label: &str) -> u64 {
    log.lock()
        .unwrap()
        .iter()
        .find(|(name, _)| name == label)
        .unwrap_or_else(|| panic!("no event logged under {label:?}"))
        .1
}

pub fn has_logged(log: &EventLog, label: &str) -> bool {
    log.lock().unwrap().iter().any(|(name, _)| name == label)
}

/// Order of first occurrence of two labels.
pub fn logged_before(log: &EventLog, first: &str, second: &str) -> bool {
    let entries = log.lock().unwrap();
    let a = entries.iter().position(|(name, _)| name == first);
    let b = entries.iter().position(|(name, _)| name == second);
    match (a, b) {
        (Some(a), Some(b)) => a < b,
        _ => false,
    }
}

static LOG_INIT: Once = Once::new();

pub fn init_logging() {
    LOG_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Boot the full stack with one user-mode process per program.
pub fn run_user_scenario(
    machine: MachineConfig,
    programs: Vec<UserProgram>,
) -> (Outcome, Sim<Kernel>) {
    init_logging();
    log::info!("booting user scenario with {} program(s)", programs.len());
    mikron_kernel::run(BootConfig { machine, programs }).expect("scenario configuration rejected")
}

/// Boot only the nucleus and run each body as a kernel-mode process, in
/// order, under round-robin scheduling.
pub fn run_nucleus_scenario(
    machine: MachineConfig,
    bodies: Vec<UserProgram>,
) -> (Outcome, Sim<Kernel>) {
    init_logging();
    mikron_machine::boot(
        machine,
        Kernel::new(),
        Box::new(move |cpu: &mut Kcpu| {
            instantiator::install_vectors(cpu);
            bios::ldit(cpu, CLOCK_INTERVAL);
            for body in bodies {
                let ctx = cpu.spawn_context(body);
                let state = kernel_body_state(cpu, ctx);
                let sim = cpu.sim();
                let pid = sim.kernel.nucleus.pcbs.alloc().expect("PCB pool exhausted at boot");
                sim.kernel.nucleus.pcbs.get_mut(pid).state = state;
                let nucleus = &mut sim.kernel.nucleus;
                let mut ready = nucleus.ready;
                nucleus.pcbs.insert_proc_q(&mut ready, pid);
                nucleus.ready = ready;
                nucleus.process_count += 1;
            }
            scheduler::switch_process(cpu)
        }),
    )
}

fn kernel_body_state(cpu: &mut Kcpu, ctx: u32) -> ProcessorState {
    let ram_top = cpu.sim().hw.ram.top();
    let mut state = ProcessorState {
        ctx,
        ..ProcessorState::default()
    };
    state.pc = TEST_BODY_PC;
    state.regs[R_T9] = TEST_BODY_PC;
    state.regs[R_SP] = ram_top;
    state.status = Status::IEP | Status::IM_ALL | Status::TE;
    state
}

/// From inside a kernel-mode body: SYS1 a child running `body`. `slot`
/// must be unique per concurrent creation (it names a staging area for
/// the handed-over state).
pub fn create_child(cpu: &mut Kcpu, slot: u32, body: UserProgram) -> Result<u32, Killed> {
    let ctx = cpu.spawn_context(body);
    let state = kernel_body_state(cpu, ctx);
    let staging = STATE_STAGING_BASE + (16 + slot) * STATE_SIZE;
    cpu.sim().hw.write_state(staging, &state);
    cpu.syscall(sysno::CREATE, staging, 0, 0)
}
