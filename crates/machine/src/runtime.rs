//! Execution contexts and the BIOS service primitives.
//!
//! The simulation gives every process body its own host thread, but the
//! machine has exactly one processor: a single `running` context owns it,
//! everyone else is parked on the shared condition variable. `LDST` to
//! another context hands the processor over and parks the caller; `LDST`
//! to the caller's own context simply returns the state up the call chain
//! to the point that trapped. This keeps kernel code in direct style: a
//! blocking semaphore operation parks deep inside the handler and resumes
//! exactly there when the context is dispatched again.
//!
//! Terminating a context marks it killed; its thread unwinds through the
//! [`Killed`] error without touching shared state. `HALT` and `PANIC`
//! record the outcome and unwind every context the same way.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use log::{debug, trace, warn};
use thiserror::Error;

use crate::devices::MachineConfig;
use crate::hw::Hw;
use crate::layout::*;
use crate::state::*;
use crate::tlb::TlbFault;

/// Execution-context handle, carried inside every [`ProcessorState`].
pub type CtxId = u32;

/// The context was terminated (or the machine shut down) while it was
/// suspended; its host thread unwinds without touching shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("execution context terminated")]
pub struct Killed;

/// The state a context resumes with, or [`Killed`]. Every kernel path
/// that can suspend the calling context has this shape.
pub type Run = Result<ProcessorState, Killed>;

/// An exception handler registered for a text address; `LDCXT` and the
/// pass-up vector resolve program counters through this table.
pub type Handler<K> = for<'a, 'b> fn(&'a mut Cpu<'b, K>) -> Run;

/// A process body: the simulated program a context executes.
pub type Body<K> = Box<dyn for<'a, 'b> FnOnce(&'a mut Cpu<'b, K>) -> Run + Send + 'static>;

/// How the machine came down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Orderly shutdown: the kernel executed HALT.
    Halt,
    /// The kernel executed PANIC with the given diagnostic.
    Panic(String),
}

struct CtxSlot<K> {
    body: Option<Body<K>>,
    /// State to install when this context next runs.
    incoming: Option<ProcessorState>,
    killed: bool,
    started: bool,
}

struct Runtime<K> {
    running: CtxId,
    shutdown: Option<Outcome>,
    ctxs: Vec<CtxSlot<K>>,
    handlers: HashMap<u32, Handler<K>>,
}

impl<K> Default for Runtime<K> {
    fn default() -> Self {
        Self {
            running: 0,
            shutdown: None,
            ctxs: Vec::new(),
            handlers: HashMap::new(),
        }
    }
}

impl<K> Runtime<K> {
    fn alloc(&mut self, body: Option<Body<K>>) -> CtxId {
        let id = self.ctxs.len() as CtxId;
        self.ctxs.push(CtxSlot {
            body,
            incoming: None,
            killed: false,
            started: false,
        });
        id
    }
}

/// Everything behind the machine's single lock: the kernel payload, the
/// hardware, and the context table.
pub struct Sim<K> {
    pub kernel: K,
    pub hw: Hw,
    rt: Runtime<K>,
}

impl<K> Sim<K> {
    /// Register an exception-handler entry point under a text address.
    pub fn register_handler(&mut self, pc: u32, handler: Handler<K>) {
        self.rt.handlers.insert(pc, handler);
    }
}

pub struct Machine<K> {
    sim: Mutex<Sim<K>>,
    cv: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Power the machine on, run `boot` as the first execution context, and
/// block until the kernel halts or panics. Returns the outcome together
/// with the final machine state for inspection.
pub fn boot<K: Send + 'static>(config: MachineConfig, kernel: K, boot_body: Body<K>) -> (Outcome, Sim<K>) {
    let machine = Arc::new(Machine {
        sim: Mutex::new(Sim {
            kernel,
            hw: Hw::new(&config),
            rt: Runtime::default(),
        }),
        cv: Condvar::new(),
        threads: Mutex::new(Vec::new()),
    });

    {
        let mut sim = lock(&machine.sim);
        let ctx = sim.rt.alloc(Some(boot_body));
        let mut state = ProcessorState {
            ctx,
            ..ProcessorState::default()
        };
        state.regs[R_SP] = NUCLEUS_STACK;
        sim.rt.ctxs[ctx as usize].incoming = Some(state);
        sim.rt.ctxs[ctx as usize].started = true;
        sim.rt.running = ctx;
    }
    spawn_context_thread(&machine, 0);
    machine.cv.notify_all();

    let outcome = {
        let mut sim = lock(&machine.sim);
        while sim.rt.shutdown.is_none() {
            sim = machine.cv.wait(sim).expect("simulation lock poisoned");
        }
        sim.rt.shutdown.clone().unwrap()
    };
    machine.cv.notify_all();

    let handles = std::mem::take(&mut *lock(&machine.threads));
    for handle in handles {
        let _ = handle.join();
    }
    let machine = match Arc::try_unwrap(machine) {
        Ok(machine) => machine,
        Err(_) => unreachable!("all simulation threads have exited"),
    };
    let sim = machine.sim.into_inner().expect("simulation lock poisoned");
    (outcome, sim)
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().expect("simulation lock poisoned")
}

fn spawn_context_thread<K: Send + 'static>(machine: &Arc<Machine<K>>, ctx: CtxId) {
    let m = Arc::clone(machine);
    let handle = std::thread::Builder::new()
        .name(format!("ctx-{ctx}"))
        .spawn(move || {
            let mut cpu = Cpu::attach(&m, ctx);
            if cpu.park_until_running().is_err() {
                return;
            }
            let body = cpu
                .sim()
                .rt
                .ctxs[ctx as usize]
                .body
                .take()
                .expect("context body already taken");
            match body(&mut cpu) {
                Ok(_) => warn!("context {ctx} body returned without terminating"),
                Err(Killed) => trace!("context {ctx} unwound"),
            }
        })
        .expect("failed to spawn context thread");
    lock(&machine.threads).push(handle);
}

/// The processor as seen by the running context: a session that owns the
/// machine lock and releases it only while parked.
pub struct Cpu<'m, K> {
    m: &'m Arc<Machine<K>>,
    pub ctx: CtxId,
    guard: Option<MutexGuard<'m, Sim<K>>>,
}

impl<'m, K: Send + 'static> Cpu<'m, K> {
    fn attach(machine: &'m Arc<Machine<K>>, ctx: CtxId) -> Self {
        Self {
            m: machine,
            ctx,
            guard: Some(lock(&machine.sim)),
        }
    }

    /// Access the shared machine + kernel state.
    pub fn sim(&mut self) -> &mut Sim<K> {
        self.guard.as_mut().expect("processor session not held")
    }

    /// Park this context until it is dispatched again (or killed); on
    /// resumption install and return the state it was dispatched with.
    fn park_until_running(&mut self) -> Run {
        let mut g = self.guard.take().expect("processor session not held");
        loop {
            if g.rt.shutdown.is_some() || g.rt.ctxs[self.ctx as usize].killed {
                self.guard = Some(g);
                return Err(Killed);
            }
            if g.rt.running == self.ctx {
                break;
            }
            g = self.m.cv.wait(g).expect("simulation lock poisoned");
        }
        let state = g.rt.ctxs[self.ctx as usize]
            .incoming
            .take()
            .expect("context dispatched without a state");
        g.hw.cpu = state.clone();
        self.guard = Some(g);
        Ok(state)
    }

    /// BIOS `LDST`: load a saved processor state. Loading a state of this
    /// very context returns it up the call chain to the trap point; any
    /// other context gets the processor and the caller parks.
    pub fn ldst(&mut self, state: &ProcessorState) -> Run {
        let mut state = state.clone();
        state.status.pop();
        if state.ctx == self.ctx {
            self.sim().hw.cpu = state.clone();
            return Ok(state);
        }
        trace!("ldst: handoff {} -> {}", self.ctx, state.ctx);
        let target = state.ctx;
        let needs_spawn = {
            let sim = self.sim();
            let slot = &mut sim.rt.ctxs[target as usize];
            debug_assert!(!slot.killed, "LDST to a terminated context");
            slot.incoming = Some(state);
            let needs_spawn = !slot.started;
            slot.started = true;
            sim.rt.running = target;
            needs_spawn
        };
        if needs_spawn {
            spawn_context_thread(self.m, target);
        }
        self.m.cv.notify_all();
        self.park_until_running()
    }

    /// BIOS `LDCXT`: atomically switch this context to a pre-built
    /// (stack, status, pc) triple. The target PC must name a registered
    /// handler; it runs on this same context.
    pub fn ldcxt(&mut self, stack_ptr: u32, status: u32, pc: u32) -> Run {
        let handler = {
            let sim = self.sim();
            let mut state = sim.hw.cpu.clone();
            state.regs[R_SP] = stack_ptr;
            state.status = Status::from_bits_retain(status);
            state.status.pop();
            state.pc = pc;
            sim.hw.cpu = state;
            *sim
                .rt
                .handlers
                .get(&pc)
                .unwrap_or_else(|| panic!("LDCXT to unregistered text address {pc:#x}"))
        };
        handler(self)
    }

    /// Create a fresh execution context for `body`. Its thread starts on
    /// first dispatch.
    pub fn spawn_context(&mut self, body: Body<K>) -> CtxId {
        self.sim().rt.alloc(Some(body))
    }

    /// Mark a context terminated. If its thread is parked it unwinds; it
    /// is never dispatched again.
    pub fn kill_context(&mut self, ctx: CtxId) {
        self.sim().rt.ctxs[ctx as usize].killed = true;
        self.m.cv.notify_all();
    }

    /// BIOS `HALT`: orderly shutdown.
    pub fn halt(&mut self) -> Run {
        debug!("HALT");
        self.shutdown(Outcome::Halt)
    }

    /// BIOS `PANIC`: emergency stop with a diagnostic.
    pub fn bios_panic(&mut self, msg: &str) -> Run {
        warn!("PANIC: {msg}");
        self.shutdown(Outcome::Panic(msg.to_string()))
    }

    fn shutdown(&mut self, outcome: Outcome) -> Run {
        let sim = self.sim();
        if sim.rt.shutdown.is_none() {
            sim.rt.shutdown = Some(outcome);
        }
        self.m.cv.notify_all();
        Err(Killed)
    }

    // ---- exception entry ----

    /// Raise an exception from the current processor state: push the
    /// status stack, save the state on the BIOS page, and vector to the
    /// registered handler. Returns the state this context resumes with.
    fn raise(&mut self, mut state: ProcessorState, exc: u32, refill: bool) -> Run {
        let handler = {
            let ctx = self.ctx;
            let sim = self.sim();
            state.cause = mk_cause(exc, sim.hw.pending_lines());
            state.status.push();
            state.ctx = ctx;
            sim.hw.cpu = state.clone();
            sim.hw.bios_state = state;
            let pc = if refill {
                sim.hw.passup.refill_pc
            } else {
                sim.hw.passup.exception_pc
            };
            *sim
                .rt
                .handlers
                .get(&pc)
                .unwrap_or_else(|| panic!("exception vector {pc:#x} not registered"))
        };
        handler(self)
    }

    /// Deliver pending, unmasked interrupts until none remain.
    fn poll_interrupts(&mut self) -> Result<(), Killed> {
        loop {
            self.sim().hw.fire_due();
            if self.sim().hw.deliverable_line().is_none() {
                return Ok(());
            }
            let state = self.sim().hw.cpu.clone();
            self.raise(state, EXC_INTERRUPT, false)?;
        }
    }

    /// Execute a SYSCALL instruction with the given argument registers.
    /// Returns the value the kernel placed in `v0`.
    pub fn syscall(&mut self, number: u32, a1: u32, a2: u32, a3: u32) -> Result<u32, Killed> {
        self.poll_interrupts()?;
        let mut state = self.sim().hw.cpu.clone();
        state.regs[R_A0] = number;
        state.regs[R_A1] = a1;
        state.regs[R_A2] = a2;
        state.regs[R_A3] = a3;
        let resumed = self.raise(state, EXC_SYSCALL, false)?;
        Ok(resumed.v0())
    }

    /// Burn `us` microseconds of CPU time, taking any interrupt that
    /// becomes deliverable along the way. Time that passes while this
    /// context is preempted does not count against the budget.
    pub fn compute(&mut self, us: u64) -> Result<(), Killed> {
        let mut remaining = us;
        loop {
            self.poll_interrupts()?;
            if remaining == 0 {
                return Ok(());
            }
            let sim = self.sim();
            let now = sim.hw.tod();
            let target = now + remaining;
            let stop = match sim.hw.next_wake() {
                Some(wake) if wake <= target => wake,
                _ => target,
            };
            sim.hw.advance_to(stop);
            remaining -= stop - now;
        }
    }

    /// BIOS `WAIT`: stall until an interrupt is pending for the current
    /// Status, firing timers and completions along the way. The interrupt
    /// is *not* taken; the saved exception state is staged on the BIOS
    /// page for the caller to dispatch.
    pub fn wait_for_interrupt(&mut self) -> Result<(), Killed> {
        loop {
            {
                let sim = self.sim();
                sim.hw.fire_due();
                if sim.hw.deliverable_line().is_some() {
                    break;
                }
            }
            let wake = self.sim().hw.next_wake();
            match wake {
                Some(wake) => self.sim().hw.advance_to(wake),
                None => {
                    self.bios_panic("WAIT with no pending timer or device operation")?;
                    unreachable!()
                }
            }
        }
        let sim = self.sim();
        let mut state = sim.hw.cpu.clone();
        state.cause = mk_cause(EXC_INTERRUPT, sim.hw.pending_lines());
        state.status.push();
        sim.hw.bios_state = state;
        Ok(())
    }

    // ---- memory access through the TLB ----

    /// Translate a virtual address in the current context, invoking the
    /// kernel's refill and fault handlers exactly as the hardware would.
    fn translate(&mut self, vaddr: u32, write: bool) -> Result<u32, Killed> {
        loop {
            if vaddr < KUSEG {
                return Ok(vaddr);
            }
            let sim = self.sim();
            let asid = sim.hw.cpu.asid();
            match sim.hw.tlb.translate(vaddr, asid, write) {
                Ok(pa) => return Ok(pa),
                Err(fault) => {
                    let mut state = sim.hw.cpu.clone();
                    // The hardware latches the faulting key in EntryHi.
                    state.entry_hi = (vaddr & VPN_MASK) | (asid << ASID_SHIFT);
                    match fault {
                        TlbFault::Refill { write } => {
                            let exc = if write { EXC_TLB_INVALID_STORE } else { EXC_TLB_INVALID_LOAD };
                            self.raise(state, exc, true)?
                        }
                        TlbFault::Invalid { write } => {
                            let exc = if write { EXC_TLB_INVALID_STORE } else { EXC_TLB_INVALID_LOAD };
                            self.raise(state, exc, false)?
                        }
                        TlbFault::Modified => self.raise(state, EXC_TLB_MOD, false)?,
                    };
                }
            }
        }
    }

    pub fn load_u8(&mut self, vaddr: u32) -> Result<u8, Killed> {
        let pa = self.translate(vaddr, false)?;
        Ok(self.sim().hw.ram.read_u8(pa))
    }

    pub fn store_u8(&mut self, vaddr: u32, value: u8) -> Result<(), Killed> {
        let pa = self.translate(vaddr, true)?;
        self.sim().hw.ram.write_u8(pa, value);
        Ok(())
    }

    pub fn load_u32(&mut self, vaddr: u32) -> Result<u32, Killed> {
        let pa = self.translate(vaddr, false)?;
        Ok(self.sim().hw.ram.read_u32(pa))
    }

    pub fn store_u32(&mut self, vaddr: u32, value: u32) -> Result<(), Killed> {
        let pa = self.translate(vaddr, true)?;
        self.sim().hw.ram.write_u32(pa, value);
        Ok(())
    }
}
