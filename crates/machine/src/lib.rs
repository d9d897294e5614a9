//! A simulated MIPS-like machine with a software-managed TLB,
//! memory-mapped device registers and a BIOS-reserved exception page.
//!
//! The crate models the hardware a small educational kernel runs on:
//! one processor, RAM, five peripheral interrupt lines of eight devices
//! each (terminals split into receiver and transmitter halves), a
//! processor-local timer, a system-wide interval timer, and the BIOS
//! service primitives (`LDST`, `LDCXT`, `WAIT`, `HALT`, `PANIC`).
//!
//! Simulated time is discrete: it advances while a context computes or
//! the processor waits, and device commands complete after fixed
//! latencies. The kernel under test supplies exception handlers through
//! the pass-up vector and drives everything else.

pub mod bus;
pub mod devices;
pub mod hw;
pub mod layout;
pub mod runtime;
pub mod state;
pub mod tlb;

pub use crate::devices::{DiskGeometry, MachineConfig};
pub use crate::hw::{Hw, PassUpVector};
pub use crate::layout::{DevField, SubDev};
pub use crate::runtime::{boot, Body, Cpu, CtxId, Handler, Killed, Outcome, Run, Sim};
pub use crate::state::{ProcessorState, Status};
pub use crate::tlb::{Tlb, TlbEntry, TlbFault};
