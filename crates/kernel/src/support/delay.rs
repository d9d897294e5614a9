//! The delay facility: a sorted Active Delay List of wake times and the
//! daemon that drains it on pseudo-clock ticks.
//!
//! SYS18 inserts a descriptor and then releases the ADL mutex and sleeps
//! on the caller's private semaphore atomically. Without that, the daemon
//! could tick between the two, V a semaphore nobody is sleeping on yet,
//! and leave the caller asleep forever.

use log::{trace, warn};
use mikron_machine::layout::{ADL_SEM_ADDR, PAGE_SIZE};
use mikron_machine::state::{Status, R_SP, R_T9};
use mikron_machine::{Killed, ProcessorState, Run};

use crate::bios::{self, Kcpu, DELAY_DAEMON_PC, STATE_STAGING_BASE};
use crate::error::KernelError;
use crate::support::{self, syscalls, GENERAL_EXCEPT, UPROC_MAX};
use crate::sysno;

/// Fixed capacity of the delay descriptor pool.
pub const DELAY_CAPACITY: usize = UPROC_MAX;

/// Microseconds per requested second of delay.
const US_PER_SECOND: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, Default)]
struct DelayNode {
    /// Absolute wake time, microseconds since boot.
    wake_time: u64,
    /// ASID whose private semaphore gets the wake-up V.
    asid: u32,
    next: Option<usize>,
}

/// The Active Delay List: a free pool and an active list sorted by
/// ascending wake time.
#[derive(Debug)]
pub struct Adl {
    nodes: [DelayNode; DELAY_CAPACITY],
    free_head: Option<usize>,
    active_head: Option<usize>,
}

impl Default for Adl {
    fn default() -> Self {
        Self::new()
    }
}

impl Adl {
    pub fn new() -> Self {
        let mut adl = Self {
            nodes: [DelayNode::default(); DELAY_CAPACITY],
            free_head: None,
            active_head: None,
        };
        adl.reset();
        adl
    }

    /// Rebuild the free list and empty the active list.
    pub fn reset(&mut self) {
        self.free_head = None;
        self.active_head = None;
        for index in (0..DELAY_CAPACITY).rev() {
            self.nodes[index] = DelayNode {
                next: self.free_head,
                ..DelayNode::default()
            };
            self.free_head = Some(index);
        }
    }

    /// Allocate a descriptor and insert it in wake-time order.
    pub fn insert(&mut self, wake_time: u64, asid: u32) -> Result<(), KernelError> {
        let node = self.free_head.ok_or(KernelError::DelayExhausted)?;
        self.free_head = self.nodes[node].next;
        self.nodes[node] = DelayNode {
            wake_time,
            asid,
            next: None,
        };
        // Walk to the first entry with a later wake time.
        let mut prev: Option<usize> = None;
        let mut cursor = self.active_head;
        while let Some(current) = cursor {
            if self.nodes[current].wake_time > wake_time {
                break;
            }
            prev = Some(current);
            cursor = self.nodes[current].next;
        }
        self.nodes[node].next = cursor;
        match prev {
            None => self.active_head = Some(node),
            Some(prev) => self.nodes[prev].next = Some(node),
        }
        Ok(())
    }

    /// Pop the head descriptor if its wake time has passed, returning the
    /// ASID to wake.
    pub fn pop_expired(&mut self, now: u64) -> Option<u32> {
        let head = self.active_head?;
        if self.nodes[head].wake_time > now {
            return None;
        }
        self.active_head = self.nodes[head].next;
        let asid = self.nodes[head].asid;
        self.nodes[head] = DelayNode {
            next: self.free_head,
            ..DelayNode::default()
        };
        self.free_head = Some(head);
        Some(asid)
    }

    /// Earliest pending wake time, if any.
    pub fn next_wake(&self) -> Option<u64> {
        self.active_head.map(|head| self.nodes[head].wake_time)
    }
}

/// Build the ADL and launch the delay daemon as a kernel-ASID process.
/// Called once, by the instantiator.
pub fn init_adl(cpu: &mut Kcpu) -> Result<(), Killed> {
    cpu.sim().kernel.support.adl.reset();
    bios::sem_write(cpu, ADL_SEM_ADDR, 1);

    let ram_top = cpu.sim().hw.ram.top();
    let ctx = cpu.spawn_context(Box::new(daemon_body));
    let mut state = ProcessorState {
        ctx,
        ..ProcessorState::default()
    };
    state.pc = DELAY_DAEMON_PC;
    state.regs[R_T9] = DELAY_DAEMON_PC;
    // The last frame of RAM belongs to the instantiator's stack; the
    // daemon takes the one below it.
    state.regs[R_SP] = ram_top - PAGE_SIZE;
    state.status = Status::IEP | Status::IM_ALL | Status::TE;
    let staging = STATE_STAGING_BASE;
    cpu.sim().hw.write_state(staging, &state);
    let result = cpu.syscall(sysno::CREATE, staging, 0, 0)?;
    if result != 0 {
        warn!("delay daemon creation failed");
    }
    Ok(())
}

/// SYS18: put the calling user process to sleep for `seconds`.
pub fn delay_syscall(cpu: &mut Kcpu, asid: u32, seconds: i32) -> Run {
    if seconds < 0 {
        return syscalls::terminate_uproc(cpu, None);
    }
    support::p(cpu, ADL_SEM_ADDR)?;
    let now = bios::stck(cpu);
    let wake_time = now + seconds as u64 * US_PER_SECOND;
    let inserted = cpu.sim().kernel.support.adl.insert(wake_time, asid);
    if inserted.is_err() {
        // Release the list before dying so nobody else wedges on it.
        return syscalls::terminate_uproc(cpu, Some(ADL_SEM_ADDR));
    }
    trace!("asid {asid} sleeping until {wake_time}");

    // Atomically release the ADL and sleep on the private semaphore.
    let private = cpu.sim().kernel.support.supports[asid as usize].delay_sem_addr;
    bios::disable_interrupts(cpu);
    support::v(cpu, ADL_SEM_ADDR)?;
    support::p(cpu, private)?;
    bios::enable_interrupts(cpu);

    let state = cpu.sim().kernel.support.supports[asid as usize].except_state[GENERAL_EXCEPT].clone();
    cpu.ldst(&state)
}

/// The delay daemon: wait a pseudo-clock tick, wake everything whose
/// time has passed, repeat.
pub fn daemon_body(cpu: &mut Kcpu) -> Run {
    loop {
        cpu.syscall(sysno::WAIT_CLOCK, 0, 0, 0)?;
        support::p(cpu, ADL_SEM_ADDR)?;
        let now = bios::stck(cpu);
        loop {
            let expired = cpu.sim().kernel.support.adl.pop_expired(now);
            match expired {
                Some(asid) => {
                    trace!("delay daemon waking asid {asid}");
                    let sem = cpu.sim().kernel.support.supports[asid as usize].delay_sem_addr;
                    support::v(cpu, sem)?;
                }
                None => break,
            }
        }
        support::v(cpu, ADL_SEM_ADDR)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserts_stay_sorted_and_pop_in_order() {
        let mut adl = Adl::new();
        adl.insert(3_000_000, 1).unwrap();
        adl.insert(1_000_000, 2).unwrap();
        adl.insert(2_000_000, 3).unwrap();
        assert_eq!(adl.next_wake(), Some(1_000_000));
        assert_eq!(adl.pop_expired(2_500_000), Some(2));
        assert_eq!(adl.pop_expired(2_500_000), Some(3));
        // Head not yet due.
        assert_eq!(adl.pop_expired(2_500_000), None);
        assert_eq!(adl.pop_expired(3_000_000), Some(1));
        assert_eq!(adl.next_wake(), None);
    }

    #[test]
    fn equal_wake_times_keep_insertion_order() {
        let mut adl = Adl::new();
        adl.insert(500, 1).unwrap();
        adl.insert(500, 2).unwrap();
        assert_eq!(adl.pop_expired(500), Some(1));
        assert_eq!(adl.pop_expired(500), Some(2));
    }

    #[test]
    fn pool_exhaustion_is_reported_and_recoverable() {
        let mut adl = Adl::new();
        for asid in 0..DELAY_CAPACITY as u32 {
            adl.insert(1_000, asid).unwrap();
        }
        assert_eq!(adl.insert(1_000, 99), Err(KernelError::DelayExhausted));
        assert!(adl.pop_expired(1_000).is_some());
        assert!(adl.insert(1_000, 99).is_ok());
    }
}
