//! The machine proper: one processor, RAM, TLB, timers and peripherals,
//! advanced over simulated microseconds.
//!
//! Time only moves when the running context computes or the processor
//! waits for an interrupt. Device completions are queued as timed events;
//! firing one latches the device status and its interrupt bit. Delivery of
//! a pending interrupt is a separate, Status-gated step so that kernel
//! critical sections with interrupts disabled really are atomic.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::bus::Ram;
use crate::devices::{Devices, MachineConfig};
use crate::layout::*;
use crate::state::ProcessorState;
use crate::tlb::Tlb;

/// The BIOS-reserved pass-up structure: where the processor vectors on a
/// TLB-refill event and on every other exception.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassUpVector {
    pub refill_pc: u32,
    pub refill_sp: u32,
    pub exception_pc: u32,
    pub exception_sp: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Event {
    time: u64,
    seq: u64,
    line: u32,
    dev: usize,
    sub: SubDev,
}

#[derive(Debug)]
pub struct Hw {
    /// Live register state of the (single) processor.
    pub cpu: ProcessorState,
    /// Exception state saved by the BIOS on the reserved page.
    pub bios_state: ProcessorState,
    pub passup: PassUpVector,
    pub tlb: Tlb,
    pub ram: Ram,
    pub devices: Devices,
    now: u64,
    /// Absolute processor-local-timer deadline; `u64::MAX` means never.
    plt_deadline: u64,
    /// Absolute interval-timer deadline; pending once reached, until reloaded.
    interval_deadline: u64,
    events: BinaryHeap<Reverse<Event>>,
    seq: u64,
}

impl Hw {
    pub fn new(config: &MachineConfig) -> Self {
        Self {
            cpu: ProcessorState::default(),
            bios_state: ProcessorState::default(),
            passup: PassUpVector::default(),
            tlb: Tlb::new(),
            ram: Ram::new(config.ram_size),
            devices: Devices::new(config),
            now: 0,
            plt_deadline: u64::MAX,
            interval_deadline: u64::MAX,
            events: BinaryHeap::new(),
            seq: 0,
        }
    }

    /// Time-of-day clock, microseconds since power-on.
    pub fn tod(&self) -> u64 {
        self.now
    }

    /// Load the processor local timer with `us` microseconds.
    pub fn set_timer(&mut self, us: u32) {
        self.plt_deadline = if us == TIMER_NEVER {
            u64::MAX
        } else {
            self.now + us as u64
        };
    }

    /// Remaining microseconds on the processor local timer.
    pub fn get_timer(&self) -> u32 {
        if self.plt_deadline == u64::MAX {
            TIMER_NEVER
        } else {
            self.plt_deadline.saturating_sub(self.now).min(u32::MAX as u64) as u32
        }
    }

    /// Load the system-wide interval timer; also clears its pending state.
    pub fn load_interval_timer(&mut self, us: u64) {
        self.interval_deadline = self.now + us;
    }

    /// Device register read.
    pub fn dev_read(&self, line: u32, dev: usize, field: DevField) -> u32 {
        self.devices.read(line, dev, field)
    }

    /// Device register write; command writes schedule their completion.
    pub fn dev_write(&mut self, line: u32, dev: usize, field: DevField, value: u32) {
        if let Some(sched) = self.devices.write(line, dev, field, value) {
            self.seq += 1;
            self.events.push(Reverse(Event {
                time: self.now + sched.latency,
                seq: self.seq,
                line: sched.line,
                dev: sched.dev,
                sub: sched.sub,
            }));
        }
    }

    /// Interrupt-devices bitmap for a peripheral line.
    pub fn interrupt_bitmap(&self, line: u32) -> u32 {
        self.devices.bitmap(line)
    }

    /// Bitmap of interrupt lines pending right now, regardless of masking.
    pub fn pending_lines(&self) -> u32 {
        let mut lines = 0;
        if self.cpu.status.timer_on() && self.now >= self.plt_deadline {
            lines |= 1 << PLT_LINE;
        }
        if self.now >= self.interval_deadline {
            lines |= 1 << INTERVAL_LINE;
        }
        for line in DISK_LINE..=TERM_LINE {
            if self.devices.bitmap(line) != 0 {
                lines |= 1 << line;
            }
        }
        lines
    }

    /// Highest-priority pending line the current Status accepts, if any.
    pub fn deliverable_line(&self) -> Option<u32> {
        if !self.cpu.status.interrupts_on() {
            return None;
        }
        let pending = self.pending_lines();
        (PLT_LINE..=TERM_LINE).find(|&line| {
            pending & (1 << line) != 0 && self.cpu.status.line_unmasked(line)
        })
    }

    /// Next instant at which machine state changes on its own: the earliest
    /// queued completion or an armed timer still in the future.
    pub fn next_wake(&self) -> Option<u64> {
        let mut wake: Option<u64> = self.events.peek().map(|Reverse(e)| e.time);
        for deadline in [self.plt_deadline, self.interval_deadline] {
            if deadline != u64::MAX && deadline > self.now {
                wake = Some(wake.map_or(deadline, |w| w.min(deadline)));
            }
        }
        wake
    }

    /// Advance the clock. Completions are fired separately via `fire_due`.
    pub fn advance_to(&mut self, instant: u64) {
        debug_assert!(instant >= self.now);
        self.now = instant;
    }

    /// Fire every completion whose time has come.
    pub fn fire_due(&mut self) {
        while let Some(Reverse(event)) = self.events.peek().copied().filter(|Reverse(e)| e.time <= self.now) {
            self.events.pop();
            self.devices.complete(event.line, event.dev, event.sub, &mut self.ram);
        }
    }

    /// Read a saved state serialized at a physical RAM address.
    pub fn read_state(&self, addr: u32) -> ProcessorState {
        let mut words = [0u32; crate::state::STATE_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.ram.read_u32(addr + (i as u32) * WORD_LEN);
        }
        ProcessorState::from_words(&words)
    }

    /// Serialize a saved state to a physical RAM address.
    pub fn write_state(&mut self, addr: u32, state: &ProcessorState) {
        for (i, word) in state.to_words().iter().enumerate() {
            self.ram.write_u32(addr + (i as u32) * WORD_LEN, *word);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Status;

    #[test]
    fn timers_pend_once_reached() {
        let mut hw = Hw::new(&MachineConfig::default());
        hw.cpu.status = Status::IEC | Status::IM_ALL | Status::TE;
        hw.set_timer(5_000);
        hw.load_interval_timer(CLOCK_INTERVAL);
        assert_eq!(hw.deliverable_line(), None);
        assert_eq!(hw.next_wake(), Some(5_000));

        hw.advance_to(5_000);
        assert_eq!(hw.deliverable_line(), Some(PLT_LINE));

        // Reloading the PLT clears it; the interval timer is still armed.
        hw.set_timer(TIMER_NEVER);
        assert_eq!(hw.deliverable_line(), None);
        hw.advance_to(CLOCK_INTERVAL);
        assert_eq!(hw.deliverable_line(), Some(INTERVAL_LINE));
        hw.load_interval_timer(CLOCK_INTERVAL);
        assert_eq!(hw.deliverable_line(), None);
    }

    #[test]
    fn masked_interrupts_do_not_deliver() {
        let mut hw = Hw::new(&MachineConfig::default());
        hw.cpu.status = Status::IM_ALL | Status::TE;
        hw.set_timer(100);
        hw.advance_to(200);
        assert!(hw.pending_lines() & (1 << PLT_LINE) != 0);
        assert_eq!(hw.deliverable_line(), None);
        hw.cpu.status |= Status::IEC;
        assert_eq!(hw.deliverable_line(), Some(PLT_LINE));
    }

    #[test]
    fn device_completion_fires_at_latency() {
        let mut hw = Hw::new(&MachineConfig::default());
        hw.cpu.status = Status::IEC | Status::IM_ALL;
        hw.dev_write(PRINTER_LINE, 0, DevField::Data0, b'!' as u32);
        hw.dev_write(PRINTER_LINE, 0, DevField::Command, CMD_PRINT_CHR);
        let wake = hw.next_wake().expect("completion queued");
        assert_eq!(wake, PRINTER_LATENCY);
        hw.advance_to(wake);
        hw.fire_due();
        assert_eq!(hw.interrupt_bitmap(PRINTER_LINE), 1);
        assert_eq!(hw.deliverable_line(), Some(PRINTER_LINE));
    }

    #[test]
    fn line_priority_orders_delivery() {
        let mut hw = Hw::new(&MachineConfig::default());
        hw.cpu.status = Status::IEC | Status::IM_ALL;
        hw.dev_write(TERM_LINE, 0, DevField::Command, CMD_RECEIVE);
        hw.dev_write(DISK_LINE, 0, DevField::Command, (1 << 8) | CMD_DISK_SEEK);
        hw.advance_to(DISK_LATENCY.max(TERM_LATENCY));
        hw.fire_due();
        assert_eq!(hw.deliverable_line(), Some(DISK_LINE));
    }

    #[test]
    fn state_ram_round_trip() {
        let mut hw = Hw::new(&MachineConfig::default());
        let mut st = ProcessorState::default();
        st.pc = TEXT_AREA_START;
        st.ctx = 3;
        st.regs[crate::state::R_SP] = STACK_TOP;
        hw.write_state(RAM_START + 0x8000, &st);
        assert_eq!(hw.read_state(RAM_START + 0x8000), st);
    }
}
