//! Peripheral device models: register files, interrupt latching, and the
//! timed command semantics behind them.
//!
//! Every device exposes the four-word register layout (status, command,
//! data0, data1); terminals overlay a receiver half on words 0/1 and a
//! transmitter half on words 2/3. Writing a command latches BUSY and
//! produces a completion that the machine fires after a per-class latency:
//! the completion stores the result status, sets the device's bit in the
//! line's interrupt bitmap, and leaves it there until the kernel ACKs.

use std::collections::VecDeque;

use log::warn;

use crate::bus::Ram;
use crate::layout::*;

/// Disk geometry: cylinders, heads, sectors per track.
#[derive(Debug, Clone, Copy)]
pub struct DiskGeometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors: u32,
}

impl Default for DiskGeometry {
    fn default() -> Self {
        Self {
            cylinders: 32,
            heads: 2,
            sectors: 8,
        }
    }
}

impl DiskGeometry {
    pub fn word(&self) -> u32 {
        (self.cylinders << 16) | (self.heads << 8) | self.sectors
    }

    pub fn total_sectors(&self) -> u32 {
        self.cylinders * self.heads * self.sectors
    }
}

/// Hardware configuration chosen at power-on.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub ram_size: u32,
    pub disk_geometry: DiskGeometry,
    /// Blocks per flash device; user block I/O may use `[32, flash_blocks)`.
    pub flash_blocks: u32,
    /// Initial input scripts per terminal.
    pub term_inputs: Vec<(usize, Vec<u8>)>,
    /// Pre-loaded flash images: (device, block, bytes).
    pub flash_images: Vec<(usize, u32, Vec<u8>)>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_size: DEFAULT_RAM_SIZE,
            disk_geometry: DiskGeometry::default(),
            flash_blocks: 128,
            term_inputs: Vec::new(),
            flash_images: Vec::new(),
        }
    }
}

/// An operation accepted by a device and waiting for its completion time.
#[derive(Debug, Clone, Copy)]
enum PendingOp {
    PrintChar(u8),
    TermTransmit(u8),
    TermReceive,
    Flash { block: u32, write: bool },
    DiskSeek { cylinder: u32 },
    DiskXfer { head: u32, sector: u32, write: bool },
}

impl PendingOp {
    fn latency(&self) -> u64 {
        match self {
            PendingOp::PrintChar(_) => PRINTER_LATENCY,
            PendingOp::TermTransmit(_) | PendingOp::TermReceive => TERM_LATENCY,
            PendingOp::Flash { .. } => FLASH_LATENCY,
            PendingOp::DiskSeek { .. } | PendingOp::DiskXfer { .. } => DISK_LATENCY,
        }
    }
}

/// A completion the machine should fire `latency` microseconds from now.
#[derive(Debug, Clone, Copy)]
pub struct Scheduled {
    pub line: u32,
    pub dev: usize,
    pub sub: SubDev,
    pub latency: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct SubState {
    pending: Option<PendingOp>,
    /// Completed and not yet acknowledged.
    done: bool,
}

#[derive(Debug)]
pub struct Devices {
    /// Register words per (line-3, device, field).
    regs: [[[u32; 4]; DEV_PER_LINE as usize]; DEV_LINE_COUNT as usize],
    subs: [[[SubState; 2]; DEV_PER_LINE as usize]; DEV_LINE_COUNT as usize],
    disk_geometry: DiskGeometry,
    disks: Vec<Vec<u8>>,
    /// Current head position per disk, set by the last completed seek.
    disk_cylinder: [u32; DEV_PER_LINE as usize],
    flash_blocks: u32,
    flashes: Vec<Vec<u8>>,
    term_inputs: Vec<VecDeque<u8>>,
    term_outputs: Vec<Vec<u8>>,
    printer_outputs: Vec<Vec<u8>>,
}

fn line_index(line: u32) -> usize {
    debug_assert!((DISK_LINE..=TERM_LINE).contains(&line));
    (line - DISK_LINE) as usize
}

fn sub_index(sub: SubDev) -> usize {
    match sub {
        SubDev::Receive => 0,
        SubDev::Transmit => 1,
    }
}

impl Devices {
    pub fn new(config: &MachineConfig) -> Self {
        let geometry = config.disk_geometry;
        let disk_size = (geometry.total_sectors() * PAGE_SIZE) as usize;
        let flash_size = (config.flash_blocks * PAGE_SIZE) as usize;
        let mut devices = Self {
            regs: [[[0; 4]; DEV_PER_LINE as usize]; DEV_LINE_COUNT as usize],
            subs: [[[SubState::default(); 2]; DEV_PER_LINE as usize]; DEV_LINE_COUNT as usize],
            disk_geometry: geometry,
            disks: (0..DEV_PER_LINE).map(|_| vec![0; disk_size]).collect(),
            disk_cylinder: [0; DEV_PER_LINE as usize],
            flash_blocks: config.flash_blocks,
            flashes: (0..DEV_PER_LINE).map(|_| vec![0; flash_size]).collect(),
            term_inputs: (0..DEV_PER_LINE).map(|_| VecDeque::new()).collect(),
            term_outputs: (0..DEV_PER_LINE).map(|_| Vec::new()).collect(),
            printer_outputs: (0..DEV_PER_LINE).map(|_| Vec::new()).collect(),
        };

        for line in DISK_LINE..=TERM_LINE {
            for dev in 0..DEV_PER_LINE as usize {
                let regs = &mut devices.regs[line_index(line)][dev];
                match line {
                    NET_LINE => regs[0] = STATUS_UNINSTALLED,
                    DISK_LINE => {
                        regs[0] = STATUS_READY;
                        regs[3] = geometry.word();
                    }
                    FLASH_LINE => {
                        regs[0] = STATUS_READY;
                        regs[3] = config.flash_blocks;
                    }
                    TERM_LINE => {
                        // Both halves start ready.
                        regs[0] = STATUS_READY;
                        regs[2] = STATUS_READY;
                    }
                    _ => regs[0] = STATUS_READY,
                }
            }
        }
        for (dev, input) in &config.term_inputs {
            devices.term_inputs[*dev] = input.iter().copied().collect();
        }
        for (dev, block, bytes) in &config.flash_images {
            let start = (*block * PAGE_SIZE) as usize;
            devices.flashes[*dev][start..start + bytes.len()].copy_from_slice(bytes);
        }
        devices
    }

    /// Raw register read.
    pub fn read(&self, line: u32, dev: usize, field: DevField) -> u32 {
        self.regs[line_index(line)][dev][field_index(field)]
    }

    /// Interrupt-devices bitmap for a line: bit `d` set while device `d`
    /// has an unacknowledged completion on either sub-device.
    pub fn bitmap(&self, line: u32) -> u32 {
        let li = line_index(line);
        let mut bits = 0;
        for dev in 0..DEV_PER_LINE as usize {
            if self.subs[li][dev].iter().any(|s| s.done) {
                bits |= 1 << dev;
            }
        }
        bits
    }

    /// True while any device on any line has an unacknowledged completion.
    pub fn any_pending(&self) -> bool {
        (DISK_LINE..=TERM_LINE).any(|line| self.bitmap(line) != 0)
    }

    /// Register write. Command writes may accept an operation; the caller
    /// schedules the returned completion.
    pub fn write(&mut self, line: u32, dev: usize, field: DevField, value: u32) -> Option<Scheduled> {
        let li = line_index(line);
        match (line, field) {
            (TERM_LINE, DevField::Command) => self.command(line, dev, SubDev::Receive, value),
            (TERM_LINE, DevField::Data1) => self.command(line, dev, SubDev::Transmit, value),
            (TERM_LINE, _) => {
                warn!("write to read-only terminal status register ignored");
                None
            }
            (_, DevField::Command) => self.command(line, dev, SubDev::Receive, value),
            (_, DevField::Data0) | (_, DevField::Data1) => {
                self.regs[li][dev][field_index(field)] = value;
                None
            }
            (_, DevField::Status) => {
                warn!("write to read-only status register ignored");
                None
            }
        }
    }

    fn command(&mut self, line: u32, dev: usize, sub: SubDev, value: u32) -> Option<Scheduled> {
        if line == NET_LINE {
            return None;
        }
        let li = line_index(line);
        let si = sub_index(sub);
        let command_field = if line == TERM_LINE && sub == SubDev::Transmit { 3 } else { 1 };
        self.regs[li][dev][command_field] = value;

        if value == CMD_ACK || value == CMD_RESET {
            self.subs[li][dev][si].done = false;
            self.subs[li][dev][si].pending = None;
            self.set_status(line, dev, sub, STATUS_READY);
            return None;
        }

        let op = match line {
            PRINTER_LINE if value == CMD_PRINT_CHR => {
                PendingOp::PrintChar((self.regs[li][dev][2] & 0xFF) as u8)
            }
            TERM_LINE if sub == SubDev::Receive && value == CMD_RECEIVE => PendingOp::TermReceive,
            TERM_LINE if sub == SubDev::Transmit && value & 0xFF == CMD_TRANSMIT => {
                PendingOp::TermTransmit(((value >> TERM_CHAR_SHIFT) & 0xFF) as u8)
            }
            FLASH_LINE if value & 0xFF == CMD_FLASH_READ || value & 0xFF == CMD_FLASH_WRITE => {
                PendingOp::Flash {
                    block: value >> FLASH_BLOCK_SHIFT,
                    write: value & 0xFF == CMD_FLASH_WRITE,
                }
            }
            DISK_LINE if value & 0xFF == CMD_DISK_SEEK => PendingOp::DiskSeek {
                cylinder: value >> 8,
            },
            DISK_LINE if value & 0xFF == CMD_DISK_READ || value & 0xFF == CMD_DISK_WRITE => {
                PendingOp::DiskXfer {
                    head: value >> 16,
                    sector: (value >> 8) & 0xFF,
                    write: value & 0xFF == CMD_DISK_WRITE,
                }
            }
            _ => {
                warn!("unrecognized command {value:#x} for line {line} device {dev}");
                return None;
            }
        };

        if self.subs[li][dev][si].pending.is_some() {
            warn!("command {value:#x} issued while line {line} device {dev} busy; ignored");
            return None;
        }
        self.subs[li][dev][si].pending = Some(op);
        self.set_status(line, dev, sub, STATUS_BUSY);
        Some(Scheduled {
            line,
            dev,
            sub,
            latency: op.latency(),
        })
    }

    fn set_status(&mut self, line: u32, dev: usize, sub: SubDev, status: u32) {
        let field = if line == TERM_LINE && sub == SubDev::Transmit { 2 } else { 0 };
        self.regs[line_index(line)][dev][field] = status;
    }

    /// Fire a previously scheduled completion: perform the operation's
    /// effect, latch the result status and raise the interrupt.
    pub fn complete(&mut self, line: u32, dev: usize, sub: SubDev, ram: &mut Ram) {
        let li = line_index(line);
        let si = sub_index(sub);
        let Some(op) = self.subs[li][dev][si].pending.take() else {
            // Acknowledged (or reset) before the latency elapsed.
            return;
        };
        let dma_addr = self.regs[li][dev][2];
        let status = match op {
            PendingOp::PrintChar(ch) => {
                self.printer_outputs[dev].push(ch);
                STATUS_READY
            }
            PendingOp::TermTransmit(ch) => {
                self.term_outputs[dev].push(ch);
                ((ch as u32) << TERM_CHAR_SHIFT) | STATUS_CHAR_OK
            }
            PendingOp::TermReceive => match self.term_inputs[dev].pop_front() {
                Some(ch) => ((ch as u32) << TERM_CHAR_SHIFT) | STATUS_CHAR_OK,
                None => STATUS_READ_ERROR,
            },
            PendingOp::Flash { block, write } => {
                self.flash_xfer(dev, block, write, dma_addr, ram)
            }
            PendingOp::DiskSeek { cylinder } => {
                if cylinder < self.disk_geometry.cylinders {
                    self.disk_cylinder[dev] = cylinder;
                    STATUS_READY
                } else {
                    STATUS_READ_ERROR
                }
            }
            PendingOp::DiskXfer { head, sector, write } => {
                self.disk_xfer(dev, head, sector, write, dma_addr, ram)
            }
        };
        self.subs[li][dev][si].done = true;
        self.set_status(line, dev, sub, status);
    }

    fn flash_xfer(&mut self, dev: usize, block: u32, write: bool, dma_addr: u32, ram: &mut Ram) -> u32 {
        let err = if write { STATUS_WRITE_ERROR } else { STATUS_READ_ERROR };
        if block >= self.flash_blocks || !ram.contains(dma_addr, PAGE_SIZE) {
            return err;
        }
        let start = (block * PAGE_SIZE) as usize;
        let end = start + PAGE_SIZE as usize;
        if write {
            self.flashes[dev][start..end].copy_from_slice(ram.slice(dma_addr, PAGE_SIZE));
        } else {
            ram.slice_mut(dma_addr, PAGE_SIZE)
                .copy_from_slice(&self.flashes[dev][start..end]);
        }
        STATUS_READY
    }

    fn disk_xfer(&mut self, dev: usize, head: u32, sector: u32, write: bool, dma_addr: u32, ram: &mut Ram) -> u32 {
        let geometry = self.disk_geometry;
        let err = if write { STATUS_WRITE_ERROR } else { STATUS_READ_ERROR };
        if head >= geometry.heads || sector >= geometry.sectors || !ram.contains(dma_addr, PAGE_SIZE) {
            return err;
        }
        let linear = (self.disk_cylinder[dev] * geometry.heads + head) * geometry.sectors + sector;
        let start = (linear * PAGE_SIZE) as usize;
        let end = start + PAGE_SIZE as usize;
        if write {
            self.disks[dev][start..end].copy_from_slice(ram.slice(dma_addr, PAGE_SIZE));
        } else {
            ram.slice_mut(dma_addr, PAGE_SIZE)
                .copy_from_slice(&self.disks[dev][start..end]);
        }
        STATUS_READY
    }

    /// Printer transcript, for harness inspection.
    pub fn printer_output(&self, dev: usize) -> &[u8] {
        &self.printer_outputs[dev]
    }

    /// Terminal transmit transcript, for harness inspection.
    pub fn terminal_output(&self, dev: usize) -> &[u8] {
        &self.term_outputs[dev]
    }

    /// Raw flash block contents, for harness inspection.
    pub fn flash_block(&self, dev: usize, block: u32) -> &[u8] {
        let start = (block * PAGE_SIZE) as usize;
        &self.flashes[dev][start..start + PAGE_SIZE as usize]
    }
}

fn field_index(field: DevField) -> usize {
    match field {
        DevField::Status => 0,
        DevField::Command => 1,
        DevField::Data0 => 2,
        DevField::Data1 => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Devices, Ram) {
        let config = MachineConfig {
            term_inputs: vec![(0, b"hi\n".to_vec())],
            ..MachineConfig::default()
        };
        (Devices::new(&config), Ram::new(0x40_000))
    }

    #[test]
    fn printer_prints_data0_byte() {
        let (mut devices, mut ram) = setup();
        devices.write(PRINTER_LINE, 0, DevField::Data0, b'x' as u32);
        let sched = devices
            .write(PRINTER_LINE, 0, DevField::Command, CMD_PRINT_CHR)
            .expect("print should schedule a completion");
        assert_eq!(devices.read(PRINTER_LINE, 0, DevField::Status), STATUS_BUSY);
        devices.complete(sched.line, sched.dev, sched.sub, &mut ram);
        assert_eq!(devices.read(PRINTER_LINE, 0, DevField::Status), STATUS_READY);
        assert_eq!(devices.bitmap(PRINTER_LINE), 1);
        assert_eq!(devices.printer_output(0), b"x");
        devices.write(PRINTER_LINE, 0, DevField::Command, CMD_ACK);
        assert_eq!(devices.bitmap(PRINTER_LINE), 0);
    }

    #[test]
    fn terminal_halves_are_independent() {
        let (mut devices, mut ram) = setup();
        let tx = devices
            .write(TERM_LINE, 0, DevField::Data1, (b'a' as u32) << 8 | CMD_TRANSMIT)
            .unwrap();
        let rx = devices
            .write(TERM_LINE, 0, DevField::Command, CMD_RECEIVE)
            .unwrap();
        devices.complete(tx.line, tx.dev, tx.sub, &mut ram);
        devices.complete(rx.line, rx.dev, rx.sub, &mut ram);
        assert_eq!(
            devices.read(TERM_LINE, 0, DevField::Data0),
            ((b'a' as u32) << 8) | STATUS_CHAR_OK
        );
        assert_eq!(
            devices.read(TERM_LINE, 0, DevField::Status),
            ((b'h' as u32) << 8) | STATUS_CHAR_OK
        );
        // Ack the transmitter only; the receiver stays pending.
        devices.write(TERM_LINE, 0, DevField::Data1, CMD_ACK);
        assert_eq!(devices.bitmap(TERM_LINE), 1);
        devices.write(TERM_LINE, 0, DevField::Command, CMD_ACK);
        assert_eq!(devices.bitmap(TERM_LINE), 0);
    }

    #[test]
    fn flash_round_trip_through_dma() {
        let (mut devices, mut ram) = setup();
        let frame = RAM_START + 0x2000;
        ram.slice_mut(frame, PAGE_SIZE).fill(0xAB);
        devices.write(FLASH_LINE, 2, DevField::Data0, frame);
        let sched = devices
            .write(FLASH_LINE, 2, DevField::Command, (5 << FLASH_BLOCK_SHIFT) | CMD_FLASH_WRITE)
            .unwrap();
        devices.complete(sched.line, sched.dev, sched.sub, &mut ram);
        assert_eq!(devices.read(FLASH_LINE, 2, DevField::Status), STATUS_READY);
        devices.write(FLASH_LINE, 2, DevField::Command, CMD_ACK);

        ram.slice_mut(frame, PAGE_SIZE).fill(0);
        devices.write(FLASH_LINE, 2, DevField::Data0, frame);
        let sched = devices
            .write(FLASH_LINE, 2, DevField::Command, (5 << FLASH_BLOCK_SHIFT) | CMD_FLASH_READ)
            .unwrap();
        devices.complete(sched.line, sched.dev, sched.sub, &mut ram);
        assert!(ram.slice(frame, PAGE_SIZE).iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn flash_block_out_of_range_errors() {
        let (mut devices, mut ram) = setup();
        devices.write(FLASH_LINE, 0, DevField::Data0, RAM_START);
        let sched = devices
            .write(FLASH_LINE, 0, DevField::Command, (9999 << FLASH_BLOCK_SHIFT) | CMD_FLASH_READ)
            .unwrap();
        devices.complete(sched.line, sched.dev, sched.sub, &mut ram);
        assert_eq!(devices.read(FLASH_LINE, 0, DevField::Status), STATUS_READ_ERROR);
    }

    #[test]
    fn disk_seek_then_transfer_addresses_by_geometry() {
        let (mut devices, mut ram) = setup();
        let frame = RAM_START + 0x3000;
        ram.slice_mut(frame, PAGE_SIZE).fill(0x5A);
        let seek = devices
            .write(DISK_LINE, 1, DevField::Command, (3 << 8) | CMD_DISK_SEEK)
            .unwrap();
        devices.complete(seek.line, seek.dev, seek.sub, &mut ram);
        devices.write(DISK_LINE, 1, DevField::Command, CMD_ACK);

        devices.write(DISK_LINE, 1, DevField::Data0, frame);
        let xfer = devices
            .write(DISK_LINE, 1, DevField::Command, (1 << 16) | (4 << 8) | CMD_DISK_WRITE)
            .unwrap();
        devices.complete(xfer.line, xfer.dev, xfer.sub, &mut ram);
        assert_eq!(devices.read(DISK_LINE, 1, DevField::Status), STATUS_READY);

        // (cyl 3 * heads 2 + head 1) * sectors 8 + sector 4 = sector 60.
        let start = (60 * PAGE_SIZE) as usize;
        assert!(devices.disks[1][start..start + 16].iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn receive_with_no_input_reports_error() {
        let (mut devices, mut ram) = setup();
        let rx = devices
            .write(TERM_LINE, 3, DevField::Command, CMD_RECEIVE)
            .unwrap();
        devices.complete(rx.line, rx.dev, rx.sub, &mut ram);
        assert_eq!(devices.read(TERM_LINE, 3, DevField::Status), STATUS_READ_ERROR);
    }
}
