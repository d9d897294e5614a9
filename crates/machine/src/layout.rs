//! Physical and virtual memory map of the simulated machine, plus the
//! device-register command and status vocabulary.
//!
//! Addresses below `KUSEG` are kernel segments and bypass the TLB; `KUSEG`
//! and above translate through it. RAM starts at `RAMSTART`, and the low
//! RAM frames are carved up for the nucleus stack, the kernel semaphore
//! words, the DMA staging buffers and the swap pool.

/// Page size in bytes.
pub const PAGE_SIZE: u32 = 4096;
/// Word size in bytes.
pub const WORD_LEN: u32 = 4;

/// Start of physical RAM.
pub const RAM_START: u32 = 0x2000_0000;
/// Default RAM size (4 MB).
pub const DEFAULT_RAM_SIZE: u32 = 4 * 1024 * 1024;

/// Start of the translated user segment.
pub const KUSEG: u32 = 0x8000_0000;
/// Logical address of the first user text instruction.
pub const TEXT_AREA_START: u32 = 0x8000_00B0;
/// VPN of the distinguished user stack page.
pub const STACK_PAGE_VPN: u32 = 0xBFFF_F000;
/// One past the top of the user stack page.
pub const STACK_TOP: u32 = 0xC000_0000;
/// Page-number base of the user segment (`KUSEG >> 12`).
pub const KUSEG_PAGE_BASE: u32 = 0x80000;

/// Top of the nucleus kernel stack.
pub const NUCLEUS_STACK: u32 = 0x2000_1000;

// Kernel data words in low RAM. Semaphores are plain RAM words so that the
// nucleus can key its Active Semaphore List on their addresses.

/// Base of the device semaphore array (48 sub-devices + the pseudo-clock).
pub const DEV_SEM_BASE: u32 = 0x2000_1100;
/// Number of device semaphores including the pseudo-clock.
pub const DEV_SEM_COUNT: u32 = 49;
/// Index of the pseudo-clock semaphore within the device semaphore array.
pub const PSEUDO_CLOCK_IDX: u32 = DEV_SEM_COUNT - 1;
/// Swap-pool mutual exclusion semaphore.
pub const SWAP_SEM_ADDR: u32 = 0x2000_1200;
/// Master termination semaphore.
pub const MASTER_SEM_ADDR: u32 = 0x2000_1204;
/// Active Delay List mutual exclusion semaphore.
pub const ADL_SEM_ADDR: u32 = 0x2000_1208;
/// Base of the per-user-process private delay semaphores, indexed by ASID.
pub const DELAY_SEM_BASE: u32 = 0x2000_1240;

/// Base of the per-user-process device mutex semaphores (48 words).
pub const DEV_MUTEX_BASE: u32 = 0x2000_1300;

/// Sixteen 4 KB DMA staging buffers: 8 for disks, then 8 for flashes.
pub const DMA_BUF_BASE: u32 = 0x2001_0000;
/// Total DMA staging buffers.
pub const DMA_BUF_COUNT: u32 = 16;

/// First frame of the swap pool.
pub const SWAP_POOL_ADDR: u32 = 0x2002_0000;

/// Base of the reserved support-level exception stacks (two pages per ASID).
pub const SUPPORT_STACK_BASE: u32 = 0x2003_0000;

/// Synthetic address space used to name support structures; SYS8 returns
/// `SUPPORT_BASE + asid * SUPPORT_SIZE` and address 0 means "no support".
pub const SUPPORT_BASE: u32 = 0x2004_0000;
/// Stride of one support structure in the synthetic address space.
pub const SUPPORT_SIZE: u32 = 0x1000;

// Interrupt lines.

/// Processor local timer line.
pub const PLT_LINE: u32 = 1;
/// System-wide interval timer line.
pub const INTERVAL_LINE: u32 = 2;
/// Disk devices.
pub const DISK_LINE: u32 = 3;
/// Flash devices.
pub const FLASH_LINE: u32 = 4;
/// Network devices.
pub const NET_LINE: u32 = 5;
/// Printer devices.
pub const PRINTER_LINE: u32 = 6;
/// Terminal devices.
pub const TERM_LINE: u32 = 7;

/// Peripheral interrupt lines (3..7).
pub const DEV_LINE_COUNT: u32 = 5;
/// Devices per interrupt line.
pub const DEV_PER_LINE: u32 = 8;

/// Interval between pseudo-clock ticks, in microseconds.
pub const CLOCK_INTERVAL: u64 = 100_000;
/// Scheduler quantum loaded into the PLT, in microseconds.
pub const QUANTUM: u64 = 5_000;
/// "Never fire" PLT value used while the processor waits for a device.
pub const TIMER_NEVER: u32 = 0xFFFF_FFFF;

// Device status codes.

pub const STATUS_UNINSTALLED: u32 = 0;
pub const STATUS_READY: u32 = 1;
pub const STATUS_BUSY: u32 = 3;
/// Read/receive failure.
pub const STATUS_READ_ERROR: u32 = 4;
/// Write/transmission failure.
pub const STATUS_WRITE_ERROR: u32 = 5;
/// Terminal: character received/transmitted, character in the upper byte.
pub const STATUS_CHAR_OK: u32 = 5;
/// Mask isolating the terminal status code from the character byte.
pub const TERM_STATUS_MASK: u32 = 0xFF;
/// Shift of the character within a terminal status or transmit command.
pub const TERM_CHAR_SHIFT: u32 = 8;

// Device command codes.

pub const CMD_RESET: u32 = 0;
pub const CMD_ACK: u32 = 1;
/// Printer: transmit the byte in DATA0.
pub const CMD_PRINT_CHR: u32 = 2;
/// Terminal receiver: receive one character.
pub const CMD_RECEIVE: u32 = 2;
/// Terminal transmitter: low byte of `(char << 8) | 2`.
pub const CMD_TRANSMIT: u32 = 2;
/// Flash: read the block in the upper bits into the frame in DATA0.
pub const CMD_FLASH_READ: u32 = 2;
/// Flash: write the frame in DATA0 out to the block in the upper bits.
pub const CMD_FLASH_WRITE: u32 = 3;
/// Shift of the block number within a flash command word.
pub const FLASH_BLOCK_SHIFT: u32 = 8;
/// Disk: seek to the cylinder in bits 8.. of the command word.
pub const CMD_DISK_SEEK: u32 = 2;
/// Disk: read the sector addressed by `(head << 16) | (sec << 8)`.
pub const CMD_DISK_READ: u32 = 3;
/// Disk: write the sector addressed by `(head << 16) | (sec << 8)`.
pub const CMD_DISK_WRITE: u32 = 4;

/// First flash block available to user block I/O; lower blocks back the
/// demand-paged user pages.
pub const FLASH_USER_BASE: u32 = 32;

// Simulated completion latencies, in microseconds.

pub const DISK_LATENCY: u64 = 500;
pub const FLASH_LATENCY: u64 = 350;
pub const PRINTER_LATENCY: u64 = 150;
pub const TERM_LATENCY: u64 = 120;

/// Device register field selectors. Terminals overlay receive on
/// STATUS/COMMAND and transmit on DATA0/DATA1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevField {
    Status,
    Command,
    Data0,
    Data1,
}

/// Terminal sub-device selector; every other device class is the
/// degenerate single-sub-device case (`Receive`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SubDev {
    Receive,
    Transmit,
}
