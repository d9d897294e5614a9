//! Kernel error definitions.
//!
//! Errors never cross the kernel/user boundary as structured values: user
//! requests get negative status codes or are terminated. These variants
//! cover the fixed-pool allocators and boot-time configuration checks.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("process control block pool exhausted")]
    PcbExhausted,
    #[error("semaphore descriptor pool exhausted")]
    SemdExhausted,
    #[error("delay descriptor pool exhausted")]
    DelayExhausted,
    #[error("too many user processes requested (max {max})")]
    TooManyUserProcs { max: usize },
}
