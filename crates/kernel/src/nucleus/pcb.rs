//! Process control blocks: fixed-capacity pool, circular tail-pointer
//! queues, and the parent/child/sibling progeny tree.
//!
//! PCBs live in an arena and link to each other by index; a queue handle
//! is a single tail index whose successor is the head. Allocation returns
//! a fully cleared block, so no stale state survives a free/alloc cycle.

use mikron_machine::ProcessorState;

use crate::error::KernelError;

/// Fixed capacity of the PCB pool.
pub const MAX_PROC: usize = 20;

/// Index of a PCB in the pool.
pub type Pid = usize;

/// One process control block.
#[derive(Debug, Clone, Default)]
pub struct Pcb {
    /// Saved CPU state, loaded on dispatch.
    pub state: ProcessorState,
    /// Accumulated CPU time in microseconds.
    pub cpu_time: u64,
    /// Address of the semaphore this process is blocked on, if any.
    pub sem_key: Option<u32>,
    /// ASID of the support structure, if the process has one.
    pub support: Option<u32>,
    // Queue links.
    next: Option<Pid>,
    prev: Option<Pid>,
    // Progeny tree links.
    parent: Option<Pid>,
    child: Option<Pid>,
    next_sib: Option<Pid>,
    prev_sib: Option<Pid>,
}

/// A circular doubly linked FIFO of PCBs, held by its tail; the head is
/// the tail's successor.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcQueue {
    tail: Option<Pid>,
}

impl ProcQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tail.is_none()
    }
}

/// The PCB arena plus its free list.
#[derive(Debug)]
pub struct PcbPool {
    slots: Vec<Pcb>,
    free_head: Option<Pid>,
}

impl Default for PcbPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PcbPool {
    pub fn new() -> Self {
        let mut pool = Self {
            slots: vec![Pcb::default(); MAX_PROC],
            free_head: None,
        };
        for pid in (0..MAX_PROC).rev() {
            pool.slots[pid].next = pool.free_head;
            pool.free_head = Some(pid);
        }
        pool
    }

    pub fn get(&self, pid: Pid) -> &Pcb {
        &self.slots[pid]
    }

    pub fn get_mut(&mut self, pid: Pid) -> &mut Pcb {
        &mut self.slots[pid]
    }

    /// Allocate a PCB with every field cleared.
    pub fn alloc(&mut self) -> Result<Pid, KernelError> {
        let pid = self.free_head.ok_or(KernelError::PcbExhausted)?;
        self.free_head = self.slots[pid].next;
        self.slots[pid] = Pcb::default();
        Ok(pid)
    }

    /// Return a PCB to the free pool.
    pub fn free(&mut self, pid: Pid) {
        self.slots[pid].next = self.free_head;
        self.free_head = Some(pid);
    }

    /// Count of PCBs currently in the free pool.
    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.free_head;
        while let Some(pid) = cursor {
            count += 1;
            cursor = self.slots[pid].next;
        }
        count
    }

    // ---- circular FIFO operations ----

    /// Insert `pid` at the tail of `queue`.
    pub fn insert_proc_q(&mut self, queue: &mut ProcQueue, pid: Pid) {
        match queue.tail {
            None => {
                self.slots[pid].next = Some(pid);
                self.slots[pid].prev = Some(pid);
            }
            Some(tail) => {
                let head = self.slots[tail].next.expect("corrupt circular queue");
                self.slots[pid].next = Some(head);
                self.slots[pid].prev = Some(tail);
                self.slots[head].prev = Some(pid);
                self.slots[tail].next = Some(pid);
            }
        }
        queue.tail = Some(pid);
    }

    /// Remove and return the head of `queue`.
    pub fn remove_proc_q(&mut self, queue: &mut ProcQueue) -> Option<Pid> {
        let tail = queue.tail?;
        let head = self.slots[tail].next.expect("corrupt circular queue");
        if head == tail {
            queue.tail = None;
        } else {
            let new_head = self.slots[head].next.expect("corrupt circular queue");
            self.slots[tail].next = Some(new_head);
            self.slots[new_head].prev = Some(tail);
        }
        self.slots[head].next = None;
        self.slots[head].prev = None;
        Some(head)
    }

    /// Remove the specific PCB `pid` from `queue`; `None` if not present.
    pub fn out_proc_q(&mut self, queue: &mut ProcQueue, pid: Pid) -> Option<Pid> {
        let tail = queue.tail?;
        // Verify membership by walking the circle.
        let mut cursor = tail;
        loop {
            if cursor == pid {
                break;
            }
            cursor = self.slots[cursor].next.expect("corrupt circular queue");
            if cursor == tail {
                return None;
            }
        }
        let next = self.slots[pid].next.expect("corrupt circular queue");
        let prev = self.slots[pid].prev.expect("corrupt circular queue");
        if next == pid {
            queue.tail = None;
        } else {
            self.slots[prev].next = Some(next);
            self.slots[next].prev = Some(prev);
            if queue.tail == Some(pid) {
                queue.tail = Some(prev);
            }
        }
        self.slots[pid].next = None;
        self.slots[pid].prev = None;
        Some(pid)
    }

    /// Head of `queue` without removal.
    pub fn head_proc_q(&self, queue: &ProcQueue) -> Option<Pid> {
        let tail = queue.tail?;
        self.slots[tail].next
    }

    // ---- progeny tree operations ----

    /// Whether `pid` has no children.
    pub fn empty_child(&self, pid: Pid) -> bool {
        self.slots[pid].child.is_none()
    }

    /// Make `child` the first child of `parent`.
    pub fn insert_child(&mut self, parent: Pid, child: Pid) {
        let first = self.slots[parent].child;
        self.slots[child].parent = Some(parent);
        self.slots[child].next_sib = first;
        self.slots[child].prev_sib = None;
        if let Some(first) = first {
            self.slots[first].prev_sib = Some(child);
        }
        self.slots[parent].child = Some(child);
    }

    /// Detach and return the first child of `parent`.
    pub fn remove_child(&mut self, parent: Pid) -> Option<Pid> {
        let child = self.slots[parent].child?;
        let next = self.slots[child].next_sib;
        self.slots[parent].child = next;
        if let Some(next) = next {
            self.slots[next].prev_sib = None;
        }
        self.slots[child].parent = None;
        self.slots[child].next_sib = None;
        self.slots[child].prev_sib = None;
        Some(child)
    }

    /// Detach `pid` from its parent, wherever it sits in the sibling
    /// list; `None` if it has no parent.
    pub fn out_child(&mut self, pid: Pid) -> Option<Pid> {
        let parent = self.slots[pid].parent?;
        let next = self.slots[pid].next_sib;
        let prev = self.slots[pid].prev_sib;
        match prev {
            None => self.slots[parent].child = next,
            Some(prev) => self.slots[prev].next_sib = next,
        }
        if let Some(next) = next {
            self.slots[next].prev_sib = prev;
        }
        self.slots[pid].parent = None;
        self.slots[pid].next_sib = None;
        self.slots[pid].prev_sib = None;
        Some(pid)
    }
}
