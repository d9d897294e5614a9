//! Active Semaphore List: a sparse, sorted map from semaphore address to
//! the FIFO of PCBs blocked on it.
//!
//! The list is singly linked and bracketed by two sentinel descriptors
//! keyed 0 and `u32::MAX`, so a search always finds a predecessor and the
//! insert/unlink paths have no head special case. Descriptors come from a
//! fixed pool and go back to it the moment their FIFO drains.

use crate::error::KernelError;
use crate::nucleus::pcb::{PcbPool, Pid, ProcQueue};

/// Capacity of the descriptor pool, sentinels excluded.
pub const MAX_SEMD: usize = super::pcb::MAX_PROC;

type SemdId = usize;

#[derive(Debug, Clone, Default)]
struct Semd {
    key: u32,
    queue: ProcQueue,
    next: Option<SemdId>,
}

#[derive(Debug)]
pub struct Asl {
    semds: Vec<Semd>,
    free_head: Option<SemdId>,
    /// Index of the key-0 head sentinel.
    head: SemdId,
}

impl Default for Asl {
    fn default() -> Self {
        Self::new()
    }
}

impl Asl {
    pub fn new() -> Self {
        let mut semds = vec![Semd::default(); MAX_SEMD + 2];
        let head = MAX_SEMD;
        let tail = MAX_SEMD + 1;
        semds[head].key = 0;
        semds[head].next = Some(tail);
        semds[tail].key = u32::MAX;
        semds[tail].next = None;
        let mut asl = Self {
            semds,
            free_head: None,
            head,
        };
        for id in (0..MAX_SEMD).rev() {
            asl.semds[id].next = asl.free_head;
            asl.free_head = Some(id);
        }
        asl
    }

    /// Find the descriptor before the sorted position of `key`. Thanks to
    /// the sentinels a predecessor always exists.
    fn search_prev(&self, key: u32) -> SemdId {
        let mut prev = self.head;
        loop {
            let next = self.semds[prev].next.expect("ASL tail sentinel unlinked");
            if self.semds[next].key >= key {
                return prev;
            }
            prev = next;
        }
    }

    fn descriptor_for(&self, key: u32) -> Option<SemdId> {
        let prev = self.search_prev(key);
        let next = self.semds[prev].next.expect("ASL tail sentinel unlinked");
        (self.semds[next].key == key).then_some(next)
    }

    /// Block `pid` on the semaphore at `key`, creating a descriptor at the
    /// sorted position if none exists. Records the key on the PCB.
    pub fn insert_blocked(
        &mut self,
        pool: &mut PcbPool,
        key: u32,
        pid: Pid,
    ) -> Result<(), KernelError> {
        let prev = self.search_prev(key);
        let next = self.semds[prev].next.expect("ASL tail sentinel unlinked");
        let semd = if self.semds[next].key == key {
            next
        } else {
            let fresh = self.free_head.ok_or(KernelError::SemdExhausted)?;
            self.free_head = self.semds[fresh].next;
            self.semds[fresh] = Semd {
                key,
                queue: ProcQueue::new(),
                next: Some(next),
            };
            self.semds[prev].next = Some(fresh);
            fresh
        };
        let mut queue = self.semds[semd].queue;
        pool.insert_proc_q(&mut queue, pid);
        self.semds[semd].queue = queue;
        pool.get_mut(pid).sem_key = Some(key);
        Ok(())
    }

    /// Unblock the head of the FIFO at `key`, clearing its blocking key.
    pub fn remove_blocked(&mut self, pool: &mut PcbPool, key: u32) -> Option<Pid> {
        let semd = self.descriptor_for(key)?;
        let mut queue = self.semds[semd].queue;
        let pid = pool.remove_proc_q(&mut queue)?;
        self.semds[semd].queue = queue;
        pool.get_mut(pid).sem_key = None;
        self.release_if_empty(key);
        Some(pid)
    }

    /// Remove a specific PCB from its semaphore's FIFO. The blocking key
    /// is deliberately left on the PCB.
    pub fn out_blocked(&mut self, pool: &mut PcbPool, pid: Pid) -> Option<Pid> {
        let key = pool.get(pid).sem_key?;
        let semd = self.descriptor_for(key)?;
        let mut queue = self.semds[semd].queue;
        let removed = pool.out_proc_q(&mut queue, pid)?;
        self.semds[semd].queue = queue;
        self.release_if_empty(key);
        Some(removed)
    }

    /// Head of the FIFO at `key` without removal.
    pub fn head_blocked(&self, pool: &PcbPool, key: u32) -> Option<Pid> {
        let semd = self.descriptor_for(key)?;
        pool.head_proc_q(&self.semds[semd].queue)
    }

    /// Drop the descriptor for `key` back to the free pool if its FIFO is
    /// empty, keeping the invariant that active descriptors are non-empty.
    fn release_if_empty(&mut self, key: u32) {
        let prev = self.search_prev(key);
        let semd = self.semds[prev].next.expect("ASL tail sentinel unlinked");
        if self.semds[semd].key != key || !self.semds[semd].queue.is_empty() {
            return;
        }
        self.semds[prev].next = self.semds[semd].next;
        self.semds[semd].next = self.free_head;
        self.free_head = Some(semd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Asl, PcbPool) {
        (Asl::new(), PcbPool::new())
    }

    #[test]
    fn block_and_unblock_is_fifo() {
        let (mut asl, mut pool) = setup();
        let key = 0x2000_1200;
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        asl.insert_blocked(&mut pool, key, a).unwrap();
        asl.insert_blocked(&mut pool, key, b).unwrap();
        assert_eq!(pool.get(a).sem_key, Some(key));
        assert_eq!(asl.head_blocked(&pool, key), Some(a));
        assert_eq!(asl.remove_blocked(&mut pool, key), Some(a));
        assert_eq!(pool.get(a).sem_key, None);
        assert_eq!(asl.remove_blocked(&mut pool, key), Some(b));
        // FIFO drained: descriptor released.
        assert_eq!(asl.head_blocked(&pool, key), None);
        assert_eq!(asl.remove_blocked(&mut pool, key), None);
    }

    #[test]
    fn descriptors_stay_sorted_by_key() {
        let (mut asl, mut pool) = setup();
        let keys = [0x3000u32, 0x1000, 0x2000];
        for &key in &keys {
            let pid = pool.alloc().unwrap();
            asl.insert_blocked(&mut pool, key, pid).unwrap();
        }
        let mut seen = Vec::new();
        let mut cursor = asl.semds[asl.head].next;
        while let Some(id) = cursor {
            seen.push(asl.semds[id].key);
            cursor = asl.semds[id].next;
        }
        assert_eq!(seen, vec![0x1000, 0x2000, 0x3000, u32::MAX]);
    }

    #[test]
    fn out_blocked_keeps_key_and_releases_empty_descriptor() {
        let (mut asl, mut pool) = setup();
        let key = 0x2000_1204;
        let pid = pool.alloc().unwrap();
        asl.insert_blocked(&mut pool, key, pid).unwrap();
        assert_eq!(asl.out_blocked(&mut pool, pid), Some(pid));
        assert_eq!(pool.get(pid).sem_key, Some(key));
        assert_eq!(asl.head_blocked(&pool, key), None);
    }

    #[test]
    fn out_blocked_without_key_is_none() {
        let (mut asl, mut pool) = setup();
        let pid = pool.alloc().unwrap();
        assert_eq!(asl.out_blocked(&mut pool, pid), None);
    }

    #[test]
    fn descriptor_pool_covers_one_per_pcb() {
        // Every blocked PCB needs at most one descriptor, so a pool the
        // size of the PCB pool never exhausts: fill it, drain it, and
        // fill it again on fresh keys.
        let (mut asl, mut pool) = setup();
        for round in 0..2u32 {
            let mut pids = Vec::new();
            for i in 0..MAX_SEMD as u32 {
                let pid = pool.alloc().unwrap();
                pids.push(pid);
                asl.insert_blocked(&mut pool, 0x1000 * (round + 1) + i * 4, pid)
                    .unwrap();
            }
            for (i, pid) in pids.iter().enumerate() {
                let key = 0x1000 * (round + 1) + (i as u32) * 4;
                assert_eq!(asl.remove_blocked(&mut pool, key), Some(*pid));
                pool.free(*pid);
            }
        }
    }
}
