// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeSet, VecDeque};
use std::mem::size_of;

use super::bits::{CompletionQueueEntry, SubmissionQueueEntry};
use super::cmds::Completion;
use super::prp::Segment;
use crate::block::ReqId;

use thiserror::Error;

/// Each queue is identified by a 16-bit ID.
///
/// See NVMe 1.3 Section 4.1.4 Queue Identifier
pub type QueueId = u16;

/// The Admin Completion and Submission are defined to have ID 0.
pub const ADMIN_QUEUE_ID: QueueId = 0;

/// The minimum number of entries in either a Completion or Submission Queue.
///
/// Note: One entry will always be unavailable for use due to the Head and Tail
///       entry pointer definitions.
const MIN_QUEUE_SIZE: u32 = 2;

/// The maximum number of entries in any queue, as advertised by CAP.MQES
/// (which is 0's based).
pub const MAX_QUEUE_SIZE: u32 = 0x800;

/// Ring position state shared by both queue types.
#[derive(Debug)]
struct QueueState {
    /// The size of the queue in entries.
    size: u32,

    /// The Queue Head entry pointer.
    ///
    /// The consumer of entries on a queue uses the current Head entry pointer
    /// to identify the next entry to be pulled off the queue.
    head: u16,

    /// The Queue Tail entry pointer.
    ///
    /// The submitter of entries to a queue uses the current Tail entry pointer
    /// to identify the next open queue entry space.
    tail: u16,
}

impl QueueState {
    fn new(size: u32) -> Self {
        assert!((MIN_QUEUE_SIZE..=MAX_QUEUE_SIZE).contains(&size));
        Self { size, head: 0, tail: 0 }
    }

    /// A queue is empty when the Head entry pointer equals the Tail entry
    /// pointer.
    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// The queue is full when the Head entry pointer equals one more than the
    /// Tail entry pointer.
    fn is_full(&self) -> bool {
        self.wrap_add(self.tail, 1) == self.head
    }

    /// Helper method to calculate a positive offset for a given index,
    /// wrapping at the size of the queue.
    fn wrap_add(&self, idx: u16, off: u16) -> u16 {
        debug_assert!((idx as u32) < self.size);
        debug_assert!((off as u32) < self.size);

        let res = idx as u32 + off as u32;
        if res >= self.size {
            (res - self.size) as u16
        } else {
            res as u16
        }
    }

    /// Validate a doorbell value as a ring index.
    fn check_index(&self, idx: u16) -> Result<(), QueueUpdateError> {
        if idx as u32 >= self.size {
            return Err(QueueUpdateError::InvalidEntry);
        }
        Ok(())
    }
}

/// Errors that may be encountered during Queue creation.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueCreateErr {
    /// The specified base address is invalid.
    #[error("invalid base address")]
    InvalidBaseAddr,

    /// The specified length is invalid.
    #[error("invalid size")]
    InvalidSize,
}

/// Errors that may be encountered while adjusting Queue head/tail pointers.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueUpdateError {
    #[error("tried to move head or tail pointer to an invalid index")]
    InvalidEntry,
}

fn validate(
    base: u64,
    size: u32,
    page_size: u64,
) -> Result<(), QueueCreateErr> {
    if base == 0 || base & (page_size - 1) != 0 {
        return Err(QueueCreateErr::InvalidBaseAddr);
    }
    if !(MIN_QUEUE_SIZE..=MAX_QUEUE_SIZE).contains(&size) {
        return Err(QueueCreateErr::InvalidSize);
    }
    Ok(())
}

/// Progress of the command occupying a [Slot].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlotState {
    /// Available for the next fetched command
    Free,
    /// Dispatched, awaiting a backend completion or an async event
    Outstanding,
    /// Completed, waiting for room on the completion queue
    Pending,
}

/// Per-command tracking on a submission queue.
///
/// Each queue has exactly as many slots as ring entries, so fetching can
/// never outrun them while the ring itself has room.
#[derive(Debug)]
pub struct Slot {
    pub state: SlotState,
    /// Command Identifier of the command occupying the slot
    pub cid: u16,
    /// Result to post once complete
    pub cqe: Completion,
    /// Identifier of the backend request issued on the command's behalf
    pub req: Option<ReqId>,
    /// Data buffer to fill when a read finishes
    pub segs: Vec<Segment>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Free,
            cid: 0,
            cqe: Completion::success(),
            req: None,
            segs: Vec::new(),
        }
    }
}

/// Type for manipulating Submission Queues.
#[derive(Debug)]
pub struct SubQueue {
    /// The ID of this Submission Queue.
    id: QueueId,

    /// The corresponding Completion Queue.
    cqid: QueueId,

    /// Queue state such as the size and current head/tail entry pointers.
    state: QueueState,

    /// The address at which the Queue is mapped (host memory or CMB).
    base: u64,

    slots: Vec<Slot>,
    free: VecDeque<u16>,
}

impl SubQueue {
    /// Create a Submission Queue of `size` entries at `base`.
    pub fn new(
        id: QueueId,
        cqid: QueueId,
        size: u32,
        base: u64,
        page_size: u64,
    ) -> Result<Self, QueueCreateErr> {
        validate(base, size, page_size)?;
        Ok(Self {
            id,
            cqid,
            state: QueueState::new(size),
            base,
            slots: (0..size).map(|_| Slot::new()).collect(),
            free: (0..size as u16).collect(),
        })
    }

    pub fn id(&self) -> QueueId {
        self.id
    }
    pub fn cqid(&self) -> QueueId {
        self.cqid
    }
    pub fn size(&self) -> u32 {
        self.state.size
    }
    pub fn head(&self) -> u16 {
        self.state.head
    }
    pub fn tail(&self) -> u16 {
        self.state.tail
    }
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// Move the Tail entry pointer to the index written by the host.
    pub fn notify_tail(&mut self, idx: u16) -> Result<(), QueueUpdateError> {
        self.state.check_index(idx)?;
        self.state.tail = idx;
        Ok(())
    }

    /// Attempt to return the Head entry pointer and then move it forward by 1.
    ///
    /// If the queue is empty this method returns [`None`].
    pub fn pop_head(&mut self) -> Option<u16> {
        if self.state.is_empty() {
            return None;
        }
        let old_head = self.state.head;
        self.state.head = self.state.wrap_add(old_head, 1);
        Some(old_head)
    }

    /// Indices of entries the host has submitted but which have not yet
    /// been fetched, in ring order.
    pub fn unfetched(&self) -> impl Iterator<Item = u16> + '_ {
        let mut idx = self.state.head;
        std::iter::from_fn(move || {
            if idx == self.state.tail {
                return None;
            }
            let cur = idx;
            idx = self.state.wrap_add(idx, 1);
            Some(cur)
        })
    }

    /// Returns the address of a given entry in the Submission Queue.
    pub fn entry_addr(&self, idx: u16) -> u64 {
        self.base + idx as u64 * size_of::<SubmissionQueueEntry>() as u64
    }

    pub fn has_free_slot(&self) -> bool {
        !self.free.is_empty()
    }

    /// Claim a free slot for command `cid`.
    pub fn take_slot(&mut self, cid: u16) -> Option<u16> {
        let idx = self.free.pop_front()?;
        let slot = &mut self.slots[idx as usize];
        debug_assert_eq!(slot.state, SlotState::Free);
        slot.state = SlotState::Outstanding;
        slot.cid = cid;
        slot.cqe = Completion::success();
        slot.req = None;
        slot.segs.clear();
        Some(idx)
    }

    pub fn slot(&self, idx: u16) -> &Slot {
        &self.slots[idx as usize]
    }
    pub fn slot_mut(&mut self, idx: u16) -> &mut Slot {
        &mut self.slots[idx as usize]
    }

    /// Record the result of the command in `idx`, making it ready to post.
    pub fn complete_slot(&mut self, idx: u16, cqe: Completion) {
        let slot = &mut self.slots[idx as usize];
        slot.state = SlotState::Pending;
        slot.cqe = cqe;
        slot.req = None;
        slot.segs.clear();
    }

    /// Return slot `idx` to the free list.
    pub fn release_slot(&mut self, idx: u16) {
        let slot = &mut self.slots[idx as usize];
        if slot.state == SlotState::Free {
            return;
        }
        slot.state = SlotState::Free;
        slot.req = None;
        slot.segs.clear();
        self.free.push_back(idx);
    }

    /// Backend requests still outstanding for this queue
    pub fn outstanding_reqs(&self) -> impl Iterator<Item = ReqId> + '_ {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Outstanding)
            .filter_map(|s| s.req)
    }
}

/// Type for manipulating Completion Queues.
#[derive(Debug)]
pub struct CompQueue {
    /// The ID of this Completion Queue.
    id: QueueId,

    /// The Interrupt Vector used to signal to the host upon pushing entries
    /// onto the Completion Queue.
    vector: u16,

    /// Whether interrupts are enabled for this queue
    ien: bool,

    /// Queue state such as the size and current head/tail entry pointers.
    state: QueueState,

    /// The current phase tag.
    ///
    /// The Phase Tag is used to identify to the host that a Completion entry
    /// is new. Flips every time the Tail entry pointer wraps around.
    phase: bool,

    /// The address at which the Queue is mapped (host memory or CMB).
    base: u64,

    /// Submission Queues which post to this queue
    sqs: BTreeSet<QueueId>,

    /// Completed commands, as (sqid, slot), awaiting room in the ring
    pending: VecDeque<(QueueId, u16)>,
}

impl CompQueue {
    /// Create a Completion Queue of `size` entries at `base`.
    pub fn new(
        id: QueueId,
        vector: u16,
        ien: bool,
        size: u32,
        base: u64,
        page_size: u64,
    ) -> Result<Self, QueueCreateErr> {
        validate(base, size, page_size)?;
        // As the device side, we start with our phase tag as asserted (1)
        // as the host side will create all the Completion Queue entries
        // with the phase initially zeroed out.
        Ok(Self {
            id,
            vector,
            ien,
            state: QueueState::new(size),
            phase: true,
            base,
            sqs: BTreeSet::new(),
            pending: VecDeque::new(),
        })
    }

    pub fn id(&self) -> QueueId {
        self.id
    }
    pub fn vector(&self) -> u16 {
        self.vector
    }
    pub fn intr_enabled(&self) -> bool {
        self.ien
    }
    pub fn size(&self) -> u32 {
        self.state.size
    }
    pub fn head(&self) -> u16 {
        self.state.head
    }
    pub fn tail(&self) -> u16 {
        self.state.tail
    }
    pub fn phase(&self) -> bool {
        self.phase
    }
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
    pub fn is_full(&self) -> bool {
        self.state.is_full()
    }

    /// Move the Head entry pointer to the index written by the host.
    pub fn notify_head(&mut self, idx: u16) -> Result<(), QueueUpdateError> {
        self.state.check_index(idx)?;
        self.state.head = idx;
        Ok(())
    }

    /// Reserve the entry at the Tail entry pointer, returning its index and
    /// the phase tag to write into it.
    ///
    /// If the queue is full this method returns [`None`].
    pub fn push_tail(&mut self) -> Option<(u16, bool)> {
        if self.state.is_full() {
            return None;
        }
        let idx = self.state.tail;
        let phase = self.phase;
        self.state.tail = self.state.wrap_add(idx, 1);
        if self.state.tail == 0 {
            // We wrapped so flip phase
            self.phase = !self.phase;
        }
        Some((idx, phase))
    }

    /// Returns the address of a given entry in the Completion Queue.
    pub fn entry_addr(&self, idx: u16) -> u64 {
        self.base + idx as u64 * size_of::<CompletionQueueEntry>() as u64
    }

    pub fn attach(&mut self, sqid: QueueId) {
        self.sqs.insert(sqid);
    }
    pub fn detach(&mut self, sqid: QueueId) {
        self.sqs.remove(&sqid);
    }
    pub fn has_sqs(&self) -> bool {
        !self.sqs.is_empty()
    }
    pub fn sqs(&self) -> impl Iterator<Item = QueueId> + '_ {
        self.sqs.iter().copied()
    }

    /// Queue a completed command for posting.
    pub fn push_pending(&mut self, sqid: QueueId, slot: u16) {
        self.pending.push_back((sqid, slot));
    }
    pub fn pop_pending(&mut self) -> Option<(QueueId, u16)> {
        self.pending.pop_front()
    }
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Forget any pending completions belonging to `sqid`.
    pub fn drop_pending(&mut self, sqid: QueueId) {
        self.pending.retain(|(id, _)| *id != sqid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    const PAGE: u64 = 4096;

    #[test]
    fn create_queues() {
        assert!(CompQueue::new(0, 0, true, 1024, 0x10000, PAGE).is_ok());
        assert_eq!(
            CompQueue::new(1, 0, true, 0x801, 0x10000, PAGE).unwrap_err(),
            QueueCreateErr::InvalidSize
        );
        assert_eq!(
            CompQueue::new(1, 0, true, 1, 0x10000, PAGE).unwrap_err(),
            QueueCreateErr::InvalidSize
        );
        assert_eq!(
            CompQueue::new(1, 0, true, 16, 0, PAGE).unwrap_err(),
            QueueCreateErr::InvalidBaseAddr
        );

        assert!(SubQueue::new(1, 1, 0x800, 0x10000, PAGE).is_ok());
        assert_eq!(
            SubQueue::new(1, 1, 16, 0x10800, PAGE).unwrap_err(),
            QueueCreateErr::InvalidBaseAddr
        );
        // Alignment follows the configured page size
        assert_eq!(
            SubQueue::new(1, 1, 16, 0x11000, 4 * PAGE).unwrap_err(),
            QueueCreateErr::InvalidBaseAddr
        );
    }

    #[test]
    fn sq_fetch_order() {
        let mut sq = SubQueue::new(1, 1, 4, 0x10000, PAGE).unwrap();
        assert!(sq.pop_head().is_none());
        assert_eq!(sq.notify_tail(4), Err(QueueUpdateError::InvalidEntry));

        sq.notify_tail(3).unwrap();
        assert_eq!(sq.unfetched().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(sq.pop_head(), Some(0));
        assert_eq!(sq.entry_addr(2), 0x10000 + 2 * 64);

        // Wrap the tail around
        sq.notify_tail(1).unwrap();
        assert_eq!(sq.unfetched().collect::<Vec<_>>(), vec![1, 2, 3, 0]);
        while sq.pop_head().is_some() {}
        assert!(sq.is_empty());
        assert_eq!(sq.head(), 1);
    }

    #[test]
    fn slot_lifecycle() {
        let mut sq = SubQueue::new(1, 1, 2, 0x10000, PAGE).unwrap();
        let a = sq.take_slot(7).unwrap();
        let b = sq.take_slot(8).unwrap();
        assert!(sq.take_slot(9).is_none());
        assert!(!sq.has_free_slot());

        sq.slot_mut(a).req = Some(ReqId(100));
        assert_eq!(sq.outstanding_reqs().collect::<Vec<_>>(), vec![ReqId(100)]);

        sq.complete_slot(a, Completion::success_val(1));
        assert_eq!(sq.slot(a).state, SlotState::Pending);
        assert_eq!(sq.slot(a).cid, 7);
        assert!(sq.outstanding_reqs().next().is_none());

        sq.release_slot(a);
        sq.release_slot(a);
        assert_eq!(sq.take_slot(10), Some(a));
        assert!(sq.take_slot(11).is_none());
        sq.release_slot(b);
        assert!(sq.has_free_slot());
    }

    #[test]
    fn cq_phase_and_full() {
        let mut cq = CompQueue::new(1, 3, true, 3, 0x20000, PAGE).unwrap();
        assert_eq!(cq.push_tail(), Some((0, true)));
        assert_eq!(cq.push_tail(), Some((1, true)));
        assert!(cq.is_full());
        assert_eq!(cq.push_tail(), None);

        cq.notify_head(2).unwrap();
        assert_eq!(cq.push_tail(), Some((2, true)));
        // Wrapped: entries now carry the inverted phase
        assert_eq!(cq.push_tail(), Some((0, false)));
        assert!(cq.is_full());
        assert_eq!(cq.notify_head(3), Err(QueueUpdateError::InvalidEntry));
        assert_eq!(cq.entry_addr(2), 0x20000 + 2 * 16);
    }

    #[test]
    fn cq_pending() {
        let mut cq = CompQueue::new(1, 0, true, 16, 0x20000, PAGE).unwrap();
        cq.attach(1);
        cq.attach(2);
        cq.push_pending(1, 0);
        cq.push_pending(2, 0);
        cq.push_pending(1, 1);
        cq.drop_pending(1);
        assert_eq!(cq.pop_pending(), Some((2, 0)));
        assert!(!cq.has_pending());

        cq.detach(1);
        assert_eq!(cq.sqs().collect::<Vec<_>>(), vec![2]);
        cq.detach(2);
        assert!(!cq.has_sqs());
    }

    proptest! {
        /// Entries posted between host head updates never exceed size - 1,
        /// and the phase flips exactly once per wrap.
        #[test]
        fn cq_ring_accounting(
            size in 2u32..64,
            consumes in prop::collection::vec(0u32..64, 1..32),
        ) {
            let mut cq =
                CompQueue::new(1, 0, true, size, 0x1000, PAGE).unwrap();
            let mut posted: u64 = 0;
            let mut consumed: u64 = 0;
            for n in consumes {
                while let Some((idx, phase)) = cq.push_tail() {
                    prop_assert_eq!(idx as u64, posted % size as u64);
                    prop_assert_eq!(phase, (posted / size as u64) % 2 == 0);
                    posted += 1;
                }
                prop_assert_eq!(posted - consumed, size as u64 - 1);

                let n = (n as u64).min(posted - consumed);
                consumed += n;
                cq.notify_head((consumed % size as u64) as u16).unwrap();
            }
        }
    }
}
