// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asynchronous Events
//!
//! The host keeps a number of Asynchronous Event Request commands
//! outstanding, and the controller completes one of them whenever it has
//! something to report. At most one event of each type is queued at a
//! time, and once an event of a given type has been delivered that type
//! stays masked until the host reads the associated log page.
//!
//! See NVMe 1.3 Section 5.2 Asynchronous Event Request command

use std::collections::VecDeque;

use super::bits;
use super::cmds::{CmdOutcome, Completion};
use super::queue::ADMIN_QUEUE_ID;
use super::NvmeCtrl;
use crate::tasks::Task;

/// Asynchronous Event Request Limit (0's based), as reported in Identify
pub const AERL: u8 = 3;

/// A controller-generated notification awaiting delivery.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AsyncEvent {
    /// Asynchronous Event Type
    pub etype: u8,
    /// Asynchronous Event Information
    pub info: u8,
    /// Associated Log Page
    pub log: u8,
}

impl AsyncEvent {
    /// Completion Dword 0 of the AER command which delivers this event
    pub fn dw0(&self) -> u32 {
        u32::from(self.etype)
            | u32::from(self.info) << 8
            | u32::from(self.log) << 16
    }
}

/// Queued events and outstanding requests.
#[derive(Debug, Default)]
pub struct AerState {
    events: VecDeque<AsyncEvent>,
    /// Types with an event sitting in `events`
    queued: u8,
    /// Types delivered but not yet acknowledged through their log page
    masked: u8,
    /// Admin submission queue slots of outstanding AER commands, oldest
    /// first
    reqs: VecDeque<u16>,
}

impl AerState {
    fn bit(etype: u8) -> u8 {
        1 << (etype & 0x7)
    }

    /// Queue `ev` for delivery. Returns false if an event of the same type
    /// is already queued or awaiting acknowledgement.
    pub fn enqueue(&mut self, ev: AsyncEvent) -> bool {
        let bit = Self::bit(ev.etype);
        if (self.queued | self.masked) & bit != 0 {
            return false;
        }
        self.queued |= bit;
        self.events.push_back(ev);
        true
    }

    /// The host acknowledged events of `etype`. Returns true if anything
    /// is still queued.
    pub fn clear(&mut self, etype: u8) -> bool {
        self.masked &= !Self::bit(etype);
        !self.events.is_empty()
    }

    pub fn outstanding(&self) -> usize {
        self.reqs.len()
    }

    pub fn push_req(&mut self, slot: u16) {
        self.reqs.push_back(slot);
    }

    /// Pair the first deliverable event with the oldest outstanding
    /// request.
    pub fn next_delivery(&mut self) -> Option<(u16, AsyncEvent)> {
        if self.reqs.is_empty() {
            return None;
        }
        let pos = self
            .events
            .iter()
            .position(|ev| self.masked & Self::bit(ev.etype) == 0)?;
        let ev = self.events.remove(pos)?;
        let bit = Self::bit(ev.etype);
        self.masked |= bit;
        self.queued &= !bit;
        let slot = self.reqs.pop_front()?;
        Some((slot, ev))
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl NvmeCtrl {
    /// Raise an asynchronous event, to be delivered once the host has an
    /// AER command outstanding.
    pub(super) fn enqueue_event(&mut self, etype: u8, info: u8, log: u8) {
        let ev = AsyncEvent { etype, info, log };
        if self.aer.enqueue(ev) {
            slog::debug!(self.log, "async event queued";
                "type" => etype, "info" => info, "log" => log);
            self.schedule_aers();
        }
    }

    /// Unmask events of `etype` after the host read their log page.
    pub(super) fn clear_events(&mut self, etype: u8) {
        if self.aer.clear(etype) {
            self.schedule_aers();
        }
    }

    /// Complete outstanding AER commands with whatever events are ready.
    pub(super) fn process_aers(&mut self) {
        let mut posted = false;
        while let Some((slot, ev)) = self.aer.next_delivery() {
            slog::debug!(self.log, "delivering async event";
                "type" => ev.etype, "info" => ev.info, "log" => ev.log);
            self.enqueue_req_completion(
                ADMIN_QUEUE_ID,
                slot,
                Completion::success_val(ev.dw0()),
            );
            posted = true;
        }
        if posted {
            self.schedule(Task::PostCq(ADMIN_QUEUE_ID));
        }
    }

    /// Asynchronous Event Request Command
    ///
    /// The command is held until an event arrives to complete it.
    pub(super) fn acmd_async_event_req(&mut self, slot: u16) -> CmdOutcome {
        if self.aer.outstanding() > usize::from(AERL) {
            return Completion::specific_err(
                bits::StatusCodeType::CmdSpecific,
                bits::STS_AER_LIMIT_EXCEEDED,
            )
            .into();
        }
        self.aer.push_req(slot);
        self.schedule_aers();
        CmdOutcome::Deferred
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn smart() -> AsyncEvent {
        AsyncEvent {
            etype: bits::AER_TYPE_SMART,
            info: bits::AER_INFO_SMART_TEMP_THRESH,
            log: bits::LOG_SMART_INFO,
        }
    }

    fn error(info: u8) -> AsyncEvent {
        AsyncEvent {
            etype: bits::AER_TYPE_ERROR,
            info,
            log: bits::LOG_ERROR_INFO,
        }
    }

    #[test]
    fn dedup_by_type() {
        let mut aer = AerState::default();
        assert!(aer.enqueue(error(0)));
        assert!(!aer.enqueue(error(1)));
        assert!(aer.enqueue(smart()));

        aer.push_req(3);
        aer.push_req(5);
        assert_eq!(aer.next_delivery(), Some((3, error(0))));
        assert_eq!(aer.next_delivery(), Some((5, smart())));
        assert_eq!(aer.next_delivery(), None);
    }

    #[test]
    fn masked_until_cleared() {
        let mut aer = AerState::default();
        aer.push_req(0);
        aer.push_req(1);
        assert!(aer.enqueue(error(0)));
        assert_eq!(aer.next_delivery(), Some((0, error(0))));

        // Delivered but unacknowledged: further errors are dropped
        assert!(!aer.enqueue(error(1)));
        assert!(!aer.clear(bits::AER_TYPE_ERROR));
        assert!(aer.enqueue(error(1)));
        assert_eq!(aer.next_delivery(), Some((1, error(1))));
        assert_eq!(aer.outstanding(), 0);
    }

    #[test]
    fn waits_for_request() {
        let mut aer = AerState::default();
        assert!(aer.enqueue(smart()));
        assert_eq!(aer.next_delivery(), None);
        aer.push_req(9);
        assert_eq!(aer.next_delivery(), Some((9, smart())));
        assert_eq!(smart().dw0(), 0x02_01_01);

        aer.reset();
        assert_eq!(aer.outstanding(), 0);
        assert!(aer.enqueue(smart()));
    }
}
