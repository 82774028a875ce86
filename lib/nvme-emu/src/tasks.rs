// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deferred work for the controller.
//!
//! Register accesses never process commands inline. Instead they hand a
//! [Task] to the embedder's [Scheduler], which is expected to feed it back
//! to [crate::NvmeCtrl::run_task] from its own execution context (an event
//! loop, a dedicated thread, etc). Block backends use the same path to
//! report I/O completions.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::block::IoCompletion;

/// Unit of deferred controller work.
#[derive(Debug)]
pub enum Task {
    /// Fetch and execute entries from submission queue `qid`
    DrainSq(u16),
    /// Post pending completions to completion queue `qid`
    PostCq(u16),
    /// Match queued asynchronous events with outstanding AER commands
    ProcessAers,
    /// A block backend finished a request
    IoDone(IoCompletion),
}

/// Capability to run a [Task] at some later point.
pub trait Scheduler: Send + Sync + 'static {
    fn schedule(&self, task: Task);
}

/// Channel-backed FIFO of [Task]s.
pub struct TaskQueue {
    tx: Sender<Task>,
    rx: Receiver<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Pop the next task, if one is ready.
    pub fn try_next(&self) -> Option<Task> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
impl TaskQueue {
    /// Wait up to `timeout` for the next task, for backends completing
    /// requests from their own threads.
    pub(crate) fn next_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Option<Task> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TaskQueue {
    fn schedule(&self, task: Task) {
        // Both ends live in `self`, so the channel cannot be disconnected
        let _ = self.tx.send(task);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn fifo_order() {
        let q = TaskQueue::new();
        assert!(q.is_empty());

        q.schedule(Task::DrainSq(1));
        q.schedule(Task::PostCq(1));
        q.schedule(Task::ProcessAers);
        assert_eq!(q.len(), 3);

        assert!(matches!(q.try_next(), Some(Task::DrainSq(1))));
        assert!(matches!(q.try_next(), Some(Task::PostCq(1))));
        assert!(matches!(q.try_next(), Some(Task::ProcessAers)));
        assert!(q.try_next().is_none());
    }

    #[test]
    fn cross_thread() {
        let q = std::sync::Arc::new(TaskQueue::new());
        let qc = q.clone();
        let hdl = std::thread::spawn(move || qc.schedule(Task::DrainSq(7)));
        hdl.join().unwrap();

        let task = q.next_timeout(Duration::from_secs(5));
        assert!(matches!(task, Some(Task::DrainSq(7))));
        assert!(q.next_timeout(Duration::from_millis(1)).is_none());
    }
}
