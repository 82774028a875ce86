// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt delivery from the controller to its host.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// A level-triggered interrupt line.
pub trait IntrPin: Send + Sync + 'static {
    fn assert(&self);
    fn deassert(&self);
    fn is_asserted(&self) -> bool;
}

/// Interrupt facilities of the PCI function hosting the controller.
pub trait InterruptSink: Send + Sync + 'static {
    /// Has the host enabled MSI-X for the function?
    fn msix_enabled(&self) -> bool;

    /// Signal MSI-X `vector`.
    fn msix_notify(&self, vector: u16);

    /// The legacy INTx line used when MSI-X is disabled.
    fn pin(&self) -> &dyn IntrPin;
}

/// Pin which records its level, for hosts which poll it.
#[derive(Default)]
pub struct LatchedPin {
    level: AtomicBool,
}
impl IntrPin for LatchedPin {
    fn assert(&self) {
        self.level.store(true, Ordering::SeqCst);
    }
    fn deassert(&self) {
        self.level.store(false, Ordering::SeqCst);
    }
    fn is_asserted(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }
}

/// Sink which records every MSI-X notification it receives.
#[derive(Default)]
pub struct RecordingSink {
    msix: AtomicBool,
    notified: Mutex<Vec<u16>>,
    pin: LatchedPin,
}
impl RecordingSink {
    pub fn new(msix: bool) -> Self {
        Self { msix: AtomicBool::new(msix), ..Default::default() }
    }

    pub fn set_msix(&self, enabled: bool) {
        self.msix.store(enabled, Ordering::SeqCst);
    }

    /// Take the vectors notified since the last call.
    pub fn take_notified(&self) -> Vec<u16> {
        std::mem::take(&mut *self.notified.lock().unwrap())
    }
}
impl InterruptSink for RecordingSink {
    fn msix_enabled(&self) -> bool {
        self.msix.load(Ordering::SeqCst)
    }
    fn msix_notify(&self, vector: u16) {
        self.notified.lock().unwrap().push(vector);
    }
    fn pin(&self) -> &dyn IntrPin {
        &self.pin
    }
}
