// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Emulation of an NVM Express controller.
//!
//! The controller is driven by three inputs from its embedder: accesses to
//! its register BAR (and optional Controller Memory Buffer), deferred
//! [tasks::Task]s which it schedules for itself, and completions from its
//! [block::Backend]. Guest memory and interrupt delivery are reached
//! through the [mem::DmaMemory] and [intr::InterruptSink] capabilities.

#![allow(clippy::style)]

pub extern crate usdt;
#[macro_use]
extern crate bitflags;

pub mod block;
pub mod common;
pub mod intr;
pub mod mem;
pub mod nvme;
pub mod tasks;
pub mod util;

pub use nvme::{NvmeCtrl, NvmeError, Params};
