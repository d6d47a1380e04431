// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! # cax-core
//!
//! Data-movement orchestration for detector run data: a fleet of
//! independent agents, one per storage site, coordinating exclusively
//! through a shared store of run documents.
//!
//! Every copy of a run's data is tracked as a data location moving
//! through a small state machine:
//!
//! ```text
//! transferring ──► verifying ──► transferred
//!      │               │
//!      ▼               ▼
//!    error           failed
//! ```
//!
//! Agents poll the store, find runs whose locations imply work (a copy to
//! make, a checksum to verify, debris to purge) and perform it through
//! pluggable transfer backends. There is no leader and no message bus;
//! crash tolerance falls out of the store being the only authority and
//! every mutation being a single conditional document operation.
//!
//! ## Modules
//!
//! - [`model`]: run documents, data locations, and the status state machine
//! - [`store`]: the [`store::RunStore`] trait with SQLite and in-memory backends
//! - [`backend`]: SCP, GFAL, Rucio, and tape transfer backends
//! - [`checksum`]: SHA-512 content hashing of files and run directories
//! - [`tasks`]: the transfer, verify, stale, clear, and rule tasks
//! - [`scheduler`]: the polling loop tying the tasks together
//! - [`config`]: environment configuration and the host registry

#![deny(missing_docs)]

pub mod backend;
pub mod checksum;
pub mod config;
pub mod error;
pub mod model;
pub mod scheduler;
pub mod store;
pub mod tasks;

pub use error::{CaxError, Result};
