//! # NetCache Sync Protocol
//!
//! Data types exchanged between NetCache peers while synchronizing slots.
//!
//! This crate provides:
//! - Identifier aliases (`ServerId`, `SlotId`, `RecNo`, `SyncId`)
//! - `BlobSummary` and the ordered per-slot `BlobList`
//! - Operation-log events (`SyncEvent`) and their reduced per-key form
//! - Session modes, task outcomes and action kinds
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod blob;
mod event;
mod outcome;
mod types;

pub use blob::{BlobList, BlobSummary};
pub use event::{EventDiff, EventType, ReducedEvents, RemoteEventPair, SyncEvent};
pub use outcome::{ActionKind, SyncMode, SyncOutcome};
pub use types::{RecNo, ServerId, SlotId, SyncId};
