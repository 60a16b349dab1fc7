//! Block scheduling
//!
//! Owns the needed-piece set, per-peer availability, and the outstanding
//! request table. Sessions never touch this state except through the
//! scheduler API.

pub mod request;
pub mod scheduler;

pub use request::{BlockKey, BlockReceipt, BlockRequest, PieceResolution};
pub use scheduler::{PieceScheduler, SchedulerConfig};
