//! VoltDB: three-tier memory and retrieval engine for tensor frames.
//!
//! Frames (16 slots × 4 resolutions × 256 dims) are written through a
//! WAL-backed LSM storage engine, indexed by strand, vector, time and
//! concept, and placed in a fast / medium / slow tier hierarchy that a
//! background bleed engine keeps balanced.

pub mod bleed;
pub mod codebook;
pub mod config;
pub mod db;
pub mod error;
pub mod frame;
pub mod gc;
pub mod index;
pub mod metrics;
pub mod registry;
pub mod resource;
pub mod storage;
pub mod tier;
pub mod wisdom;

pub use codebook::Codebook;
pub use config::VoltConfig;
pub use db::{Query, RecallHit, RecallResult, Status, VoltDb};
pub use error::{Result, VoltError};
pub use frame::{DecayLevel, Entry, Frame, FrameId, StrandId};
pub use tier::Tier;
pub use wisdom::WisdomReport;
