//! Storage Module
//!
//! Durable snapshots of the key map.
//!
//! ## Responsibilities
//! - Persist a full image of the map at a WAL position
//! - Atomic replacement (temp file + rename + directory sync)
//! - CRC validation on load
//!
//! The WAL only has to be replayed from the checkpoint position onward, and
//! segments fully covered by a checkpoint may be discarded.

mod checkpoint;

pub use checkpoint::{Checkpoint, CHECKPOINT_FILE};
