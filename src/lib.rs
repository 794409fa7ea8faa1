//! # HarborKV
//!
//! A crash-safe, replicated key-value store with:
//! - Write-Ahead Logging (WAL) with CRC-checked records and crash recovery
//! - Atomic bulk writes (all keys visible or none, across crashes)
//! - A change feed for derived indexes
//! - Primary-secondary replication with leader election and log shipping
//! - Masterless replication with quorum reads/writes, version vectors and
//!   anti-entropy
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 TCP Server (clients + peers)                │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │        Controller (standalone / primary / masterless)       │──▶ Transport
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                        Engine                               │
//! │            (Single Writer / Multi Reader)                   │
//! └──────┬──────────────────┬──────────────────┬────────────────┘
//!        │                  │                  │
//!        ▼                  ▼                  ▼
//!   ┌─────────┐      ┌─────────────┐    ┌─────────────┐
//!   │   WAL   │      │  MemTable   │    │ Change feed │
//!   │(Append) │      │  (RwLock)   │    │ (channels)  │
//!   └────┬────┘      └─────────────┘    └─────────────┘
//!        ▼
//!   ┌──────────────┐
//!   │  Checkpoint  │
//!   └──────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod config;
pub mod error;

pub mod cluster;
pub mod engine;
pub mod feed;
pub mod memtable;
pub mod network;
pub mod protocol;
pub mod storage;
pub mod wal;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::Config;
pub use engine::Engine;
pub use error::{HarborError, Result};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of HarborKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
