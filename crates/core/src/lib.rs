//! driftsync-core: region-based differential sync engine
//!
//! Splits files into fixed-size regions, keeps fast (sampled) and slow
//! (SHA-256) digests per region, and ships only the regions a replica's
//! digests say are stale.

pub mod client;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod fast;
pub mod file;
pub mod finder;
pub mod hash;
pub mod io;
pub mod messages;
pub mod protocol;
pub mod queue;
pub mod region;
pub mod replica;
pub mod scan;
pub mod service;
pub mod slow;
pub mod stats;
pub mod status;

pub use client::{Client, ClientId, ClientRegistry, TransferCandidate};
pub use config::{EngineConfig, ReplicaConfig, SyncConfig};
pub use directory::{DirectoryScanner, ScanMode};
pub use engine::SyncEngine;
pub use error::{Result, StateInconsistency, SyncError};
pub use file::{FileId, FileMetadata, FileRegistry, TrackedFile};
pub use hash::{QuickDigest, SlowDigest};
pub use messages::{
    ClientRegionReport, FastDigestReport, FileProgress, RegionPayload, SlowDigestReport,
};
pub use protocol::Message;
pub use region::{ChunkMode, Region, RegionCalculator};
pub use replica::Replica;
pub use scan::Scanner;
pub use service::SyncService;
pub use stats::Statistics;
