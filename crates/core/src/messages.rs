//! Values exchanged between the engine and its replicas

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::client::ClientId;
use crate::file::FileId;
use crate::hash::{QuickDigest, SlowDigest};

/// A replica's digests for one region it holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRegionReport {
    pub client_id: ClientId,
    pub file_id: FileId,
    pub offset: u64,
    pub size: u64,
    pub quick_digest: Option<QuickDigest>,
    pub slow_digest: Option<SlowDigest>,
}

/// One entry of a fast digest batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastDigestReport {
    pub client_id: ClientId,
    pub file_id: FileId,
    pub offset: u64,
    pub quick_digest: QuickDigest,
}

/// One entry of a slow digest batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowDigestReport {
    pub client_id: ClientId,
    pub file_id: FileId,
    pub offset: u64,
    pub slow_digest: SlowDigest,
}

/// Bytes of one region handed to a polling replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionPayload {
    pub file_id: FileId,
    pub offset: u64,
    pub size: u64,
    pub data: Bytes,
}

/// Per-file progress as seen from one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProgress {
    pub file_id: FileId,
    pub name: String,
    pub synced_percent: u8,
    pub metadata_received_percent: u8,
    pub fast_up_to_date_percent: u8,
    pub slow_up_to_date_percent: u8,
}
