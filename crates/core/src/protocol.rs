//! Binary protocol between replicas and the server
//!
//! Wire format (all integers are big-endian):
//!
//! Request/Response frame:
//! ```text
//! +--------+--------+------------------+
//! | type   | length | payload          |
//! | 1 byte | 4 bytes| variable         |
//! +--------+--------+------------------+
//! ```
//!
//! Every request frame is answered by exactly one response frame.
//!
//! Message types:
//! - 0x01: Introduce request (no payload)
//! - 0x02: Introduced (client_id:4)
//! - 0x03: ListFiles request (no payload)
//! - 0x04: FileList (count:4, (id:4, path_len:2, path, size:8, mtime_secs:8, mtime_nanos:4)*count)
//! - 0x05: Ok response (no payload)
//! - 0x06: Error response (code:1, id:4, offset:8, path_len:2, path, message)
//! - 0x10: ClientRegion (client:4, file:4, offset:8, size:8, flags:1, [quick:4], [slow:32])
//! - 0x11: FastDigests (count:4, (client:4, file:4, offset:8, quick:4)*count)
//! - 0x12: SlowDigests (count:4, (client:4, file:4, offset:8, slow:32)*count)
//! - 0x13: BlankFile (client:4, file:4)
//! - 0x20: Poll request (client:4, timeout_ms:4)
//! - 0x21: RegionData (file:4, offset:8, size:8, data)
//! - 0x22: NothingToTransfer (no payload)
//! - 0x30: Progress request (client:4)
//! - 0x31: Progress response (JSON array)

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};

use crate::client::ClientId;
use crate::error::{StateInconsistency, SyncError};
use crate::file::{FileId, FileMetadata};
use crate::hash::SlowDigest;
use crate::messages::{
    ClientRegionReport, FastDigestReport, FileProgress, RegionPayload, SlowDigestReport,
};

/// Largest payload accepted; a region plus its header fits well inside
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Frame header size (type + length)
pub const HEADER_LEN: usize = 5;

/// Largest region whose RegionData frame (file:4, offset:8, size:8, data) fits
pub const MAX_REGION_SIZE: u64 = MAX_FRAME_LEN as u64 - 20;

/// Message type identifiers
pub mod msg {
    pub const INTRODUCE: u8 = 0x01;
    pub const INTRODUCED: u8 = 0x02;
    pub const LIST_FILES: u8 = 0x03;
    pub const FILE_LIST: u8 = 0x04;
    pub const OK: u8 = 0x05;
    pub const ERROR: u8 = 0x06;
    // Digest reports
    pub const CLIENT_REGION: u8 = 0x10;
    pub const FAST_DIGESTS: u8 = 0x11;
    pub const SLOW_DIGESTS: u8 = 0x12;
    pub const BLANK_FILE: u8 = 0x13;
    // Region transfer
    pub const POLL: u8 = 0x20;
    pub const REGION_DATA: u8 = 0x21;
    pub const NOTHING_TO_TRANSFER: u8 = 0x22;
    // Status
    pub const PROGRESS_REQ: u8 = 0x30;
    pub const PROGRESS: u8 = 0x31;
}

/// Error codes carried by an error frame
mod code {
    pub const IO: u8 = 1;
    pub const TRANSPORT: u8 = 2;
    pub const UNKNOWN_CLIENT: u8 = 3;
    pub const UNKNOWN_FILE: u8 = 4;
    pub const REGION_MISMATCH: u8 = 5;
}

const HAS_QUICK: u8 = 0b01;
const HAS_SLOW: u8 = 0b10;

/// Message sent or received over the protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Introduce,
    Introduced { client_id: ClientId },
    ListFiles,
    FileList(Vec<FileMetadata>),
    Ok,
    Error(WireError),
    ClientRegion(ClientRegionReport),
    FastDigests(Vec<FastDigestReport>),
    SlowDigests(Vec<SlowDigestReport>),
    BlankFile { client_id: ClientId, file_id: FileId },
    Poll { client_id: ClientId, timeout_ms: u32 },
    RegionData(RegionPayload),
    NothingToTransfer,
    ProgressReq { client_id: ClientId },
    Progress(Vec<FileProgress>),
}

/// A [`SyncError`] flattened for the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireError {
    code: u8,
    id: i32,
    offset: u64,
    path: PathBuf,
    message: String,
}

impl From<&SyncError> for WireError {
    fn from(err: &SyncError) -> Self {
        let mut wire = Self {
            code: code::TRANSPORT,
            id: 0,
            offset: 0,
            path: PathBuf::new(),
            message: err.to_string(),
        };
        match err {
            SyncError::Io { path, source } => {
                wire.code = code::IO;
                wire.path.clone_from(path);
                wire.message = source.to_string();
            }
            SyncError::Transport(message) => wire.message.clone_from(message),
            SyncError::State(StateInconsistency::UnknownClient(id)) => {
                wire.code = code::UNKNOWN_CLIENT;
                wire.id = *id;
            }
            SyncError::State(StateInconsistency::UnknownFile(id)) => {
                wire.code = code::UNKNOWN_FILE;
                wire.id = *id;
            }
            SyncError::State(StateInconsistency::RegionMismatch { file_id, offset }) => {
                wire.code = code::REGION_MISMATCH;
                wire.id = *file_id;
                wire.offset = *offset;
            }
        }
        wire
    }
}

impl From<WireError> for SyncError {
    fn from(wire: WireError) -> Self {
        match wire.code {
            code::IO => SyncError::io(wire.path, std::io::Error::other(wire.message)),
            code::UNKNOWN_CLIENT => StateInconsistency::UnknownClient(wire.id).into(),
            code::UNKNOWN_FILE => StateInconsistency::UnknownFile(wire.id).into(),
            code::REGION_MISMATCH => StateInconsistency::RegionMismatch {
                file_id: wire.id,
                offset: wire.offset,
            }
            .into(),
            _ => SyncError::Transport(wire.message),
        }
    }
}

impl Message {
    /// Error frame for `err`
    #[must_use]
    pub fn error(err: &SyncError) -> Self {
        Self::Error(err.into())
    }

    /// Message type byte
    #[must_use]
    pub fn kind(&self) -> u8 {
        match self {
            Self::Introduce => msg::INTRODUCE,
            Self::Introduced { .. } => msg::INTRODUCED,
            Self::ListFiles => msg::LIST_FILES,
            Self::FileList(_) => msg::FILE_LIST,
            Self::Ok => msg::OK,
            Self::Error(_) => msg::ERROR,
            Self::ClientRegion(_) => msg::CLIENT_REGION,
            Self::FastDigests(_) => msg::FAST_DIGESTS,
            Self::SlowDigests(_) => msg::SLOW_DIGESTS,
            Self::BlankFile { .. } => msg::BLANK_FILE,
            Self::Poll { .. } => msg::POLL,
            Self::RegionData(_) => msg::REGION_DATA,
            Self::NothingToTransfer => msg::NOTHING_TO_TRANSFER,
            Self::ProgressReq { .. } => msg::PROGRESS_REQ,
            Self::Progress(_) => msg::PROGRESS,
        }
    }

    /// Encode the payload (without header)
    ///
    /// # Errors
    /// Returns an error if a progress report cannot be serialized
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Self::Introduce | Self::ListFiles | Self::Ok | Self::NothingToTransfer => {}
            Self::Introduced { client_id } => put_i32(&mut buf, *client_id),
            Self::FileList(files) => {
                put_u32(&mut buf, files.len() as u32);
                for file in files {
                    put_i32(&mut buf, file.id);
                    buf.extend_from_slice(&encode_path(&file.name));
                    put_u64(&mut buf, file.size);
                    encode_time(&mut buf, file.modified);
                }
            }
            Self::Error(wire) => {
                buf.push(wire.code);
                put_i32(&mut buf, wire.id);
                put_u64(&mut buf, wire.offset);
                buf.extend_from_slice(&encode_path(&wire.path));
                buf.extend_from_slice(wire.message.as_bytes());
            }
            Self::ClientRegion(report) => {
                put_i32(&mut buf, report.client_id);
                put_i32(&mut buf, report.file_id);
                put_u64(&mut buf, report.offset);
                put_u64(&mut buf, report.size);
                let mut flags = 0;
                if report.quick_digest.is_some() {
                    flags |= HAS_QUICK;
                }
                if report.slow_digest.is_some() {
                    flags |= HAS_SLOW;
                }
                buf.push(flags);
                if let Some(quick) = report.quick_digest {
                    put_i32(&mut buf, quick);
                }
                if let Some(slow) = &report.slow_digest {
                    buf.extend_from_slice(slow.as_bytes());
                }
            }
            Self::FastDigests(batch) => {
                put_u32(&mut buf, batch.len() as u32);
                for entry in batch {
                    put_i32(&mut buf, entry.client_id);
                    put_i32(&mut buf, entry.file_id);
                    put_u64(&mut buf, entry.offset);
                    put_i32(&mut buf, entry.quick_digest);
                }
            }
            Self::SlowDigests(batch) => {
                put_u32(&mut buf, batch.len() as u32);
                for entry in batch {
                    put_i32(&mut buf, entry.client_id);
                    put_i32(&mut buf, entry.file_id);
                    put_u64(&mut buf, entry.offset);
                    buf.extend_from_slice(entry.slow_digest.as_bytes());
                }
            }
            Self::BlankFile { client_id, file_id } => {
                put_i32(&mut buf, *client_id);
                put_i32(&mut buf, *file_id);
            }
            Self::Poll {
                client_id,
                timeout_ms,
            } => {
                put_i32(&mut buf, *client_id);
                put_u32(&mut buf, *timeout_ms);
            }
            Self::RegionData(payload) => {
                put_i32(&mut buf, payload.file_id);
                put_u64(&mut buf, payload.offset);
                put_u64(&mut buf, payload.size);
                buf.extend_from_slice(&payload.data);
            }
            Self::ProgressReq { client_id } => put_i32(&mut buf, *client_id),
            Self::Progress(report) => serde_json::to_writer(&mut buf, report)?,
        }
        Ok(buf)
    }

    /// Encode a complete frame (header + payload)
    ///
    /// # Errors
    /// Returns an error if the payload cannot be encoded or is too large
    pub fn encode_frame(&self) -> Result<Vec<u8>> {
        let payload = self.encode_payload()?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_LEN)
            .ok_or_else(|| eyre!("frame of {} bytes exceeds limit", payload.len()))?;

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        write_header(&mut frame, self.kind(), len)?;
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode a payload of the given type
    ///
    /// # Errors
    /// Returns an error for unknown types or malformed payloads
    pub fn decode(msg_type: u8, payload: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(payload);
        let message = match msg_type {
            msg::INTRODUCE => Self::Introduce,
            msg::INTRODUCED => Self::Introduced {
                client_id: get_i32(&mut r)?,
            },
            msg::LIST_FILES => Self::ListFiles,
            msg::FILE_LIST => {
                let count = get_u32(&mut r)? as usize;
                let mut files = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    files.push(FileMetadata {
                        id: get_i32(&mut r)?,
                        name: decode_path(&mut r)?,
                        size: get_u64(&mut r)?,
                        modified: decode_time(&mut r)?,
                    });
                }
                Self::FileList(files)
            }
            msg::OK => Self::Ok,
            msg::ERROR => {
                let code = get_u8(&mut r)?;
                let id = get_i32(&mut r)?;
                let offset = get_u64(&mut r)?;
                let path = decode_path(&mut r)?;
                let mut rest = Vec::new();
                r.read_to_end(&mut rest)?;
                Self::Error(WireError {
                    code,
                    id,
                    offset,
                    path,
                    message: String::from_utf8_lossy(&rest).to_string(),
                })
            }
            msg::CLIENT_REGION => {
                let client_id = get_i32(&mut r)?;
                let file_id = get_i32(&mut r)?;
                let offset = get_u64(&mut r)?;
                let size = get_u64(&mut r)?;
                let flags = get_u8(&mut r)?;
                let quick_digest = if flags & HAS_QUICK != 0 {
                    Some(get_i32(&mut r)?)
                } else {
                    None
                };
                let slow_digest = if flags & HAS_SLOW != 0 {
                    Some(get_digest(&mut r)?)
                } else {
                    None
                };
                Self::ClientRegion(ClientRegionReport {
                    client_id,
                    file_id,
                    offset,
                    size,
                    quick_digest,
                    slow_digest,
                })
            }
            msg::FAST_DIGESTS => {
                let count = get_u32(&mut r)? as usize;
                let mut batch = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    batch.push(FastDigestReport {
                        client_id: get_i32(&mut r)?,
                        file_id: get_i32(&mut r)?,
                        offset: get_u64(&mut r)?,
                        quick_digest: get_i32(&mut r)?,
                    });
                }
                Self::FastDigests(batch)
            }
            msg::SLOW_DIGESTS => {
                let count = get_u32(&mut r)? as usize;
                let mut batch = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    batch.push(SlowDigestReport {
                        client_id: get_i32(&mut r)?,
                        file_id: get_i32(&mut r)?,
                        offset: get_u64(&mut r)?,
                        slow_digest: get_digest(&mut r)?,
                    });
                }
                Self::SlowDigests(batch)
            }
            msg::BLANK_FILE => Self::BlankFile {
                client_id: get_i32(&mut r)?,
                file_id: get_i32(&mut r)?,
            },
            msg::POLL => Self::Poll {
                client_id: get_i32(&mut r)?,
                timeout_ms: get_u32(&mut r)?,
            },
            msg::REGION_DATA => {
                let file_id = get_i32(&mut r)?;
                let offset = get_u64(&mut r)?;
                let size = get_u64(&mut r)?;
                let start = r.position() as usize;
                let data = Bytes::copy_from_slice(&payload[start..]);
                if data.len() as u64 != size {
                    bail!("region data carries {} bytes, header says {size}", data.len());
                }
                return Ok(Self::RegionData(RegionPayload {
                    file_id,
                    offset,
                    size,
                    data,
                }));
            }
            msg::NOTHING_TO_TRANSFER => Self::NothingToTransfer,
            msg::PROGRESS_REQ => Self::ProgressReq {
                client_id: get_i32(&mut r)?,
            },
            msg::PROGRESS => return Ok(Self::Progress(serde_json::from_slice(payload)?)),
            _ => bail!("Unknown message type: {msg_type:#04x}"),
        };

        if (r.position() as usize) != payload.len() {
            bail!(
                "{} trailing bytes after message type {msg_type:#04x}",
                payload.len() - r.position() as usize
            );
        }
        Ok(message)
    }
}

/// Write a frame header (type + length)
fn write_header<W: Write>(w: &mut W, msg_type: u8, len: u32) -> std::io::Result<()> {
    w.write_all(&[msg_type])?;
    w.write_all(&len.to_be_bytes())?;
    Ok(())
}

/// Split a raw header into (type, length), rejecting oversized frames
///
/// # Errors
/// Returns an error if the length exceeds [`MAX_FRAME_LEN`]
pub fn parse_header(header: [u8; HEADER_LEN]) -> Result<(u8, u32)> {
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_FRAME_LEN {
        bail!("frame of {len} bytes exceeds limit");
    }
    Ok((header[0], len))
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn get_u8<R: Read>(r: &mut R) -> std::io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn get_u32<R: Read>(r: &mut R) -> std::io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn get_i32<R: Read>(r: &mut R) -> std::io::Result<i32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(i32::from_be_bytes(b))
}

fn get_u64<R: Read>(r: &mut R) -> std::io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}

fn get_digest<R: Read>(r: &mut R) -> std::io::Result<SlowDigest> {
    let mut b = [0u8; 32];
    r.read_exact(&mut b)?;
    Ok(SlowDigest::from_raw(b))
}

/// Encode a path as length-prefixed bytes
fn encode_path(path: &Path) -> Vec<u8> {
    let path_bytes = path.to_string_lossy().as_bytes().to_vec();
    let len = path_bytes.len() as u16;
    let mut buf = Vec::with_capacity(2 + path_bytes.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&path_bytes);
    buf
}

/// Decode a path from reader
fn decode_path<R: Read>(r: &mut R) -> std::io::Result<PathBuf> {
    let mut len_buf = [0u8; 2];
    r.read_exact(&mut len_buf)?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut path_buf = vec![0u8; len];
    r.read_exact(&mut path_buf)?;

    Ok(PathBuf::from(
        String::from_utf8_lossy(&path_buf).to_string(),
    ))
}

/// Seconds (i64, may be negative) and nanos (u32) relative to the epoch
fn encode_time(buf: &mut Vec<u8>, time: SystemTime) {
    let (secs, nanos) = match time.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(e) => (-(e.duration().as_secs() as i64), 0),
    };
    buf.extend_from_slice(&secs.to_be_bytes());
    put_u32(buf, nanos);
}

fn decode_time<R: Read>(r: &mut R) -> std::io::Result<SystemTime> {
    let mut secs_buf = [0u8; 8];
    r.read_exact(&mut secs_buf)?;
    let secs = i64::from_be_bytes(secs_buf);
    let nanos = get_u32(r)?;
    if nanos >= 1_000_000_000 {
        return Err(invalid_data(format!("mtime nanos out of range: {nanos}")));
    }
    let time = if secs >= 0 {
        UNIX_EPOCH.checked_add(Duration::new(secs as u64, nanos))
    } else {
        UNIX_EPOCH.checked_sub(Duration::from_secs(secs.unsigned_abs()))
    };
    time.ok_or_else(|| invalid_data(format!("mtime out of range: {secs}s")))
}

fn invalid_data(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}
