//! Point-in-time shard snapshot blobs.
//!
//! # Blob Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │ MAGIC: [u8; 4] = "FRSN"                         │
//! ├─────────────────────────────────────────────────┤
//! │ VERSION: u32 = 1                                │
//! ├─────────────────────────────────────────────────┤
//! │ FLAGS: u32                                      │
//! │   bit 0: body compressed (LZ4)                  │
//! ├─────────────────────────────────────────────────┤
//! │ LINEAGE: [u8; 16] (write-history id)            │
//! ├─────────────────────────────────────────────────┤
//! │ SEQUENCE: u64 (last WAL record included)        │
//! ├─────────────────────────────────────────────────┤
//! │ POINT_COUNT: u64                                │
//! ├─────────────────────────────────────────────────┤
//! │ BODY_LEN: u64 (stored body length)              │
//! ├─────────────────────────────────────────────────┤
//! │ RESERVED: [u8; 4]                               │
//! ├─────────────────────────────────────────────────┤
//! │ BODY: bincode(Vec<Point>), maybe LZ4 compressed │
//! ├─────────────────────────────────────────────────┤
//! │ CRC32: u32 over header + body                   │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little endian. Header size is 56 bytes.

use crate::error::{Error, Result};
use crate::types::{Point, SeqNo};
use bytes::Bytes;
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Magic number for snapshot blobs.
pub const MAGIC: [u8; 4] = *b"FRSN";

/// Current format version.
pub const VERSION: u32 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 56;

/// Flag: body is LZ4 compressed.
pub const FLAG_COMPRESSED: u32 = 1 << 0;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Parsed snapshot header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub version: u32,
    pub flags: u32,
    /// Write history the snapshot was taken from.
    pub lineage: Uuid,
    /// Last WAL sequence reflected in the snapshot.
    pub seq: SeqNo,
    pub point_count: u64,
    pub body_len: u64,
}

impl SnapshotHeader {
    /// Check if the body is compressed.
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..28].copy_from_slice(self.lineage.as_bytes());
        buf[28..36].copy_from_slice(&self.seq.to_le_bytes());
        buf[36..44].copy_from_slice(&self.point_count.to_le_bytes());
        buf[44..52].copy_from_slice(&self.body_len.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Corrupt("snapshot header too short".into()));
        }
        if buf[0..4] != MAGIC {
            return Err(Error::Corrupt("invalid snapshot magic".into()));
        }

        let version = read_u32(&buf[4..8]);
        if version > VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported snapshot version {}",
                version
            )));
        }

        let mut lineage = [0u8; 16];
        lineage.copy_from_slice(&buf[12..28]);

        Ok(Self {
            version,
            flags: read_u32(&buf[8..12]),
            lineage: Uuid::from_bytes(lineage),
            seq: read_u64(&buf[28..36]),
            point_count: read_u64(&buf[36..44]),
            body_len: read_u64(&buf[44..52]),
        })
    }
}

fn read_u32(buf: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[..4]);
    u32::from_le_bytes(raw)
}

fn read_u64(buf: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[..8]);
    u64::from_le_bytes(raw)
}

/// Encoded snapshot of one shard replica.
///
/// Cheap to clone; the encoded bytes are shared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBlob {
    bytes: Bytes,
}

/// A decoded snapshot.
#[derive(Debug, Clone)]
pub struct DecodedSnapshot {
    pub header: SnapshotHeader,
    pub points: Vec<Point>,
}

impl SnapshotBlob {
    /// Encode points taken at `seq` from a replica with the given lineage.
    pub fn encode(lineage: Uuid, seq: SeqNo, points: &[Point], compress: bool) -> Result<Self> {
        let raw = bincode::serialize(points)
            .map_err(|e| Error::Internal(format!("snapshot encode: {}", e)))?;
        let body = if compress {
            lz4_flex::compress_prepend_size(&raw)
        } else {
            raw
        };

        let header = SnapshotHeader {
            version: VERSION,
            flags: if compress { FLAG_COMPRESSED } else { 0 },
            lineage,
            seq,
            point_count: points.len() as u64,
            body_len: body.len() as u64,
        };

        let mut buf = Vec::with_capacity(HEADER_SIZE + body.len() + 4);
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(&body);
        let crc = CRC32.checksum(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        Ok(Self { bytes: buf.into() })
    }

    /// Wrap raw bytes received from elsewhere. Validation happens on decode.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Raw encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Encoded length.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the blob holds no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Parse only the header.
    pub fn header(&self) -> Result<SnapshotHeader> {
        SnapshotHeader::from_bytes(&self.bytes)
    }

    /// Verify the checksum and decode all points.
    pub fn decode(&self) -> Result<DecodedSnapshot> {
        let header = self.header()?;
        let expected_len = HEADER_SIZE as u64 + header.body_len + 4;
        if self.bytes.len() as u64 != expected_len {
            return Err(Error::Corrupt(format!(
                "snapshot length {} does not match header ({})",
                self.bytes.len(),
                expected_len
            )));
        }

        let crc_at = self.bytes.len() - 4;
        let stored = read_u32(&self.bytes[crc_at..]);
        let actual = CRC32.checksum(&self.bytes[..crc_at]);
        if stored != actual {
            return Err(Error::Corrupt(format!(
                "snapshot checksum mismatch: expected {}, got {}",
                stored, actual
            )));
        }

        let body = &self.bytes[HEADER_SIZE..crc_at];
        let raw = if header.is_compressed() {
            lz4_flex::decompress_size_prepended(body)
                .map_err(|e| Error::Corrupt(format!("snapshot decompression: {}", e)))?
        } else {
            body.to_vec()
        };

        let points: Vec<Point> = bincode::deserialize(&raw)
            .map_err(|e| Error::Corrupt(format!("snapshot body: {}", e)))?;
        if points.len() as u64 != header.point_count {
            return Err(Error::Corrupt(format!(
                "snapshot holds {} points, header says {}",
                points.len(),
                header.point_count
            )));
        }

        Ok(DecodedSnapshot { header, points })
    }

    /// Stage the blob in a file (write to a temp name, then rename).
    pub async fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &self.bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Load a staged blob.
    pub async fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let data = tokio::fs::read(path.as_ref()).await?;
        Ok(Self::from_bytes(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_points() -> Vec<Point> {
        (0..50)
            .map(|i| Point::new(i, vec![i as f32; 4]).with_payload("n", i.to_string()))
            .collect()
    }

    #[test]
    fn test_encode_decode_compressed() {
        let lineage = Uuid::new_v4();
        let blob = SnapshotBlob::encode(lineage, 42, &sample_points(), true).unwrap();

        let decoded = blob.decode().unwrap();
        assert!(decoded.header.is_compressed());
        assert_eq!(decoded.header.lineage, lineage);
        assert_eq!(decoded.header.seq, 42);
        assert_eq!(decoded.points, sample_points());
    }

    #[test]
    fn test_empty_snapshot() {
        let blob = SnapshotBlob::encode(Uuid::nil(), 0, &[], false).unwrap();
        let decoded = blob.decode().unwrap();
        assert_eq!(decoded.header.point_count, 0);
        assert!(decoded.points.is_empty());
    }

    #[test]
    fn test_flipped_byte_is_corrupt() {
        let blob = SnapshotBlob::encode(Uuid::new_v4(), 7, &sample_points(), true).unwrap();
        let mut bytes = blob.as_bytes().to_vec();
        let middle = HEADER_SIZE + 10;
        bytes[middle] ^= 0xFF;

        let err = SnapshotBlob::from_bytes(bytes).decode().unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_truncated_blob_is_corrupt() {
        let blob = SnapshotBlob::encode(Uuid::new_v4(), 7, &sample_points(), false).unwrap();
        let bytes = blob.as_bytes()[..blob.len() - 9].to_vec();
        assert!(matches!(
            SnapshotBlob::from_bytes(bytes).decode(),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_invalid_magic() {
        let blob = SnapshotBlob::from_bytes(vec![0u8; HEADER_SIZE + 4]);
        assert!(matches!(blob.header(), Err(Error::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard-3.snapshot");
        let blob = SnapshotBlob::encode(Uuid::new_v4(), 3, &sample_points(), true).unwrap();

        blob.write_to(&path).await.unwrap();
        let loaded = SnapshotBlob::read_from(&path).await.unwrap();
        assert_eq!(loaded, blob);
    }
}
