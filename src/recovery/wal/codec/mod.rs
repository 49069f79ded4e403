use std::convert::TryFrom;

use crc32fast::Hasher;

use crate::error::{GistError, GistResult};
use crate::recovery::Lsn;

pub const WAL_MAGIC: u32 = 0x5157_414c; // "QWAL" (LE)
pub const WAL_VERSION: u16 = 3;
pub const WAL_HEADER_LEN: usize = 4 + 2 + 8 + 8 + 1 + 1 + 4;
pub const WAL_CRC_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResourceManagerId {
    Xlog = 0,
    Gist = 1,
}

impl TryFrom<u8> for ResourceManagerId {
    type Error = GistError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResourceManagerId::Xlog),
            1 => Ok(ResourceManagerId::Gist),
            other => Err(GistError::Wal(format!(
                "Unknown WAL resource manager id: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalFrame {
    /// Position of the first byte of the frame.
    pub lsn: Lsn,
    /// Position just past the frame; page LSNs are stamped with this value.
    pub end_lsn: Lsn,
    pub prev_lsn: Lsn,
    pub rmid: ResourceManagerId,
    pub info: u8,
    pub body: Vec<u8>,
}

pub fn frame_len(body_len: usize) -> usize {
    WAL_HEADER_LEN + body_len + WAL_CRC_LEN
}

pub fn build_frame(
    lsn: Lsn,
    prev_lsn: Lsn,
    rmid: ResourceManagerId,
    info: u8,
    body_bytes: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(frame_len(body_bytes.len()));
    frame.extend_from_slice(&WAL_MAGIC.to_le_bytes());
    frame.extend_from_slice(&WAL_VERSION.to_le_bytes());
    frame.extend_from_slice(&lsn.to_le_bytes());
    frame.extend_from_slice(&prev_lsn.to_le_bytes());
    frame.push(rmid as u8);
    frame.push(info);
    frame.extend_from_slice(&(body_bytes.len() as u32).to_le_bytes());
    frame.extend_from_slice(body_bytes);

    let mut hasher = Hasher::new();
    hasher.update(&frame);
    let crc = hasher.finalize();
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// Decodes one frame from the head of `bytes`, returning it with its length.
pub fn decode_frame(bytes: &[u8]) -> GistResult<(WalFrame, usize)> {
    if bytes.len() < WAL_HEADER_LEN + WAL_CRC_LEN {
        return Err(GistError::Wal(
            "WAL frame too short to contain header".to_string(),
        ));
    }
    let magic = read_u32(bytes, 0);
    if magic != WAL_MAGIC {
        return Err(GistError::Wal(format!("Invalid WAL magic: {:x}", magic)));
    }
    let version = read_u16(bytes, 4);
    if version != WAL_VERSION {
        return Err(GistError::Wal(format!(
            "Unsupported WAL version: {}",
            version
        )));
    }
    let lsn = read_u64(bytes, 6);
    let prev_lsn = read_u64(bytes, 14);
    let rmid = ResourceManagerId::try_from(bytes[22])?;
    let info = bytes[23];
    let body_len = read_u32(bytes, 24) as usize;
    let total_len = frame_len(body_len);
    if bytes.len() < total_len {
        return Err(GistError::Wal(
            "WAL frame truncated before body end".to_string(),
        ));
    }

    let body = &bytes[WAL_HEADER_LEN..WAL_HEADER_LEN + body_len];
    let expected_crc = read_u32(bytes, WAL_HEADER_LEN + body_len);
    let mut hasher = Hasher::new();
    hasher.update(&bytes[0..WAL_HEADER_LEN + body_len]);
    if expected_crc != hasher.finalize() {
        return Err(GistError::Wal("CRC mismatch for WAL frame".to_string()));
    }

    Ok((
        WalFrame {
            lsn,
            end_lsn: lsn + total_len as Lsn,
            prev_lsn,
            rmid,
            info,
            body: body.to_vec(),
        },
        total_len,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupted_frame_is_rejected() {
        let mut frame = build_frame(64, 16, ResourceManagerId::Gist, 0x21, b"split");
        let (decoded, len) = decode_frame(&frame).unwrap();
        assert_eq!(len, frame.len());
        assert_eq!(decoded.end_lsn, 64 + frame.len() as Lsn);
        assert_eq!(decoded.info, 0x21);
        assert_eq!(decoded.body, b"split");

        let last = frame.len() - 6;
        frame[last] ^= 0x01;
        assert!(decode_frame(&frame).is_err());
        assert!(decode_frame(&frame[..10]).is_err());
    }
}
