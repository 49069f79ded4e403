use crate::error::{GistError, GistResult};
use crate::storage::codec::DecodedData;

/// Little-endian primitive codec shared by the WAL record bodies and the
/// on-page tuple layout.
pub struct CommonCodec;

fn short_input(have: usize, need: usize) -> GistError {
    GistError::Internal(format!("bytes length {} is less than {}", have, need))
}

impl CommonCodec {
    pub fn encode_u8(data: u8) -> Vec<u8> {
        vec![data]
    }

    pub fn decode_u8(bytes: &[u8]) -> GistResult<DecodedData<u8>> {
        match bytes.first() {
            Some(b) => Ok((*b, 1)),
            None => Err(short_input(0, 1)),
        }
    }

    pub fn encode_u16(data: u16) -> Vec<u8> {
        data.to_le_bytes().to_vec()
    }

    pub fn decode_u16(bytes: &[u8]) -> GistResult<DecodedData<u16>> {
        if bytes.len() < 2 {
            return Err(short_input(bytes.len(), 2));
        }
        Ok((u16::from_le_bytes([bytes[0], bytes[1]]), 2))
    }

    pub fn encode_u32(data: u32) -> Vec<u8> {
        data.to_le_bytes().to_vec()
    }

    pub fn decode_u32(bytes: &[u8]) -> GistResult<DecodedData<u32>> {
        if bytes.len() < 4 {
            return Err(short_input(bytes.len(), 4));
        }
        let data = [bytes[0], bytes[1], bytes[2], bytes[3]];
        Ok((u32::from_le_bytes(data), 4))
    }

    pub fn encode_u64(data: u64) -> Vec<u8> {
        data.to_le_bytes().to_vec()
    }

    pub fn decode_u64(bytes: &[u8]) -> GistResult<DecodedData<u64>> {
        if bytes.len() < 8 {
            return Err(short_input(bytes.len(), 8));
        }
        let mut data = [0u8; 8];
        data.copy_from_slice(&bytes[..8]);
        Ok((u64::from_le_bytes(data), 8))
    }

    pub fn encode_i64(data: i64) -> Vec<u8> {
        data.to_le_bytes().to_vec()
    }

    pub fn decode_i64(bytes: &[u8]) -> GistResult<DecodedData<i64>> {
        let (raw, len) = Self::decode_u64(bytes)?;
        Ok((raw as i64, len))
    }

    pub fn encode_f64(data: f64) -> Vec<u8> {
        data.to_le_bytes().to_vec()
    }

    pub fn decode_f64(bytes: &[u8]) -> GistResult<DecodedData<f64>> {
        let (raw, len) = Self::decode_u64(bytes)?;
        Ok((f64::from_bits(raw), len))
    }

    pub fn encode_bytes(data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + data.len());
        bytes.extend(CommonCodec::encode_u32(data.len() as u32));
        bytes.extend_from_slice(data);
        bytes
    }

    pub fn decode_bytes(bytes: &[u8]) -> GistResult<DecodedData<Vec<u8>>> {
        let (length, offset) = CommonCodec::decode_u32(bytes)?;
        let length = length as usize;
        if bytes.len() < offset + length {
            return Err(short_input(bytes.len(), offset + length));
        }
        Ok((bytes[offset..offset + length].to_vec(), offset + length))
    }
}

#[cfg(test)]
mod tests {
    use super::CommonCodec;

    #[test]
    fn integers_are_little_endian() {
        assert_eq!(CommonCodec::encode_u32(0x0102_0304), vec![4, 3, 2, 1]);
        assert_eq!(CommonCodec::encode_u16(0xFF81), vec![0x81, 0xFF]);
    }

    #[test]
    fn short_input_is_rejected() {
        assert!(CommonCodec::decode_u64(&[1, 2, 3]).is_err());
        assert!(CommonCodec::decode_bytes(&[5, 0, 0, 0, 1]).is_err());
        let (v, n) = CommonCodec::decode_bytes(&[2, 0, 0, 0, 7, 8, 9]).unwrap();
        assert_eq!((v, n), (vec![7, 8], 6));
    }
}
