use crate::error::{RecStoreError, RecStoreResult};

// data + consumed offset
pub type DecodedData<T> = (T, usize);

/// Little-endian primitives shared by both record file formats.
pub struct CommonCodec;

impl CommonCodec {
    pub fn encode_u16(data: u16) -> Vec<u8> {
        data.to_le_bytes().to_vec()
    }

    pub fn decode_u16(bytes: &[u8]) -> RecStoreResult<DecodedData<u16>> {
        if bytes.len() < 2 {
            return Err(RecStoreError::Corrupt(format!(
                "bytes length {} is less than {}",
                bytes.len(),
                2
            )));
        }
        Ok((u16::from_le_bytes([bytes[0], bytes[1]]), 2))
    }

    pub fn encode_u32(data: u32) -> Vec<u8> {
        data.to_le_bytes().to_vec()
    }

    pub fn decode_u32(bytes: &[u8]) -> RecStoreResult<DecodedData<u32>> {
        if bytes.len() < 4 {
            return Err(RecStoreError::Corrupt(format!(
                "bytes length {} is less than {}",
                bytes.len(),
                4
            )));
        }
        let data = [bytes[0], bytes[1], bytes[2], bytes[3]];
        Ok((u32::from_le_bytes(data), 4))
    }

    pub fn encode_i64(data: i64) -> Vec<u8> {
        data.to_le_bytes().to_vec()
    }

    pub fn decode_i64(bytes: &[u8]) -> RecStoreResult<DecodedData<i64>> {
        if bytes.len() < 8 {
            return Err(RecStoreError::Corrupt(format!(
                "bytes length {} is less than {}",
                bytes.len(),
                8
            )));
        }
        let mut data = [0u8; 8];
        data.copy_from_slice(&bytes[..8]);
        Ok((i64::from_le_bytes(data), 8))
    }
}

#[cfg(test)]
mod tests {
    use super::CommonCodec;

    #[test]
    fn decode_rejects_truncated_input() {
        assert!(CommonCodec::decode_i64(&[1, 2, 3]).is_err());
        assert!(CommonCodec::decode_u16(&[1]).is_err());
        assert!(CommonCodec::decode_u32(&[]).is_err());
    }

    #[test]
    fn decode_reports_consumed_bytes() {
        let mut bytes = CommonCodec::encode_i64(-42);
        bytes.extend(CommonCodec::encode_u16(7));
        let (key, offset) = CommonCodec::decode_i64(&bytes).unwrap();
        assert_eq!((key, offset), (-42, 8));
        let (len, consumed) = CommonCodec::decode_u16(&bytes[offset..]).unwrap();
        assert_eq!((len, consumed), (7, 2));
    }
}
