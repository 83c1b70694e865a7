use serde::{Deserialize, Serialize};

use crate::error::{RecStoreError, RecStoreResult};

/// Primary key of a record. Zero is reserved for tombstones.
pub type Key = i64;
/// Byte position of a record inside its data file.
pub type Offset = u64;

pub const TOMBSTONE_KEY: Key = 0;
pub const KEY_SIZE: usize = std::mem::size_of::<Key>();

pub fn check_live_key(key: Key) -> RecStoreResult<()> {
    if key == TOMBSTONE_KEY {
        return Err(RecStoreError::InvalidArgument(
            "key 0 is reserved for deleted records".to_string(),
        ));
    }
    Ok(())
}

/// Byte widths of the non-key fields of a fixed-width record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordLayout {
    pub field_widths: Vec<usize>,
}

impl RecordLayout {
    pub fn new(field_widths: Vec<usize>) -> Self {
        Self { field_widths }
    }

    pub fn uniform(count: usize, width: usize) -> Self {
        Self {
            field_widths: vec![width; count],
        }
    }

    pub fn payload_size(&self) -> usize {
        self.field_widths.iter().sum()
    }

    /// Key plus every field.
    pub fn slot_size(&self) -> usize {
        KEY_SIZE + self.payload_size()
    }
}

#[derive(derive_new::new, Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Key,
    pub payload: Vec<u8>,
}

impl Record {
    /// Builds a fixed-width record; each field is truncated or zero-padded to its slot.
    pub fn from_fields(key: Key, fields: &[&str], layout: &RecordLayout) -> RecStoreResult<Self> {
        if fields.len() > layout.field_widths.len() {
            return Err(RecStoreError::InvalidArgument(format!(
                "{} fields given, layout has {}",
                fields.len(),
                layout.field_widths.len()
            )));
        }
        let mut payload = vec![0u8; layout.payload_size()];
        let mut start = 0;
        for (idx, width) in layout.field_widths.iter().enumerate() {
            if let Some(field) = fields.get(idx) {
                let mut len = field.len().min(*width);
                // never cut a multi-byte character in half
                while !field.is_char_boundary(len) {
                    len -= 1;
                }
                payload[start..start + len].copy_from_slice(&field.as_bytes()[..len]);
            }
            start += width;
        }
        Ok(Record { key, payload })
    }

    /// Record for the length-prefixed format.
    pub fn text(key: Key, text: &str) -> Self {
        Record {
            key,
            payload: text.as_bytes().to_vec(),
        }
    }

    pub fn tombstone(payload_len: usize) -> Self {
        Record {
            key: TOMBSTONE_KEY,
            payload: vec![0u8; payload_len],
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.key == TOMBSTONE_KEY
    }

    /// Splits the payload by `layout`, dropping the zero padding of each field.
    pub fn fields(&self, layout: &RecordLayout) -> Vec<String> {
        let mut out = Vec::with_capacity(layout.field_widths.len());
        let mut start = 0;
        for width in layout.field_widths.iter() {
            let end = (start + width).min(self.payload.len());
            let raw = self.payload.get(start..end).unwrap_or(&[]);
            let used = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
            out.push(String::from_utf8_lossy(&raw[..used]).into_owned());
            start += width;
        }
        out
    }

    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::{check_live_key, Record, RecordLayout};

    #[test]
    fn fields_are_padded_and_truncated() {
        let layout = RecordLayout::new(vec![4, 8]);
        assert_eq!(layout.slot_size(), 20);

        let record = Record::from_fields(3, &["abcdef", "xy"], &layout).unwrap();
        assert_eq!(record.payload.len(), 12);
        assert_eq!(record.fields(&layout), vec!["abcd", "xy"]);
    }

    #[test]
    fn truncation_keeps_whole_characters() {
        let layout = RecordLayout::new(vec![4, 3]);
        // 'é' is two bytes and would straddle the 4-byte width
        let record = Record::from_fields(1, &["abcé", "日本"], &layout).unwrap();
        assert_eq!(record.fields(&layout), vec!["abc", "日"]);
        assert!(record.fields(&layout).iter().all(|f| !f.contains('\u{FFFD}')));
    }

    #[test]
    fn missing_fields_stay_empty() {
        let layout = RecordLayout::uniform(3, 5);
        let record = Record::from_fields(1, &["a"], &layout).unwrap();
        assert_eq!(record.fields(&layout), vec!["a", "", ""]);
        assert!(Record::from_fields(1, &["a", "b", "c", "d"], &layout).is_err());
    }

    #[test]
    fn zero_key_is_rejected() {
        assert!(check_live_key(0).is_err());
        assert!(check_live_key(-5).is_ok());
        assert!(Record::tombstone(10).is_tombstone());
    }
}
