//! WAL record payloads
//!
//! One payload kind exists today: a batch of created series. Layout,
//! little-endian:
//!
//! ```text
//! | type (4) | tsid (8) t (8) num_labels (2) | len (2) name | len (2) value | ... | ...
//! ```

use crate::labels::{Label, Tsid};
use crate::{IndexError, Result};

pub const LRT_NONE: u32 = 0;
pub const LRT_SERIES: u32 = 1;

/// One series creation carried by a WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRecord {
    pub tsid: Tsid,
    pub timestamp: u64,
    pub labels: Vec<Label>,
}

impl SeriesRecord {
    pub fn new(tsid: Tsid, timestamp: u64, labels: Vec<Label>) -> Self {
        Self {
            tsid,
            timestamp,
            labels,
        }
    }
}

pub fn record_type(buf: &[u8]) -> u32 {
    if buf.len() < 4 {
        return LRT_NONE;
    }
    match u32::from_le_bytes(buf[..4].try_into().unwrap()) {
        LRT_SERIES => LRT_SERIES,
        _ => LRT_NONE,
    }
}

pub fn serialize_series(batch: &[SeriesRecord]) -> Vec<u8> {
    let mut size = 4;
    for rec in batch {
        size += 8 + 8 + 2;
        for label in &rec.labels {
            size += 2 + label.name.len() + 2 + label.value.len();
        }
    }

    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&LRT_SERIES.to_le_bytes());
    for rec in batch {
        buf.extend_from_slice(&rec.tsid.to_le_bytes());
        buf.extend_from_slice(&rec.timestamp.to_le_bytes());
        buf.extend_from_slice(&(rec.labels.len() as u16).to_le_bytes());
        for label in &rec.labels {
            buf.extend_from_slice(&(label.name.len() as u16).to_le_bytes());
            buf.extend_from_slice(label.name.as_bytes());
            buf.extend_from_slice(&(label.value.len() as u16).to_le_bytes());
            buf.extend_from_slice(label.value.as_bytes());
        }
    }
    buf
}

pub fn deserialize_series(buf: &[u8]) -> Result<Vec<SeriesRecord>> {
    let mut pos = 4usize;
    let mut out = Vec::new();

    let take = |pos: &mut usize, n: usize| -> Result<&[u8]> {
        if *pos + n > buf.len() {
            return Err(IndexError::corrupt("truncated series record"));
        }
        let slice = &buf[*pos..*pos + n];
        *pos += n;
        Ok(slice)
    };

    while pos < buf.len() {
        let tsid = u64::from_le_bytes(take(&mut pos, 8)?.try_into().unwrap());
        let timestamp = u64::from_le_bytes(take(&mut pos, 8)?.try_into().unwrap());
        let num_labels = u16::from_le_bytes(take(&mut pos, 2)?.try_into().unwrap());

        let mut labels = Vec::with_capacity(num_labels as usize);
        for _ in 0..num_labels {
            let nlen = u16::from_le_bytes(take(&mut pos, 2)?.try_into().unwrap()) as usize;
            let name = std::str::from_utf8(take(&mut pos, nlen)?)
                .map_err(|_| IndexError::corrupt("series record label is not UTF-8"))?
                .to_owned();
            let vlen = u16::from_le_bytes(take(&mut pos, 2)?.try_into().unwrap()) as usize;
            let value = std::str::from_utf8(take(&mut pos, vlen)?)
                .map_err(|_| IndexError::corrupt("series record label is not UTF-8"))?
                .to_owned();
            labels.push(Label { name, value });
        }

        out.push(SeriesRecord {
            tsid,
            timestamp,
            labels,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_roundtrip() {
        let batch = vec![
            SeriesRecord::new(
                1,
                1000,
                vec![Label::new("__name__", "up"), Label::new("job", "api")],
            ),
            SeriesRecord::new(2, 1100, vec![Label::new("job", "db")]),
        ];

        let buf = serialize_series(&batch);
        assert_eq!(record_type(&buf), LRT_SERIES);
        assert_eq!(deserialize_series(&buf).unwrap(), batch);
    }

    #[test]
    fn test_truncated_record_rejected() {
        let batch = vec![SeriesRecord::new(7, 5, vec![Label::new("a", "b")])];
        let buf = serialize_series(&batch);
        assert!(deserialize_series(&buf[..buf.len() - 2]).is_err());
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(record_type(&[9, 0, 0, 0]), LRT_NONE);
        assert_eq!(record_type(&[]), LRT_NONE);
    }
}
