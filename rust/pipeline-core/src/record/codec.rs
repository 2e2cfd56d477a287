// rust/pipeline-core/src/record/codec.rs

//! Wire format for records exchanged between ranks.
//!
//! A buffer is a sequence of frames, each a little-endian `u32` length
//! followed by that many bytes of bincode-encoded [`Record`]. An empty buffer
//! carries no records and is reserved as the "done" control message.

use super::Record;
use crate::error::{PipelineError, Result};

const LEN_PREFIX: usize = 4;

/// Appends one framed record to `buf`.
pub fn encode_record(buf: &mut Vec<u8>, record: &Record) -> Result<()> {
    let bytes = bincode::serialize(record)
        .map_err(|e| PipelineError::serialization(format!("failed to encode record: {e}")))?;
    let len = u32::try_from(bytes.len()).map_err(|_| {
        PipelineError::serialization(format!("record of {} bytes is too large", bytes.len()))
    })?;
    buf.reserve(LEN_PREFIX + bytes.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&bytes);
    Ok(())
}

pub fn encode_records(records: &[Record]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for record in records {
        encode_record(&mut buf, record)?;
    }
    Ok(buf)
}

pub fn decode_records(payload: &[u8]) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        let header = payload
            .get(offset..offset + LEN_PREFIX)
            .ok_or_else(|| PipelineError::serialization("truncated record length prefix"))?;
        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(header);
        let len = u32::from_le_bytes(len_bytes) as usize;

        let start = offset + LEN_PREFIX;
        let body = payload.get(start..start + len).ok_or_else(|| {
            PipelineError::serialization(format!(
                "record frame at offset {offset} claims {len} bytes, only {} remain",
                payload.len() - start
            ))
        })?;
        let record = bincode::deserialize(body)
            .map_err(|e| PipelineError::serialization(format!("failed to decode record: {e}")))?;
        records.push(record);
        offset = start + len;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> Record {
        let mut record = Record::with_instance_id(id);
        record.search_id = 77;
        record.content = Some("raw".to_string());
        record.push_uint64(0, 123);
        record.push_float(1, 0.25);
        record
    }

    #[test]
    fn test_encode_decode_preserves_records() {
        let records = vec![sample("a"), sample("b"), Record::default()];
        let buf = encode_records(&records).unwrap();
        assert_eq!(decode_records(&buf).unwrap(), records);
    }

    #[test]
    fn test_empty_payload_decodes_to_nothing() {
        assert!(decode_records(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_payload_is_an_error() {
        let buf = encode_records(&[sample("a")]).unwrap();
        let result = decode_records(&buf[..buf.len() - 1]);
        assert!(matches!(result, Err(PipelineError::Serialization { .. })));

        let result = decode_records(&buf[..2]);
        assert!(result.is_err());
    }
}
