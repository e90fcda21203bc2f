//! On-disk framing for one redo record: a 4-byte length, a CRC32 of the
//! payload, then the payload itself (`serde_json`-encoded [`RedoRecord`]).
//!
//! Records are logical, not physical: there is no `page_id`/`offset` framing
//! here, since a [`fathom_common::RedoOp`] already names the index and key it
//! applies to (§4.10).

use crc32fast::Hasher;
use fathom_common::RedoRecord;

pub const FRAME_HEADER_LEN: usize = 4 + 4;

pub fn encode_record(record: &RedoRecord) -> serde_json::Result<Vec<u8>> {
    let payload = serde_json::to_vec(record)?;
    let crc = compute_crc(&payload);
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub fn decode_payload(payload: &[u8]) -> serde_json::Result<RedoRecord> {
    serde_json::from_slice(payload)
}

pub fn compute_crc(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fathom_common::RedoOp;

    #[test]
    fn roundtrip_frame() {
        let record = RedoRecord {
            lsn: 7,
            op: RedoOp::TxnEnter { txn_id: 3 },
        };
        let frame = encode_record(&record).unwrap();
        let len = u32::from_le_bytes(frame[0..4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(frame[4..8].try_into().unwrap());
        let payload = &frame[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
        assert_eq!(crc, compute_crc(payload));
        assert_eq!(decode_payload(payload).unwrap(), record);
    }
}
