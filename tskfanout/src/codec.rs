//! The TSK wire format: a length-prefixed, big-endian batch frame exchanged between
//! the Kafka/TSK backend and the proxy. Pure encode/decode over byte buffers, in the
//! same `byteorder`-over-a-cursor style the teacher's `net::frame` module uses for its
//! connection tokens and headers.

use crate::error::{Result, TimeseriesError};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

pub const MAGIC: &[u8; 8] = b"TSKBATCH";
pub const VERSION: u8 = 0;

/// Fixed prefix before the channel name: magic(8) + version(1) + time(4) + chanlen(2).
pub const HEADER_PREFIX_LEN: usize = 15;

/// A single `(key, value)` observation carried in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub value: u64,
}

/// A fully decoded TSK batch: one timestamp, one channel, many records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub time: u32,
    pub channel: String,
    pub records: Vec<Record>,
}

/// The result of a decode attempt: how many bytes were consumed (0 on outright
/// rejection, matching the design doc's "bytes consumed so far, or zero" contract).
pub struct ParseOutcome {
    pub batch: Batch,
    pub consumed: usize,
}

/// Appends the header (magic, version, time, channel) to `out`. Used when starting a
/// new message in the Kafka backend's batching loop.
pub fn encode_header(out: &mut Vec<u8>, time: u32, channel: &str) -> Result<()> {
    if channel.len() > u16::MAX as usize {
        return Err(TimeseriesError::Parse(format!(
            "channel name `{channel}` exceeds {} bytes",
            u16::MAX
        )));
    }

    out.write_all(MAGIC).map_err(TimeseriesError::Io)?;
    out.write_u8(VERSION).map_err(TimeseriesError::Io)?;
    out.write_u32::<BigEndian>(time).map_err(TimeseriesError::Io)?;
    out.write_u16::<BigEndian>(channel.len() as u16)
        .map_err(TimeseriesError::Io)?;
    out.write_all(channel.as_bytes()).map_err(TimeseriesError::Io)?;
    Ok(())
}

/// Appends one `(key-len, key-bytes, value)` tuple to `out`. Refuses keys of length
/// `>= 2^16`, per the design doc.
pub fn encode_record(out: &mut Vec<u8>, key: &str, value: u64) -> Result<()> {
    if key.len() >= u16::MAX as usize {
        return Err(TimeseriesError::Resolve {
            backend: "kafka",
            key: key.to_string(),
        });
    }

    out.write_u16::<BigEndian>(key.len() as u16).map_err(TimeseriesError::Io)?;
    out.write_all(key.as_bytes()).map_err(TimeseriesError::Io)?;
    out.write_u64::<BigEndian>(value).map_err(TimeseriesError::Io)?;
    Ok(())
}

/// Encodes a complete batch into a freshly allocated buffer. Primarily useful for
/// tests and for callers that don't need the incremental batching the Kafka backend
/// does internally.
pub fn encode(batch: &Batch) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_header(&mut out, batch.time, &batch.channel)?;
    for record in &batch.records {
        encode_record(&mut out, &record.key, record.value)?;
    }
    Ok(out)
}

/// Decodes a single TSK message from `buf`. Never panics on malformed input: a
/// too-short buffer or an unrecognised version yields `Err` with zero bytes consumed.
pub fn decode(buf: &[u8]) -> Result<ParseOutcome> {
    if buf.len() < HEADER_PREFIX_LEN {
        return Err(TimeseriesError::Parse(format!(
            "buffer of {} bytes shorter than the {}-byte header prefix",
            buf.len(),
            HEADER_PREFIX_LEN
        )));
    }

    let mut cursor = Cursor::new(buf);

    let mut magic = [0u8; 8];
    cursor.read_exact(&mut magic).map_err(TimeseriesError::Io)?;
    if &magic != MAGIC {
        return Err(TimeseriesError::Parse("bad magic".into()));
    }

    let version = cursor.read_u8().map_err(TimeseriesError::Io)?;
    if version != VERSION {
        return Err(TimeseriesError::Parse(format!("unsupported version {version}")));
    }

    let time = cursor.read_u32::<BigEndian>().map_err(TimeseriesError::Io)?;
    let chan_len = cursor.read_u16::<BigEndian>().map_err(TimeseriesError::Io)? as usize;

    if buf.len() < HEADER_PREFIX_LEN + chan_len {
        return Err(TimeseriesError::Parse("truncated channel name".into()));
    }

    let mut channel_bytes = vec![0u8; chan_len];
    cursor.read_exact(&mut channel_bytes).map_err(TimeseriesError::Io)?;
    let channel = String::from_utf8(channel_bytes)
        .map_err(|e| TimeseriesError::Parse(format!("channel name is not valid UTF-8: {e}")))?;

    let mut records = Vec::new();
    loop {
        let remaining = cursor.get_ref().len() as u64 - cursor.position();
        if remaining == 0 {
            break;
        }
        if remaining < 2 {
            return Err(TimeseriesError::Parse("truncated key length".into()));
        }

        let key_len = cursor.read_u16::<BigEndian>().map_err(TimeseriesError::Io)? as usize;
        let remaining = cursor.get_ref().len() as u64 - cursor.position();
        if remaining < key_len as u64 + 8 {
            return Err(TimeseriesError::Parse("truncated key or value".into()));
        }

        let mut key_bytes = vec![0u8; key_len];
        cursor.read_exact(&mut key_bytes).map_err(TimeseriesError::Io)?;
        let key = String::from_utf8(key_bytes)
            .map_err(|e| TimeseriesError::Parse(format!("key is not valid UTF-8: {e}")))?;
        let value = cursor.read_u64::<BigEndian>().map_err(TimeseriesError::Io)?;

        records.push(Record { key, value });
    }

    let consumed = cursor.position() as usize;
    Ok(ParseOutcome {
        batch: Batch { time, channel, records },
        consumed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_the_spec_worked_example() {
        let batch = Batch {
            time: 1_000_000_000,
            channel: "ch1".to_string(),
            records: vec![Record { key: "foo".to_string(), value: 42 }],
        };

        let encoded = encode(&batch).unwrap();
        let expected: [u8; 30] = [
            0x54, 0x53, 0x4B, 0x42, 0x41, 0x54, 0x43, 0x48, 0x00, 0x3B, 0x9A, 0xCA, 0x00, 0x00,
            0x03, 0x63, 0x68, 0x31, 0x00, 0x03, 0x66, 0x6F, 0x6F, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x2A,
        ];
        assert_eq!(encoded, expected);
    }

    #[test]
    fn round_trips_through_encode_and_decode() {
        let batch = Batch {
            time: 42,
            channel: "metrics".to_string(),
            records: vec![
                Record { key: "a.b".to_string(), value: 1 },
                Record { key: "a.c".to_string(), value: u64::MAX },
                Record { key: "".to_string(), value: 0 },
            ],
        };

        let encoded = encode(&batch).unwrap();
        let outcome = decode(&encoded).unwrap();
        assert_eq!(outcome.batch, batch);
        assert_eq!(outcome.consumed, encoded.len());
    }

    #[test]
    fn rejects_buffers_shorter_than_the_header() {
        let err = decode(&[0u8; 14]).unwrap_err();
        assert!(matches!(err, TimeseriesError::Parse(_)));
    }

    #[test]
    fn rejects_truncated_channel_name() {
        let mut out = Vec::new();
        encode_header(&mut out, 1, "toolong").unwrap();
        let truncated = &out[..out.len() - 2];
        assert!(decode(truncated).is_err());
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut out = Vec::new();
        encode_header(&mut out, 1, "ch").unwrap();
        out[8] = 1;
        assert!(matches!(decode(&out), Err(TimeseriesError::Parse(_))));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut out = Vec::new();
        encode_header(&mut out, 1, "ch").unwrap();
        out[0] = b'X';
        assert!(matches!(decode(&out), Err(TimeseriesError::Parse(_))));
    }

    #[test]
    fn incremental_batching_matches_bulk_encode() {
        let mut incremental = Vec::new();
        encode_header(&mut incremental, 7, "svc").unwrap();
        encode_record(&mut incremental, "x", 1).unwrap();
        encode_record(&mut incremental, "y", 2).unwrap();

        let bulk = encode(&Batch {
            time: 7,
            channel: "svc".to_string(),
            records: vec![
                Record { key: "x".to_string(), value: 1 },
                Record { key: "y".to_string(), value: 2 },
            ],
        })
        .unwrap();

        assert_eq!(incremental, bulk);
    }
}
