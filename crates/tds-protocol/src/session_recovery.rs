//! Session-recovery state records.
//!
//! Session state travels as a sequence of `(slot id, length, data)` triples,
//! both in the session-recovery feature acknowledgement and in SESSIONSTATE
//! tokens. Lengths below 0xFF are a single byte; 0xFF escapes to a following
//! little-endian `u32`.

use bytes::{BufMut, Bytes};

use crate::error::ProtocolError;

/// Number of session-state slots defined by the protocol.
pub const MAX_STATE_SLOTS: usize = 256;

const LENGTH_ESCAPE: u8 = 0xFF;

/// One session-state slot value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecoveryRecord {
    /// Slot identifier.
    pub slot: u8,
    /// Opaque slot data.
    pub data: Bytes,
}

/// Iterator over the records in a session-state byte sequence.
///
/// Yields an error and then stops if a record is truncated.
#[derive(Debug, Clone)]
pub struct SessionRecoveryRecords<'a> {
    remaining: &'a [u8],
    failed: bool,
}

impl<'a> SessionRecoveryRecords<'a> {
    /// Iterate over the records in `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            remaining: data,
            failed: false,
        }
    }

    fn next_record(&mut self) -> Result<SessionRecoveryRecord, ProtocolError> {
        let remaining: &'a [u8] = self.remaining;
        let [slot, len_byte, rest @ ..] = remaining else {
            return Err(ProtocolError::MalformedSessionState(
                "record header truncated",
            ));
        };

        let (len, rest) = if *len_byte == LENGTH_ESCAPE {
            let [a, b, c, d, rest @ ..] = rest else {
                return Err(ProtocolError::MalformedSessionState(
                    "escaped record length truncated",
                ));
            };
            (u32::from_le_bytes([*a, *b, *c, *d]) as usize, rest)
        } else {
            (*len_byte as usize, rest)
        };

        if rest.len() < len {
            return Err(ProtocolError::IncompletePacket {
                expected: len,
                actual: rest.len(),
            });
        }

        let (data, tail) = rest.split_at(len);
        let record = SessionRecoveryRecord {
            slot: *slot,
            data: Bytes::copy_from_slice(data),
        };
        self.remaining = tail;
        Ok(record)
    }
}

impl Iterator for SessionRecoveryRecords<'_> {
    type Item = Result<SessionRecoveryRecord, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining.is_empty() {
            return None;
        }
        let record = self.next_record();
        self.failed = record.is_err();
        Some(record)
    }
}

/// Encoded size of a state value of `data_len` bytes, excluding the slot id.
#[must_use]
pub const fn state_value_len(data_len: usize) -> usize {
    if data_len < LENGTH_ESCAPE as usize {
        data_len + 1
    } else {
        data_len + 5
    }
}

/// Write one `(slot, length, data)` record.
pub fn write_state_record(dst: &mut impl BufMut, slot: u8, data: &[u8]) {
    dst.put_u8(slot);
    if data.len() < LENGTH_ESCAPE as usize {
        dst.put_u8(data.len() as u8);
    } else {
        dst.put_u8(LENGTH_ESCAPE);
        dst.put_u32_le(data.len() as u32);
    }
    dst.put_slice(data);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_short_and_escaped_lengths() {
        let long = vec![0x5A; 300];
        let mut buf = BytesMut::new();
        write_state_record(&mut buf, 3, &[1, 2]);
        write_state_record(&mut buf, 200, &long);
        assert_eq!(buf.len(), 1 + state_value_len(2) + 1 + state_value_len(300));
        assert_eq!(buf[5], 0xFF);

        let records: Vec<_> = SessionRecoveryRecords::new(&buf)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].slot, 3);
        assert_eq!(records[0].data.as_ref(), &[1, 2]);
        assert_eq!(records[1].slot, 200);
        assert_eq!(records[1].data.len(), 300);
    }

    #[test]
    fn test_escape_boundary() {
        // 254 bytes still fit the short form; 255 needs the escape.
        assert_eq!(state_value_len(254), 255);
        assert_eq!(state_value_len(255), 260);
    }

    #[test]
    fn test_truncated_data_stops_iteration() {
        let data = [1u8, 4, 0xAA, 0xBB];
        let mut iter = SessionRecoveryRecords::new(&data);
        assert!(matches!(
            iter.next(),
            Some(Err(ProtocolError::IncompletePacket {
                expected: 4,
                actual: 2
            }))
        ));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_truncated_escape() {
        let data = [1u8, 0xFF, 0x01];
        let first = SessionRecoveryRecords::new(&data).next().unwrap();
        assert!(matches!(
            first,
            Err(ProtocolError::MalformedSessionState(_))
        ));
    }

    #[test]
    fn test_empty_sequence() {
        assert_eq!(SessionRecoveryRecords::new(&[]).count(), 0);
    }
}
