//! Wire codec for the miniserver's dual text/binary channel.
//!
//! Every payload on the socket is announced by an 8-byte binary header
//! frame: a magic byte, the frame kind, a flags byte, a reserved byte and
//! the little-endian payload length. Text payloads carry UTF-8 JSON
//! control messages; event payloads carry fixed-layout records parsed
//! here. The parsers are strict: trailing bytes after the last complete
//! record and length fields overrunning the buffer are faults, and the
//! caller drops the frame.

use uuid::Uuid;

use loxone_types::LoxoneMessage;

/// Magic byte every header frame starts with.
pub const HEADER_MAGIC: u8 = 0x03;

/// Size of a header frame in bytes.
pub const HEADER_LEN: usize = 8;

const VALUE_EVENT_LEN: usize = 24;
const TEXT_EVENT_FIXED_LEN: usize = 36;

/// Faults raised by the wire codec. Frames that fail to parse are logged
/// and dropped; the session continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The header frame does not start with [`HEADER_MAGIC`].
    #[error("bad magic byte {0:#04x}")]
    BadMagic(u8),
    /// The header frame is not exactly [`HEADER_LEN`] bytes.
    #[error("header must be {HEADER_LEN} bytes, got {0}")]
    BadHeaderLength(usize),
    /// The header carries a kind byte outside the known range.
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    /// An event buffer has leftover bytes after the last complete record.
    #[error("{0} trailing bytes after the last event record")]
    TrailingBytes(usize),
    /// A record (or its declared text) overruns the buffer.
    #[error("event record truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the record would need.
        needed: usize,
        /// Bytes actually remaining in the buffer.
        remaining: usize,
    },
    /// A text event payload is not valid UTF-8.
    #[error("text event payload is not valid UTF-8")]
    BadText,
    /// A text payload is not a valid control message.
    #[error("bad json payload: {0}")]
    BadJson(String),
}

/// The kind of payload a header frame announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// UTF-8 JSON control message.
    Text,
    /// Opaque binary payload (e.g. a file download).
    Binary,
    /// Table of [`ValueEvent`] records.
    EventValue,
    /// Table of [`TextEvent`] records.
    EventText,
    /// Table of daytimer event records.
    EventDaytimer,
    /// The miniserver is going down; no payload follows.
    OutOfService,
    /// Keep-alive acknowledgement; no payload follows.
    KeepAlive,
    /// Table of weather event records.
    EventWeather,
}

impl FrameKind {
    /// `false` for header-only kinds that announce no payload frame.
    pub fn has_payload(self) -> bool {
        !matches!(self, FrameKind::OutOfService | FrameKind::KeepAlive)
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Text),
            1 => Ok(FrameKind::Binary),
            2 => Ok(FrameKind::EventValue),
            3 => Ok(FrameKind::EventText),
            4 => Ok(FrameKind::EventDaytimer),
            5 => Ok(FrameKind::OutOfService),
            6 => Ok(FrameKind::KeepAlive),
            7 => Ok(FrameKind::EventWeather),
            other => Err(CodecError::UnknownKind(other)),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(kind: FrameKind) -> Self {
        match kind {
            FrameKind::Text => 0,
            FrameKind::Binary => 1,
            FrameKind::EventValue => 2,
            FrameKind::EventText => 3,
            FrameKind::EventDaytimer => 4,
            FrameKind::OutOfService => 5,
            FrameKind::KeepAlive => 6,
            FrameKind::EventWeather => 7,
        }
    }
}

/// A parsed 8-byte header frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// What the next frame carries.
    pub kind: FrameKind,
    /// Estimation/flags byte; bit 0 marks the length as an estimate.
    pub flags: u8,
    /// Declared payload length in bytes.
    pub payload_len: u32,
}

/// Parses a header frame.
pub fn parse_header(bytes: &[u8]) -> Result<MessageHeader, CodecError> {
    if bytes.len() != HEADER_LEN {
        return Err(CodecError::BadHeaderLength(bytes.len()));
    }
    if bytes[0] != HEADER_MAGIC {
        return Err(CodecError::BadMagic(bytes[0]));
    }
    let kind = FrameKind::try_from(bytes[1])?;
    let payload_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    Ok(MessageHeader {
        kind,
        flags: bytes[2],
        payload_len,
    })
}

/// Encodes a header frame.
pub fn encode_header(kind: FrameKind, flags: u8, payload_len: u32) -> [u8; HEADER_LEN] {
    let len = payload_len.to_le_bytes();
    [
        HEADER_MAGIC,
        kind.into(),
        flags,
        0,
        len[0],
        len[1],
        len[2],
        len[3],
    ]
}

/// A value update for one control state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueEvent {
    /// State UUID this value belongs to.
    pub uuid: Uuid,
    /// The new value.
    pub value: f64,
}

/// A text update for one control state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEvent {
    /// State UUID this text belongs to.
    pub uuid: Uuid,
    /// UUID of the icon associated with the text.
    pub icon_uuid: Uuid,
    /// The new text.
    pub text: String,
}

fn read_uuid(bytes: &[u8]) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(bytes);
    Uuid::from_bytes_le(raw)
}

/// Parses a table of [`ValueEvent`] records.
///
/// Each record is 24 bytes: the state UUID followed by a little-endian
/// IEEE-754 double.
pub fn parse_value_events(buffer: &[u8]) -> Result<Vec<ValueEvent>, CodecError> {
    let trailing = buffer.len() % VALUE_EVENT_LEN;
    if trailing != 0 {
        return Err(CodecError::TrailingBytes(trailing));
    }
    let mut events = Vec::with_capacity(buffer.len() / VALUE_EVENT_LEN);
    for record in buffer.chunks_exact(VALUE_EVENT_LEN) {
        let mut value = [0u8; 8];
        value.copy_from_slice(&record[16..24]);
        events.push(ValueEvent {
            uuid: read_uuid(&record[..16]),
            value: f64::from_le_bytes(value),
        });
    }
    Ok(events)
}

/// Serialises [`ValueEvent`] records into their wire table.
pub fn encode_value_events(events: &[ValueEvent]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(events.len() * VALUE_EVENT_LEN);
    for event in events {
        buffer.extend_from_slice(&event.uuid.to_bytes_le());
        buffer.extend_from_slice(&event.value.to_le_bytes());
    }
    buffer
}

/// Parses a table of [`TextEvent`] records.
///
/// Each record is two UUIDs, a little-endian text length, the UTF-8 text
/// and zero padding up to a 4-byte boundary.
pub fn parse_text_events(buffer: &[u8]) -> Result<Vec<TextEvent>, CodecError> {
    let mut events = Vec::new();
    let mut rest = buffer;
    while !rest.is_empty() {
        if rest.len() < TEXT_EVENT_FIXED_LEN {
            return Err(CodecError::Truncated {
                needed: TEXT_EVENT_FIXED_LEN,
                remaining: rest.len(),
            });
        }
        let text_len = u32::from_le_bytes([rest[32], rest[33], rest[34], rest[35]]) as usize;
        let padded_len = TEXT_EVENT_FIXED_LEN + text_len.div_ceil(4) * 4;
        if rest.len() < padded_len {
            return Err(CodecError::Truncated {
                needed: padded_len,
                remaining: rest.len(),
            });
        }
        let text = std::str::from_utf8(&rest[TEXT_EVENT_FIXED_LEN..TEXT_EVENT_FIXED_LEN + text_len])
            .map_err(|_| CodecError::BadText)?;
        events.push(TextEvent {
            uuid: read_uuid(&rest[..16]),
            icon_uuid: read_uuid(&rest[16..32]),
            text: text.to_owned(),
        });
        rest = &rest[padded_len..];
    }
    Ok(events)
}

/// Serialises [`TextEvent`] records into their wire table.
pub fn encode_text_events(events: &[TextEvent]) -> Vec<u8> {
    let mut buffer = Vec::new();
    for event in events {
        buffer.extend_from_slice(&event.uuid.to_bytes_le());
        buffer.extend_from_slice(&event.icon_uuid.to_bytes_le());
        let text = event.text.as_bytes();
        buffer.extend_from_slice(&(text.len() as u32).to_le_bytes());
        buffer.extend_from_slice(text);
        let padding = text.len().div_ceil(4) * 4 - text.len();
        buffer.extend_from_slice(&[0u8; 4][..padding]);
    }
    buffer
}

/// Parses a text payload into a control message.
pub fn parse_message(text: &str) -> Result<LoxoneMessage, CodecError> {
    serde_json::from_str(text).map_err(|err| CodecError::BadJson(err.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_value_event_header() {
        let header = parse_header(&[0x03, 0x02, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(header.kind, FrameKind::EventValue);
        assert_eq!(header.payload_len, 16);
    }

    #[test]
    fn rejects_bad_magic() {
        let err = parse_header(&[0x04, 0x02, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err, CodecError::BadMagic(0x04));
    }

    #[test]
    fn rejects_short_header() {
        let err = parse_header(&[0x03, 0x02, 0]).unwrap_err();
        assert_eq!(err, CodecError::BadHeaderLength(3));
    }

    #[test]
    fn rejects_unknown_kind() {
        let err = parse_header(&[0x03, 0x08, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err, CodecError::UnknownKind(8));
    }

    #[test]
    fn header_round_trip() {
        let bytes = encode_header(FrameKind::EventText, 0x01, 72);
        let header = parse_header(&bytes).unwrap();
        assert_eq!(header.kind, FrameKind::EventText);
        assert_eq!(header.flags, 0x01);
        assert_eq!(header.payload_len, 72);
    }

    #[test]
    fn value_events_round_trip_bitwise() {
        let events = vec![
            ValueEvent {
                uuid: Uuid::new_v4(),
                value: 21.5,
            },
            ValueEvent {
                uuid: Uuid::new_v4(),
                value: -0.0,
            },
            ValueEvent {
                uuid: Uuid::new_v4(),
                value: f64::MIN_POSITIVE,
            },
        ];
        let decoded = parse_value_events(&encode_value_events(&events)).unwrap();
        assert_eq!(decoded.len(), events.len());
        for (decoded, original) in decoded.iter().zip(&events) {
            assert_eq!(decoded.uuid, original.uuid);
            assert_eq!(decoded.value.to_bits(), original.value.to_bits());
        }
    }

    #[test]
    fn value_events_reject_trailing_bytes() {
        let mut buffer = encode_value_events(&[ValueEvent {
            uuid: Uuid::new_v4(),
            value: 1.0,
        }]);
        buffer.push(0xff);
        assert_eq!(
            parse_value_events(&buffer).unwrap_err(),
            CodecError::TrailingBytes(1)
        );
    }

    #[test]
    fn text_events_round_trip_all_paddings() {
        for text in ["", "a", "ab", "abc", "abcd", "höher hinaus"] {
            let events = vec![
                TextEvent {
                    uuid: Uuid::new_v4(),
                    icon_uuid: Uuid::new_v4(),
                    text: text.to_owned(),
                },
                TextEvent {
                    uuid: Uuid::new_v4(),
                    icon_uuid: Uuid::new_v4(),
                    text: "trailer".to_owned(),
                },
            ];
            let decoded = parse_text_events(&encode_text_events(&events)).unwrap();
            assert_eq!(decoded, events, "failed for text {text:?}");
        }
    }

    #[test]
    fn text_events_reject_overrunning_length() {
        let mut buffer = encode_text_events(&[TextEvent {
            uuid: Uuid::new_v4(),
            icon_uuid: Uuid::new_v4(),
            text: "abcd".to_owned(),
        }]);
        // claim more text than the buffer holds
        buffer[32] = 0xff;
        assert!(matches!(
            parse_text_events(&buffer).unwrap_err(),
            CodecError::Truncated { .. }
        ));
    }

    #[test]
    fn text_events_reject_truncated_record() {
        let buffer = vec![0u8; TEXT_EVENT_FIXED_LEN - 4];
        assert!(matches!(
            parse_text_events(&buffer).unwrap_err(),
            CodecError::Truncated { .. }
        ));
    }

    #[test]
    fn parse_message_reports_bad_json() {
        assert!(matches!(
            parse_message("{not json"),
            Err(CodecError::BadJson(_))
        ));
    }
}
