//! Wire encoding for V2V intents and V2I alerts.
//!
//! Binary frame layout (all integers big-endian):
//!
//! ```text
//! magic "VX" (2) | version (1) | kind (1) | body length (2) | body | checksum (4)
//! ```
//!
//! The checksum is the first four bytes of the BLAKE3 hash of header and body.
//! Decoders accept frames from newer versions as long as the fields they know
//! parse; newer versions only ever append fields to the body.
//!
//! The text form is JSON, `{"version": 1, "payload": {...}}`, and is detected
//! by a leading `{`.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::types::{
    AlertKind, AlertStatus, InfrastructureAlert, IntentMessage, IntentStatus, PriorityClass,
    TIME_HORIZON, TimeWindow, Vec2, VehicleId,
};

pub const WIRE_VERSION: u8 = 1;

const MAGIC: [u8; 2] = *b"VX";
const HEADER_LEN: usize = 6;
const CHECKSUM_LEN: usize = 4;
const KIND_INTENT: u8 = 1;
const KIND_ALERT: u8 = 2;

/// Encoding used when sending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    #[default]
    Binary,
    Json,
}

impl WireFormat {
    /// Form of a received frame: JSON documents open with a brace.
    pub fn of(bytes: &[u8]) -> WireFormat {
        match bytes.first() {
            Some(b'{') => WireFormat::Json,
            _ => WireFormat::Binary,
        }
    }
}

/// Anything that travels over the broadcast medium.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Intent(IntentMessage),
    Alert(InfrastructureAlert),
}

#[derive(Serialize)]
struct JsonFrameOut<'a> {
    version: u8,
    payload: &'a Payload,
}

#[derive(Deserialize)]
struct JsonFrameIn {
    version: u8,
    payload: Payload,
}

/// Encode a payload. Payloads that would not pass decoding are refused.
pub fn encode(payload: &Payload, format: WireFormat) -> Result<Vec<u8>, CodecError> {
    validate(payload)?;
    match format {
        WireFormat::Binary => {
            let mut body = Writer::default();
            let kind = match payload {
                Payload::Intent(intent) => {
                    write_intent(&mut body, intent)?;
                    KIND_INTENT
                }
                Payload::Alert(alert) => {
                    write_alert(&mut body, alert)?;
                    KIND_ALERT
                }
            };
            frame(WIRE_VERSION, kind, &body.buf)
        }
        WireFormat::Json => serde_json::to_vec(&JsonFrameOut {
            version: WIRE_VERSION,
            payload,
        })
        .map_err(|e| CodecError::Json(e.to_string())),
    }
}

/// Decode and validate a payload in either wire form.
pub fn decode(bytes: &[u8]) -> Result<Payload, CodecError> {
    let payload = match WireFormat::of(bytes) {
        WireFormat::Json => decode_json(bytes)?,
        WireFormat::Binary => decode_binary(bytes)?,
    };
    validate(&payload)?;
    Ok(payload)
}

fn frame(version: u8, kind: u8, body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let body_len = u16::try_from(body.len()).map_err(|_| CodecError::Oversized {
        field: "body",
        len: body.len(),
    })?;
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len() + CHECKSUM_LEN);
    frame.extend_from_slice(&MAGIC);
    frame.push(version);
    frame.push(kind);
    frame.extend_from_slice(&body_len.to_be_bytes());
    frame.extend_from_slice(body);
    let digest = blake3::hash(&frame);
    frame.extend_from_slice(&digest.as_bytes()[..CHECKSUM_LEN]);
    Ok(frame)
}

fn decode_binary(bytes: &[u8]) -> Result<Payload, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated {
            needed: HEADER_LEN,
            available: bytes.len(),
        });
    }
    if bytes[0..2] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    let version = bytes[2];
    if version == 0 {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let kind = bytes[3];
    let body_len = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
    let total = HEADER_LEN + body_len + CHECKSUM_LEN;
    if bytes.len() < total {
        return Err(CodecError::Truncated {
            needed: total,
            available: bytes.len(),
        });
    }
    if bytes.len() > total {
        return Err(CodecError::TrailingBytes(bytes.len() - total));
    }

    let (framed, checksum) = bytes.split_at(HEADER_LEN + body_len);
    if blake3::hash(framed).as_bytes()[..CHECKSUM_LEN] != *checksum {
        return Err(CodecError::ChecksumMismatch);
    }

    let mut reader = Reader::new(&framed[HEADER_LEN..]);
    let payload = match kind {
        KIND_INTENT => Payload::Intent(read_intent(&mut reader)?),
        KIND_ALERT => Payload::Alert(read_alert(&mut reader)?),
        other => return Err(CodecError::UnknownKind(other)),
    };
    // Fields appended by newer versions are skipped.
    if version <= WIRE_VERSION && reader.remaining() > 0 {
        return Err(CodecError::TrailingBytes(reader.remaining()));
    }
    Ok(payload)
}

fn decode_json(bytes: &[u8]) -> Result<Payload, CodecError> {
    let frame: JsonFrameIn =
        serde_json::from_slice(bytes).map_err(|e| CodecError::Json(e.to_string()))?;
    if frame.version == 0 {
        return Err(CodecError::UnsupportedVersion(frame.version));
    }
    Ok(frame.payload)
}

fn validate(payload: &Payload) -> Result<(), CodecError> {
    match payload {
        Payload::Intent(intent) => {
            if intent.sender.as_str().is_empty() {
                return Err(invalid("sender", "empty identifier"));
            }
            for (field, value) in [
                ("position", intent.position),
                ("velocity", intent.velocity),
            ] {
                if !value.is_finite() {
                    return Err(invalid(field, "not finite"));
                }
            }
            if !intent.heading.is_finite() {
                return Err(invalid("heading", "not finite"));
            }
            if !(intent.uncertainty_radius.is_finite() && intent.uncertainty_radius >= 0.0) {
                return Err(invalid("uncertainty_radius", "must be a finite radius"));
            }
            check_window("window", &intent.window)?;
            if intent.timestamp > TIME_HORIZON {
                return Err(invalid("timestamp", "past the time horizon"));
            }
            if intent.waiting_since > intent.timestamp {
                return Err(invalid("waiting_since", "later than timestamp"));
            }
        }
        Payload::Alert(alert) => {
            if alert.source.is_empty() {
                return Err(invalid("source", "empty identifier"));
            }
            check_window("validity", &alert.validity)?;
            if alert.issued_at > TIME_HORIZON {
                return Err(invalid("issued_at", "past the time horizon"));
            }
        }
    }
    Ok(())
}

fn check_window(field: &'static str, window: &TimeWindow) -> Result<(), CodecError> {
    if window.end < window.start {
        return Err(invalid(field, "ends before it starts"));
    }
    if window.end > TIME_HORIZON {
        return Err(invalid(field, "ends past the time horizon"));
    }
    Ok(())
}

fn invalid(field: &'static str, reason: &str) -> CodecError {
    CodecError::InvalidField {
        field,
        reason: reason.to_string(),
    }
}

fn write_intent(w: &mut Writer, intent: &IntentMessage) -> Result<(), CodecError> {
    w.put_str("sender", intent.sender.as_str())?;
    w.put_u32(intent.epoch);
    w.put_u64(intent.sequence);
    w.put_u8(intent.status.to_byte());
    w.put_u8(intent.class.to_byte());
    w.put_f64(intent.position.x);
    w.put_f64(intent.position.y);
    w.put_f64(intent.velocity.x);
    w.put_f64(intent.velocity.y);
    w.put_f64(intent.heading);
    w.put_f64(intent.uncertainty_radius);
    w.put_u64(intent.window.start);
    w.put_u64(intent.window.end);
    let count = u8::try_from(intent.zones.len()).map_err(|_| CodecError::Oversized {
        field: "zones",
        len: intent.zones.len(),
    })?;
    w.put_u8(count);
    for zone in &intent.zones {
        w.put_u8(*zone);
    }
    w.put_u32(intent.proposed_rank);
    w.put_u64(intent.timestamp);
    w.put_u64(intent.waiting_since);
    Ok(())
}

fn read_intent(r: &mut Reader<'_>) -> Result<IntentMessage, CodecError> {
    let sender = VehicleId::new(r.string("sender")?);
    let epoch = r.u32()?;
    let sequence = r.u64()?;
    let status =
        IntentStatus::from_byte(r.u8()?).ok_or_else(|| invalid("status", "unknown value"))?;
    let class =
        PriorityClass::from_byte(r.u8()?).ok_or_else(|| invalid("class", "unknown value"))?;
    let position = Vec2::new(r.f64("position")?, r.f64("position")?);
    let velocity = Vec2::new(r.f64("velocity")?, r.f64("velocity")?);
    let heading = r.f64("heading")?;
    let uncertainty_radius = r.f64("uncertainty_radius")?;
    let window = TimeWindow {
        start: r.u64()?,
        end: r.u64()?,
    };
    let count = r.u8()? as usize;
    let zones = r.take(count)?.to_vec();
    Ok(IntentMessage {
        sender,
        epoch,
        sequence,
        status,
        class,
        position,
        velocity,
        heading,
        uncertainty_radius,
        window,
        zones,
        proposed_rank: r.u32()?,
        timestamp: r.u64()?,
        waiting_since: r.u64()?,
    })
}

fn write_alert(w: &mut Writer, alert: &InfrastructureAlert) -> Result<(), CodecError> {
    w.put_str("source", &alert.source)?;
    w.put_u8(alert.kind.to_byte());
    w.put_u8(match alert.status {
        AlertStatus::Active => 0,
        AlertStatus::Clear => 1,
    });
    w.put_u8(alert.zone);
    w.put_u64(alert.validity.start);
    w.put_u64(alert.validity.end);
    w.put_u8(u8::from(alert.override_priority));
    w.put_u64(alert.issued_at);
    Ok(())
}

fn read_alert(r: &mut Reader<'_>) -> Result<InfrastructureAlert, CodecError> {
    let source = r.string("source")?;
    let kind = AlertKind::from_byte(r.u8()?).ok_or_else(|| invalid("kind", "unknown value"))?;
    let status = match r.u8()? {
        0 => AlertStatus::Active,
        1 => AlertStatus::Clear,
        _ => return Err(invalid("status", "unknown value")),
    };
    let zone = r.u8()?;
    let validity = TimeWindow {
        start: r.u64()?,
        end: r.u64()?,
    };
    let override_priority = match r.u8()? {
        0 => false,
        1 => true,
        _ => return Err(invalid("override_priority", "not a flag")),
    };
    Ok(InfrastructureAlert {
        kind,
        zone,
        validity,
        override_priority,
        status,
        source,
        issued_at: r.u64()?,
    })
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn put_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn put_str(&mut self, field: &'static str, value: &str) -> Result<(), CodecError> {
        let len = u8::try_from(value.len()).map_err(|_| CodecError::Oversized {
            field,
            len: value.len(),
        })?;
        self.buf.push(len);
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos + len;
        if end > self.bytes.len() {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN + end,
                available: HEADER_LEN + self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    fn f64(&mut self, field: &'static str) -> Result<f64, CodecError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        let value = f64::from_be_bytes(buf);
        if !value.is_finite() {
            return Err(invalid(field, "not finite"));
        }
        Ok(value)
    }

    fn string(&mut self, field: &'static str) -> Result<String, CodecError> {
        let len = self.u8()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| invalid(field, "not utf-8"))
    }
}
