//! Tagged-field detection payload.
//!
//! ```text
//! { status u32, payload_size u32 }
//! payload_size bytes of entries:
//!     { key_id u32, entry_size u32, entry[entry_size] }
//! ```
//!
//! Every entry body starts with a `version u32`. All integers are
//! little-endian; 64-bit times are split into `lsw, msw` pairs.

use crate::error::{Result, WakegateError};

pub const KEY_CONFIDENCE_LEVELS: u32 = 0x0;
pub const KEY_KEYWORD_POSITION: u32 = 0x1;
pub const KEY_TIMESTAMP: u32 = 0x2;
pub const KEY_FTRT_DATA: u32 = 0x3;
pub const KEY_MULTI_MODEL_RESULT: u32 = 0x4;

/// Upper bound on confidence values in one entry.
pub const MAX_CONF_VALUES: usize = 20;

const ENTRY_VERSION: u32 = 1;

/// Per-model result of a multi-model detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelDetection {
    pub model_id: u32,
    pub keyword_id: u32,
    pub best_channel: u32,
    pub best_confidence: u32,
    pub kw_start_us: u64,
    pub kw_end_us: u64,
    pub timestamp_us: u64,
}

/// One parsed first-stage detection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionEvent {
    pub status: u32,
    pub confidence_levels: Vec<u32>,
    pub kw_start_us: u64,
    pub kw_end_us: u64,
    pub timestamp_us: u64,
    /// Audio buffered by the DSP before the host was notified.
    pub ftrt_len_us: u32,
    /// Empty unless the payload carried a multi-model result.
    pub models: Vec<ModelDetection>,
}

impl DetectionEvent {
    pub fn is_multi_model(&self) -> bool {
        !self.models.is_empty()
    }

    /// The event as seen by the owner of one detected model: that model's
    /// keyword position, timestamp and confidence. FTRT length is shared.
    pub fn for_model(&self, model: &ModelDetection) -> DetectionEvent {
        DetectionEvent {
            status: self.status,
            confidence_levels: vec![model.best_confidence],
            kw_start_us: model.kw_start_us,
            kw_end_us: model.kw_end_us,
            timestamp_us: model.timestamp_us,
            ftrt_len_us: self.ftrt_len_us,
            models: vec![*model],
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + 4)
            .ok_or_else(|| WakegateError::InvalidPayload(format!("truncated at byte {}", self.pos)))?;
        self.pos += 4;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64_split(&mut self) -> Result<u64> {
        let lsw = self.u32()?;
        let msw = self.u32()?;
        Ok((u64::from(msw) << 32) | u64::from(lsw))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or_else(|| WakegateError::InvalidPayload(format!("entry of {n} bytes overruns payload")))?;
        self.pos += n;
        Ok(bytes)
    }
}

/// Parses a raw detection payload.
pub fn parse_detection_payload(raw: &[u8]) -> Result<DetectionEvent> {
    let mut top = Cursor::new(raw);
    let status = top.u32()?;
    let payload_size = top.u32()? as usize;
    if payload_size == 0 {
        return Err(WakegateError::InvalidPayload("empty payload".into()));
    }
    let body = top.take(payload_size)?;

    let mut event = DetectionEvent {
        status,
        ..DetectionEvent::default()
    };
    let mut has_position = false;
    let mut has_timestamp = false;

    let mut cur = Cursor::new(body);
    while cur.remaining() > 0 {
        let key = cur.u32()?;
        let size = cur.u32()? as usize;
        let mut entry = Cursor::new(cur.take(size)?);
        let _version = entry.u32()?;
        match key {
            KEY_CONFIDENCE_LEVELS => {
                let count = entry.u32()? as usize;
                if count > MAX_CONF_VALUES {
                    return Err(WakegateError::InvalidPayload(format!(
                        "{count} confidence values exceed {MAX_CONF_VALUES}"
                    )));
                }
                event.confidence_levels = (0..count).map(|_| entry.u32()).collect::<Result<_>>()?;
            }
            KEY_KEYWORD_POSITION => {
                event.kw_start_us = entry.u64_split()?;
                event.kw_end_us = entry.u64_split()?;
                has_position = true;
            }
            KEY_TIMESTAMP => {
                event.timestamp_us = entry.u64_split()?;
                has_timestamp = true;
            }
            KEY_FTRT_DATA => {
                event.ftrt_len_us = entry.u32()?;
            }
            KEY_MULTI_MODEL_RESULT => {
                let count = entry.u32()? as usize;
                if count > MAX_CONF_VALUES {
                    return Err(WakegateError::InvalidPayload(format!("{count} detected models")));
                }
                for _ in 0..count {
                    event.models.push(ModelDetection {
                        model_id: entry.u32()?,
                        keyword_id: entry.u32()?,
                        best_channel: entry.u32()?,
                        best_confidence: entry.u32()?,
                        kw_start_us: entry.u64_split()?,
                        kw_end_us: entry.u64_split()?,
                        timestamp_us: entry.u64_split()?,
                    });
                }
            }
            other => return Err(WakegateError::UnknownPayloadKey(other)),
        }
    }

    if let Some(first) = event.models.first().copied() {
        if !has_position {
            event.kw_start_us = first.kw_start_us;
            event.kw_end_us = first.kw_end_us;
        }
        if !has_timestamp {
            event.timestamp_us = first.timestamp_us;
        }
        if event.confidence_levels.is_empty() {
            event.confidence_levels = event.models.iter().map(|m| m.best_confidence).collect();
        }
    }
    Ok(event)
}

/// Builds detection payloads; used by simulated capture sessions and tests.
#[derive(Debug, Default, Clone)]
pub struct DetectionPayloadWriter {
    body: Vec<u8>,
}

impl DetectionPayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(mut self, key: u32, words: &[u32]) -> Self {
        self.body.extend_from_slice(&key.to_le_bytes());
        self.body
            .extend_from_slice(&(((words.len() + 1) * 4) as u32).to_le_bytes());
        self.body.extend_from_slice(&ENTRY_VERSION.to_le_bytes());
        for w in words {
            self.body.extend_from_slice(&w.to_le_bytes());
        }
        self
    }

    pub fn confidence_levels(self, levels: &[u32]) -> Self {
        let mut words = vec![levels.len() as u32];
        words.extend_from_slice(levels);
        self.entry(KEY_CONFIDENCE_LEVELS, &words)
    }

    pub fn keyword_position(self, start_us: u64, end_us: u64) -> Self {
        let [a, b] = split(start_us);
        let [c, d] = split(end_us);
        self.entry(KEY_KEYWORD_POSITION, &[a, b, c, d])
    }

    pub fn timestamp(self, us: u64) -> Self {
        self.entry(KEY_TIMESTAMP, &split(us))
    }

    pub fn ftrt(self, len_us: u32) -> Self {
        self.entry(KEY_FTRT_DATA, &[len_us])
    }

    pub fn multi_model(self, models: &[ModelDetection]) -> Self {
        let mut words = vec![models.len() as u32];
        for m in models {
            words.extend_from_slice(&[m.model_id, m.keyword_id, m.best_channel, m.best_confidence]);
            words.extend_from_slice(&split(m.kw_start_us));
            words.extend_from_slice(&split(m.kw_end_us));
            words.extend_from_slice(&split(m.timestamp_us));
        }
        self.entry(KEY_MULTI_MODEL_RESULT, &words)
    }

    /// Appends an entry with an arbitrary key.
    pub fn raw_entry(self, key: u32, words: &[u32]) -> Self {
        self.entry(key, words)
    }

    pub fn build(self, status: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 8);
        out.extend_from_slice(&status.to_le_bytes());
        out.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

fn split(v: u64) -> [u32; 2] {
    [v as u32, (v >> 32) as u32]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_model_payload() {
        let raw = DetectionPayloadWriter::new()
            .confidence_levels(&[80])
            .keyword_position(1_000_000, 1_300_000)
            .timestamp(1_500_000)
            .ftrt(1_000_000)
            .build(0);
        let event = parse_detection_payload(&raw).unwrap();
        assert_eq!(event.confidence_levels, vec![80]);
        assert_eq!((event.kw_start_us, event.kw_end_us), (1_000_000, 1_300_000));
        assert_eq!(event.timestamp_us, 1_500_000);
        assert_eq!(event.ftrt_len_us, 1_000_000);
        assert!(!event.is_multi_model());
    }

    #[test]
    fn times_above_32_bits_survive() {
        let ts = (7u64 << 32) + 99;
        let raw = DetectionPayloadWriter::new().timestamp(ts).build(0);
        assert_eq!(parse_detection_payload(&raw).unwrap().timestamp_us, ts);
    }

    #[test]
    fn multi_model_fills_event_window() {
        let model = ModelDetection {
            model_id: 7,
            keyword_id: 1,
            best_channel: 0,
            best_confidence: 91,
            kw_start_us: 200,
            kw_end_us: 900,
            timestamp_us: 1_000,
        };
        let raw = DetectionPayloadWriter::new()
            .multi_model(&[model])
            .ftrt(800)
            .build(0);
        let event = parse_detection_payload(&raw).unwrap();
        assert_eq!(event.models, vec![model]);
        assert_eq!((event.kw_start_us, event.kw_end_us, event.timestamp_us), (200, 900, 1_000));
        assert_eq!(event.confidence_levels, vec![91]);
    }

    #[test]
    fn empty_payload_is_rejected() {
        let raw = DetectionPayloadWriter::new().build(0);
        assert!(matches!(
            parse_detection_payload(&raw),
            Err(WakegateError::InvalidPayload(_))
        ));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let raw = DetectionPayloadWriter::new().raw_entry(0x42, &[1]).build(0);
        assert!(matches!(
            parse_detection_payload(&raw),
            Err(WakegateError::UnknownPayloadKey(0x42))
        ));
    }

    #[test]
    fn truncated_entry_is_rejected() {
        let mut raw = DetectionPayloadWriter::new().confidence_levels(&[1, 2, 3]).build(0);
        // Shrink the declared payload so the entry overruns it.
        raw[4..8].copy_from_slice(&8u32.to_le_bytes());
        raw.truncate(16);
        assert!(parse_detection_payload(&raw).is_err());
    }

    #[test]
    fn too_many_confidence_values_are_rejected() {
        let levels = vec![1u32; MAX_CONF_VALUES + 1];
        let raw = DetectionPayloadWriter::new().confidence_levels(&levels).build(0);
        assert!(parse_detection_payload(&raw).is_err());
    }
}
