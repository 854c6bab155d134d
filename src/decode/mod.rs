pub mod payload;

use std::collections::BTreeMap;
use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use self::payload::PayloadDecoder;
use crate::merge::NamedObject;
use crate::run::RunNumber;

/// Errors raised while decoding a single frame pair.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("frame {tag:?} has no payload frame")]
    MissingPayload { tag: String },

    #[error("{kind} payload is not valid UTF-8")]
    InvalidUtf8 { kind: &'static str },

    #[error("{kind} descriptor too short: {size} bytes")]
    ShortDescriptor { kind: &'static str, size: usize },

    #[error("decoding object payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("class {class:?}: unsupported schema version {version}")]
    UnsupportedSchema { class: String, version: u32 },

    #[error("invalid schema frame: {0}")]
    InvalidSchema(String),

    #[error("object payload has an empty name")]
    EmptyName,
}

/// Classification of a frame pair by its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Info,
    Schema,
    StartOfRun,
    EndOfRun,
    Data,
    Unrecognized,
}

impl FrameKind {
    /// Maps a tag to its kind. Both the short and the eight-character
    /// padded spellings are accepted.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "INFO" | "INFO____" => Self::Info,
            "SCHEMA" | "ROOTSTRI" => Self::Schema,
            "SOR" | "STARTOFR" => Self::StartOfRun,
            "EOR" | "ENDOFRUN" => Self::EndOfRun,
            "" | "DATA" | "ROOTTOBJ" | "ROOTHIST" => Self::Data,
            _ => Self::Unrecognized,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Schema => "schema",
            Self::StartOfRun => "start_of_run",
            Self::EndOfRun => "end_of_run",
            Self::Data => "data",
            Self::Unrecognized => "unrecognized",
        }
    }
}

/// Contents of an INFO frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunInfo {
    pub run_number: RunNumber,
    pub mode: Option<String>,
    pub params: BTreeMap<String, String>,
}

impl RunInfo {
    /// Parses `key=value` pairs separated by whitespace or `;`.
    /// Tokens without `=` are ignored.
    pub fn parse(text: &str) -> Self {
        let params: BTreeMap<String, String> = text
            .split(|c: char| c.is_whitespace() || c == ';')
            .filter_map(|token| token.split_once('='))
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        let run_number = params
            .get("run")
            .map(|v| RunNumber::parse(v))
            .unwrap_or_default();
        let mode = params
            .get("HLTmode")
            .or_else(|| params.get("mode"))
            .filter(|m| !m.is_empty())
            .cloned();

        Self {
            run_number,
            mode,
            params,
        }
    }
}

/// Binary run descriptor carried by SOR and EOR frames.
///
/// Layout, little-endian: `u32` size, `u32` run number, optional `u32` run type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunDescriptor {
    pub run_number: RunNumber,
    pub run_type: Option<u32>,
}

impl RunDescriptor {
    pub fn parse(kind: FrameKind, data: &[u8]) -> Result<Self, DecodeError> {
        let word = |at: usize| {
            data.get(at..at + 4)
                .and_then(|b| <[u8; 4]>::try_from(b).ok())
                .map(u32::from_le_bytes)
        };

        let run = word(4).ok_or(DecodeError::ShortDescriptor {
            kind: kind.as_str(),
            size: data.len(),
        })?;

        Ok(Self {
            run_number: RunNumber::from_raw(run),
            run_type: word(8),
        })
    }

    /// Encodes a descriptor in the wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let size: u32 = if self.run_type.is_some() { 12 } else { 8 };
        let mut out = Vec::with_capacity(size as usize);
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&self.run_number.as_u32().to_le_bytes());
        if let Some(run_type) = self.run_type {
            out.extend_from_slice(&run_type.to_le_bytes());
        }
        out
    }
}

/// A decoded frame pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Info(RunInfo),
    Schema { classes: usize },
    StartOfRun(RunDescriptor),
    EndOfRun(RunDescriptor),
    Data(NamedObject),
    Unrecognized { tag: String },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Info(_) => FrameKind::Info,
            Self::Schema { .. } => FrameKind::Schema,
            Self::StartOfRun(_) => FrameKind::StartOfRun,
            Self::EndOfRun(_) => FrameKind::EndOfRun,
            Self::Data(_) => FrameKind::Data,
            Self::Unrecognized { .. } => FrameKind::Unrecognized,
        }
    }
}

/// Result of decoding one multi-part message. Errors are per frame pair:
/// a bad pair does not prevent the rest of the message from decoding.
#[derive(Debug, Default)]
pub struct Decoded {
    pub frames: Vec<Frame>,
    pub errors: Vec<DecodeError>,
}

/// Splits multi-part messages into tagged frame pairs.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    payloads: PayloadDecoder,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `parts` as `(tag, payload)` pairs stamped with `observed_at`.
    pub fn decode(&mut self, parts: &[Bytes], observed_at: Instant) -> Decoded {
        let mut decoded = Decoded::default();

        for pair in parts.chunks(2) {
            let tag = parse_tag(&pair[0]);
            let Some(data) = pair.get(1) else {
                decoded.errors.push(DecodeError::MissingPayload { tag });
                continue;
            };

            match self.decode_pair(tag, data, observed_at) {
                Ok(frame) => decoded.frames.push(frame),
                Err(e) => decoded.errors.push(e),
            }
        }

        debug!(
            parts = parts.len(),
            frames = decoded.frames.len(),
            errors = decoded.errors.len(),
            "decoded message",
        );

        decoded
    }

    fn decode_pair(
        &mut self,
        tag: String,
        data: &[u8],
        observed_at: Instant,
    ) -> Result<Frame, DecodeError> {
        let kind = FrameKind::from_tag(&tag);
        match kind {
            FrameKind::Info => {
                let text = std::str::from_utf8(data)
                    .map_err(|_| DecodeError::InvalidUtf8 { kind: kind.as_str() })?;
                Ok(Frame::Info(RunInfo::parse(text)))
            }
            FrameKind::Schema => {
                let classes = self.payloads.register_schema(data)?;
                Ok(Frame::Schema { classes })
            }
            FrameKind::StartOfRun => Ok(Frame::StartOfRun(RunDescriptor::parse(kind, data)?)),
            FrameKind::EndOfRun => Ok(Frame::EndOfRun(RunDescriptor::parse(kind, data)?)),
            FrameKind::Data => {
                let payload = self.payloads.decode(data)?;
                Ok(Frame::Data(NamedObject {
                    name: payload.name.clone(),
                    payload,
                    observed_at,
                }))
            }
            FrameKind::Unrecognized => Ok(Frame::Unrecognized { tag }),
        }
    }
}

/// Tags may be NUL- or space-padded to a fixed width.
fn parse_tag(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}
