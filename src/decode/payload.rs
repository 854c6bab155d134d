//! Object payload decoding.
//!
//! Payloads are JSON documents carrying a `class` and, optionally, an
//! explicit `schema` version. When the version is absent it comes from
//! the class map delivered in SCHEMA frames, and defaults to 1.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use super::DecodeError;
use crate::merge::histogram::{Axis, Histogram};

const DEFAULT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    class: String,
    #[serde(default)]
    schema: Option<u32>,
}

/// Version 1: name and bin contents only.
#[derive(Debug, Deserialize)]
struct HistogramV1 {
    name: String,
    bins: Vec<f64>,
}

/// Version 2: adds title, axis range and an explicit entry count.
#[derive(Debug, Deserialize)]
struct HistogramV2 {
    name: String,
    #[serde(default)]
    title: String,
    x_min: f64,
    x_max: f64,
    bins: Vec<f64>,
    #[serde(default)]
    entries: Option<f64>,
}

/// Turns object payloads into histograms, remembering schema registrations.
#[derive(Debug, Default)]
pub struct PayloadDecoder {
    versions: HashMap<String, u32>,
}

impl PayloadDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a `{"<class>": <version>, ...}` map from a SCHEMA frame.
    /// Returns the number of classes in the frame.
    pub fn register_schema(&mut self, data: &[u8]) -> Result<usize, DecodeError> {
        let versions: HashMap<String, u32> =
            serde_json::from_slice(data).map_err(|e| DecodeError::InvalidSchema(e.to_string()))?;
        let count = versions.len();
        self.versions.extend(versions);
        Ok(count)
    }

    /// Version that applies to `class` when a payload does not say.
    pub fn schema_version(&self, class: &str) -> u32 {
        self.versions
            .get(class)
            .copied()
            .unwrap_or(DEFAULT_SCHEMA_VERSION)
    }

    pub fn decode(&self, data: &[u8]) -> Result<Histogram, DecodeError> {
        let value: Value = serde_json::from_slice(data)?;
        let envelope = Envelope::deserialize(&value)?;
        let version = envelope
            .schema
            .unwrap_or_else(|| self.schema_version(&envelope.class));

        let histogram = match version {
            1 => {
                let v1 = HistogramV1::deserialize(value)?;
                Histogram::new(v1.name, v1.bins)
            }
            2 => {
                let v2 = HistogramV2::deserialize(value)?;
                let entries = v2.entries.unwrap_or_else(|| v2.bins.iter().sum());
                Histogram {
                    name: v2.name,
                    title: v2.title,
                    axis: Some(Axis {
                        min: v2.x_min,
                        max: v2.x_max,
                    }),
                    bins: v2.bins,
                    entries,
                }
            }
            other => {
                return Err(DecodeError::UnsupportedSchema {
                    class: envelope.class,
                    version: other,
                })
            }
        };

        if histogram.name.is_empty() {
            return Err(DecodeError::EmptyName);
        }

        Ok(histogram)
    }
}
