//! Response converters: turn values into bytes and back.

use std::io::{Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConverterError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding failed: {0}")]
    Encode(String),

    #[error("decoding failed: {0}")]
    Decode(String),
}

/// Serialization format used by a persistent cache.
pub trait ResponseConverter: Send + Sync {
    /// File extension for stored entries, without the dot.
    fn extension(&self) -> &'static str;

    fn save_object<T: Serialize>(&self, value: &T, out: &mut dyn Write) -> Result<(), ConverterError>;

    fn restore_object<T: DeserializeOwned>(&self, input: &mut dyn Read) -> Result<T, ConverterError>;
}

/// JSON via `serde_json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonConverter {
    pretty: bool,
}

impl JsonConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indented output, for caches meant to be inspected by hand.
    pub fn pretty() -> Self {
        Self { pretty: true }
    }
}

impl ResponseConverter for JsonConverter {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn save_object<T: Serialize>(&self, value: &T, out: &mut dyn Write) -> Result<(), ConverterError> {
        let written = if self.pretty {
            serde_json::to_writer_pretty(&mut *out, value)
        } else {
            serde_json::to_writer(&mut *out, value)
        };
        written.map_err(|e| {
            if e.is_io() {
                ConverterError::Io(e.into())
            } else {
                ConverterError::Encode(e.to_string())
            }
        })?;
        out.flush()?;
        Ok(())
    }

    fn restore_object<T: DeserializeOwned>(&self, input: &mut dyn Read) -> Result<T, ConverterError> {
        serde_json::from_reader(input).map_err(|e| {
            if e.is_io() {
                ConverterError::Io(e.into())
            } else {
                ConverterError::Decode(e.to_string())
            }
        })
    }
}
