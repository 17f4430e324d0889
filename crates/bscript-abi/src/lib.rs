//! Backend ABI envelopes shared by the kernel and WASM language backends.
//!
//! Every structured value crossing the guest boundary is a CBOR envelope.
//! Inputs (kernel → backend) carry the ABI version and are rejected on
//! mismatch; outputs (backend → kernel) are decoded as-is.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current ABI version carried in backend input envelopes.
pub const ABI_VERSION: u8 = 1;

macro_rules! envelope {
    (input $ty:ident) => {
        impl $ty {
            pub fn decode(bytes: &[u8]) -> Result<Self, AbiDecodeError> {
                let input: $ty = serde_cbor::from_slice(bytes)?;
                if input.version != ABI_VERSION {
                    return Err(AbiDecodeError::UnsupportedVersion {
                        found: input.version,
                    });
                }
                Ok(input)
            }

            pub fn encode(&self) -> Result<Vec<u8>, AbiEncodeError> {
                serde_cbor::to_vec(self).map_err(AbiEncodeError::Cbor)
            }
        }
    };
    (output $ty:ident) => {
        impl $ty {
            pub fn decode(bytes: &[u8]) -> Result<Self, AbiDecodeError> {
                serde_cbor::from_slice(bytes).map_err(AbiDecodeError::Cbor)
            }

            pub fn encode(&self) -> Result<Vec<u8>, AbiEncodeError> {
                serde_cbor::to_vec(self).map_err(AbiEncodeError::Cbor)
            }
        }
    };
}

/// Compile request (kernel → backend).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CompileInput {
    pub version: u8,
    pub source: String,
}

impl CompileInput {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            version: ABI_VERSION,
            source: source.into(),
        }
    }
}

/// Compile result (backend → kernel). Exactly one of `artifact` or
/// `diagnostic` is expected to be set.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Default)]
pub struct CompileOutput {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes_opt"
    )]
    pub artifact: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<Diagnostic>,
}

impl CompileOutput {
    pub fn artifact(bytes: Vec<u8>) -> Self {
        Self {
            artifact: Some(bytes),
            diagnostic: None,
        }
    }

    pub fn failed(diagnostic: Diagnostic) -> Self {
        Self {
            artifact: None,
            diagnostic: Some(diagnostic),
        }
    }
}

/// Run request (kernel → backend).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RunInput {
    pub version: u8,
    #[serde(with = "serde_bytes")]
    pub artifact: Vec<u8>,
    #[serde(default)]
    pub allow_stdin: bool,
}

impl RunInput {
    pub fn new(artifact: Vec<u8>, allow_stdin: bool) -> Self {
        Self {
            version: ABI_VERSION,
            artifact,
            allow_stdin,
        }
    }
}

/// Run result (backend → kernel). Outputs produced before a failure are kept
/// alongside the diagnostic.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Default)]
pub struct RunOutput {
    #[serde(default)]
    pub outputs: Vec<Output>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<Diagnostic>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CompleteInput {
    pub version: u8,
    pub code: String,
    pub cursor_pos: u32,
}

impl CompleteInput {
    pub fn new(code: impl Into<String>, cursor_pos: u32) -> Self {
        Self {
            version: ABI_VERSION,
            code: code.into(),
            cursor_pos,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Default)]
pub struct CompleteOutput {
    #[serde(default)]
    pub matches: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_end: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct InspectInput {
    pub version: u8,
    pub token: String,
    #[serde(default)]
    pub detail_level: u8,
}

impl InspectInput {
    pub fn new(token: impl Into<String>, detail_level: u8) -> Self {
        Self {
            version: ABI_VERSION,
            token: token.into(),
            detail_level,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Default)]
pub struct InspectOutput {
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct IsCompleteInput {
    pub version: u8,
    pub code: String,
}

impl IsCompleteInput {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            version: ABI_VERSION,
            code: code.into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct IsCompleteOutput {
    pub status: Completeness,
    /// Suggested indentation for the next line when `Incomplete`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indent: Option<String>,
}

envelope!(input CompileInput);
envelope!(output CompileOutput);
envelope!(input RunInput);
envelope!(output RunOutput);
envelope!(input CompleteInput);
envelope!(output CompleteOutput);
envelope!(input InspectInput);
envelope!(output InspectOutput);
envelope!(input IsCompleteInput);
envelope!(output IsCompleteOutput);

/// Structured diagnostic reported by a backend for a failed compile or run.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Diagnostic {
    /// Error kind (e.g. `SyntaxError`); the kernel picks a default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default)]
    pub traceback: Vec<String>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
            location: None,
            traceback: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.location = Some(Location { line, column });
        self
    }
}

/// One-based source position.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

/// A single value produced by running a snippet.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Output {
    Stream { name: StreamName, text: String },
    /// Printable result of the snippet's final expression.
    Value { text: String },
    /// Rich display data keyed by MIME type.
    Display { data: BTreeMap<String, String> },
}

impl Output {
    pub fn stdout(text: impl Into<String>) -> Self {
        Output::Stream {
            name: StreamName::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Output::Stream {
            name: StreamName::Stderr,
            text: text.into(),
        }
    }

    pub fn value(text: impl Into<String>) -> Self {
        Output::Value { text: text.into() }
    }

    pub fn display(mime: impl Into<String>, data: impl Into<String>) -> Self {
        let mut bundle = BTreeMap::new();
        bundle.insert(mime.into(), data.into());
        Output::Display { data: bundle }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Result of a best-effort completeness check.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    Complete,
    Incomplete,
    Invalid,
    Unknown,
}

mod serde_bytes_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_bytes::{ByteBuf, Bytes};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_some(Bytes::new(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<ByteBuf>::deserialize(deserializer).map(|opt| opt.map(|buf| buf.into_vec()))
    }
}

#[derive(Debug, Error)]
pub enum AbiDecodeError {
    #[error("ABI version {found} is not supported (expected {ABI_VERSION})")]
    UnsupportedVersion { found: u8 },
    #[error("failed to decode envelope: {0}")]
    Cbor(#[from] serde_cbor::Error),
}

#[derive(Debug, Error)]
pub enum AbiEncodeError {
    #[error("failed to encode envelope: {0}")]
    Cbor(#[from] serde_cbor::Error),
}
