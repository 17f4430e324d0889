//! Decoded request and reply records exchanged with the transport.

use std::collections::{BTreeMap, HashMap};

use bscript_abi::Output;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::KernelError;

fn default_true() -> bool {
    true
}

/// One execute request; immutable once received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub session: String,
    pub execution_counter: u64,
    pub code: String,
    #[serde(default)]
    pub silent: bool,
    #[serde(default = "default_true")]
    pub store_history: bool,
    #[serde(default)]
    pub allow_stdin: bool,
    /// Accepted but never evaluated; echoed back empty.
    #[serde(default)]
    pub user_expressions: BTreeMap<String, String>,
}

impl ExecutionRequest {
    pub fn new(session: impl Into<String>, execution_counter: u64, code: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            execution_counter,
            code: code.into(),
            silent: false,
            store_history: true,
            allow_stdin: false,
            user_expressions: BTreeMap::new(),
        }
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn store_history(mut self, store_history: bool) -> Self {
        self.store_history = store_history;
        self
    }

    pub fn allow_stdin(mut self, allow_stdin: bool) -> Self {
        self.allow_stdin = allow_stdin;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionReply {
    #[serde(rename = "ok")]
    Success {
        execution_counter: u64,
        outputs: Vec<Output>,
        #[serde(default)]
        payload: Vec<JsonValue>,
        #[serde(default)]
        user_expressions: HashMap<String, JsonValue>,
    },
    Error {
        execution_counter: u64,
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

impl ExecutionReply {
    pub fn success(execution_counter: u64, outputs: Vec<Output>) -> Self {
        ExecutionReply::Success {
            execution_counter,
            outputs,
            payload: Vec::new(),
            user_expressions: HashMap::new(),
        }
    }

    /// Error reply for `err`, tagged with the request's counter.
    pub fn from_error(execution_counter: u64, err: &KernelError) -> Self {
        let evalue = match err {
            KernelError::Compile(diag) | KernelError::Runtime(diag) => diag.message.clone(),
            other => other.to_string(),
        };
        ExecutionReply::Error {
            execution_counter,
            ename: err.ename().to_string(),
            evalue,
            traceback: err.traceback(),
        }
    }

    pub fn execution_counter(&self) -> u64 {
        match self {
            ExecutionReply::Success {
                execution_counter, ..
            }
            | ExecutionReply::Error {
                execution_counter, ..
            } => *execution_counter,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionReply::Success { .. })
    }

    pub fn ename(&self) -> Option<&str> {
        match self {
            ExecutionReply::Error { ename, .. } => Some(ename),
            ExecutionReply::Success { .. } => None,
        }
    }

    pub fn outputs(&self) -> &[Output] {
        match self {
            ExecutionReply::Success { outputs, .. } => outputs,
            ExecutionReply::Error { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub session: Option<String>,
    pub code: String,
    pub cursor_pos: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteReply {
    pub matches: Vec<String>,
    pub cursor_start: usize,
    pub cursor_end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectRequest {
    #[serde(default)]
    pub session: Option<String>,
    pub code: String,
    pub cursor_pos: usize,
    #[serde(default)]
    pub detail_level: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectReply {
    pub found: bool,
    /// MIME bundle; empty when nothing was found.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IsCompleteReply {
    Complete,
    Incomplete { indent: String },
    Invalid,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageInfo {
    pub name: String,
    pub version: String,
    pub mimetype: String,
    pub file_extension: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub protocol_version: String,
    pub implementation: String,
    pub implementation_version: String,
    pub language_info: LanguageInfo,
    pub banner: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    #[serde(default)]
    pub session: Option<String>,
    pub last_n: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub session: String,
    pub execution_counter: u64,
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bscript_abi::Diagnostic;
    use serde_json::json;

    #[test]
    fn request_defaults_store_history() {
        let request: ExecutionRequest = serde_json::from_value(json!({
            "session": "A",
            "execution_counter": 3,
            "code": "x = 1",
        }))
        .unwrap();
        assert!(request.store_history);
        assert!(!request.silent);
        assert!(!request.allow_stdin);
        assert_eq!(request, ExecutionRequest::new("A", 3, "x = 1"));
    }

    #[test]
    fn success_reply_is_tagged_ok() {
        let reply = ExecutionReply::success(7, vec![Output::value("1")]);
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["execution_counter"], 7);
        assert_eq!(value["outputs"][0]["kind"], "value");
        assert_eq!(value["user_expressions"], json!({}));
    }

    #[test]
    fn compile_error_reply_uses_diagnostic() {
        let diag = Diagnostic::new("unexpected end of input")
            .with_kind("SyntaxError")
            .at(1, 4);
        let reply = ExecutionReply::from_error(2, &KernelError::Compile(diag));
        assert_eq!(
            reply,
            ExecutionReply::Error {
                execution_counter: 2,
                ename: "SyntaxError".into(),
                evalue: "unexpected end of input".into(),
                traceback: vec!["at line 1, column 4".into()],
            }
        );
        assert_eq!(reply.execution_counter(), 2);
        assert!(!reply.is_success());
    }

    #[test]
    fn is_complete_reply_carries_indent() {
        let value = serde_json::to_value(IsCompleteReply::Incomplete {
            indent: "    ".into(),
        })
        .unwrap();
        assert_eq!(value, json!({"status": "incomplete", "indent": "    "}));
    }
}
