//! Completion, inspection, completeness, kernel-info and history queries.

use std::collections::BTreeMap;

use bscript_abi::Completeness;

use crate::error::KernelError;
use crate::kernel::{KERNEL_VERSION, Kernel};
use crate::reply::{
    CompleteReply, CompleteRequest, HistoryEntry, HistoryRequest, InspectReply, InspectRequest,
    IsCompleteReply, KernelInfo, LanguageInfo,
};

pub const PROTOCOL_VERSION: &str = "5.3";
pub const IMPLEMENTATION: &str = "bscript";
pub const LANGUAGE_NAME: &str = "BraneScript";
pub const LANGUAGE_VERSION: &str = "0.5.0";

/// Char range `[start, end)` of the identifier under `cursor_pos`, plus the identifier.
/// The cursor is clamped to the code length.
pub fn token_at(code: &str, cursor_pos: usize) -> (usize, usize, String) {
    let chars: Vec<char> = code.chars().collect();
    let cursor = cursor_pos.min(chars.len());
    let is_ident = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.';

    let mut start = cursor;
    while start > 0 && is_ident(chars[start - 1]) {
        start -= 1;
    }
    let mut end = cursor;
    while end < chars.len() && is_ident(chars[end]) {
        end += 1;
    }
    (start, end, chars[start..end].iter().collect())
}

impl Kernel {
    pub fn complete(&mut self, request: &CompleteRequest) -> Result<CompleteReply, KernelError> {
        self.require_ready()?;
        let (start, end, _) = token_at(&request.code, request.cursor_pos);
        let mut reply = CompleteReply {
            matches: Vec::new(),
            cursor_start: start,
            cursor_end: end,
        };
        let Some(backend) = self.backend.as_deref_mut() else {
            return Ok(reply);
        };
        let instance = request
            .session
            .as_deref()
            .and_then(|id| self.sessions.get(id))
            .map(|entry| &entry.instance);
        let cursor = request.cursor_pos.min(request.code.chars().count());
        match backend.complete(instance, &request.code, cursor) {
            Ok(Some(output)) => {
                reply.matches = output.matches;
                if let Some(start) = output.cursor_start {
                    reply.cursor_start = start as usize;
                }
                if let Some(end) = output.cursor_end {
                    reply.cursor_end = end as usize;
                }
            }
            Ok(None) => {}
            Err(err) => log::warn!("backend completion failed: {err}"),
        }
        Ok(reply)
    }

    pub fn inspect(&mut self, request: &InspectRequest) -> Result<InspectReply, KernelError> {
        self.require_ready()?;
        let (_, _, token) = token_at(&request.code, request.cursor_pos);
        if token.is_empty() {
            return Ok(InspectReply::default());
        }
        let Some(backend) = self.backend.as_deref_mut() else {
            return Ok(InspectReply::default());
        };
        let instance = request
            .session
            .as_deref()
            .and_then(|id| self.sessions.get(id))
            .map(|entry| &entry.instance);
        let output = match backend.inspect(instance, &token, request.detail_level) {
            Ok(Some(output)) => output,
            Ok(None) => return Ok(InspectReply::default()),
            Err(err) => {
                log::warn!("backend inspection of '{token}' failed: {err}");
                return Ok(InspectReply::default());
            }
        };
        let mut data = BTreeMap::new();
        if let Some(text) = output.text.filter(|_| output.found) {
            data.insert("text/plain".to_string(), text);
        }
        Ok(InspectReply {
            found: output.found,
            data,
        })
    }

    pub fn is_complete(&mut self, code: &str) -> Result<IsCompleteReply, KernelError> {
        self.require_ready()?;
        if code.trim().is_empty() {
            return Ok(IsCompleteReply::Complete);
        }
        let Some(backend) = self.backend.as_deref_mut() else {
            return Ok(IsCompleteReply::Unknown);
        };
        let output = match backend.is_complete(code) {
            Ok(Some(output)) => output,
            Ok(None) => return Ok(IsCompleteReply::Unknown),
            Err(err) => {
                log::warn!("backend completeness check failed: {err}");
                return Ok(IsCompleteReply::Unknown);
            }
        };
        Ok(match output.status {
            Completeness::Complete => IsCompleteReply::Complete,
            Completeness::Incomplete => IsCompleteReply::Incomplete {
                indent: output.indent.unwrap_or_default(),
            },
            Completeness::Invalid => IsCompleteReply::Invalid,
            Completeness::Unknown => IsCompleteReply::Unknown,
        })
    }

    pub fn kernel_info(&self) -> Result<KernelInfo, KernelError> {
        self.require_ready()?;
        Ok(KernelInfo {
            protocol_version: PROTOCOL_VERSION.into(),
            implementation: IMPLEMENTATION.into(),
            implementation_version: KERNEL_VERSION.into(),
            language_info: LanguageInfo {
                name: LANGUAGE_NAME.into(),
                version: LANGUAGE_VERSION.into(),
                mimetype: "text/plain".into(),
                file_extension: ".bs".into(),
            },
            banner: format!("{IMPLEMENTATION} v{KERNEL_VERSION} ({LANGUAGE_NAME} {LANGUAGE_VERSION})"),
        })
    }

    pub fn history(&self, request: &HistoryRequest) -> Result<Vec<HistoryEntry>, KernelError> {
        self.require_ready()?;
        Ok(self.history.tail(request.session.as_deref(), request.last_n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_spans_identifier_around_cursor() {
        let (start, end, token) = token_at("print(foo.bar + 1)", 8);
        assert_eq!((start, end), (6, 13));
        assert_eq!(token, "foo.bar");
    }

    #[test]
    fn token_cursor_is_clamped() {
        assert_eq!(token_at("abc", 99), (0, 3, "abc".to_string()));
        assert_eq!(token_at("", 5), (0, 0, String::new()));
        assert_eq!(token_at("a + ", 3), (3, 3, String::new()));
    }

    #[test]
    fn token_counts_chars_not_bytes() {
        let (start, end, token) = token_at("é = xs", 6);
        assert_eq!((start, end), (4, 6));
        assert_eq!(token, "xs");
    }
}
