//! Canned WASM backends for tests: every envelope export answers with fixed
//! CBOR bytes, or spins forever to exercise interrupts.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use bscript_abi::{CompileOutput, RunOutput};

use crate::guest::{
    ALLOC_EXPORT, COMPILE_EXPORT, CREATE_EXPORT, FREE_EXPORT, MEMORY_EXPORT, RUN_EXPORT,
};

#[derive(Debug, Clone)]
enum Reply {
    Bytes(Vec<u8>),
    Spin,
}

/// Builder for a stub backend module in WAT form.
#[derive(Debug, Clone)]
pub struct StubBackend {
    replies: Vec<(&'static str, Reply)>,
    create_result: Option<i32>,
    free_result: i32,
    omitted: Vec<&'static str>,
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StubBackend {
    /// A backend whose compile yields a one-byte artifact and whose run yields no outputs.
    pub fn new() -> Self {
        let compiled = CompileOutput::artifact(vec![0])
            .encode()
            .expect("encode stub compile output");
        let ran = RunOutput::default()
            .encode()
            .expect("encode stub run output");
        Self {
            replies: vec![
                (COMPILE_EXPORT, Reply::Bytes(compiled)),
                (RUN_EXPORT, Reply::Bytes(ran)),
            ],
            create_result: None,
            free_result: 0,
            omitted: Vec::new(),
        }
    }

    /// Answer calls to the envelope export `name` with `bytes`.
    pub fn reply(mut self, name: &'static str, bytes: Vec<u8>) -> Self {
        self.set(name, Reply::Bytes(bytes));
        self
    }

    /// Make the envelope export `name` loop until interrupted.
    pub fn spin(mut self, name: &'static str) -> Self {
        self.set(name, Reply::Spin);
        self
    }

    /// Fixed return value for `create_instance` (negative means refusal).
    pub fn create_result(mut self, code: i32) -> Self {
        self.create_result = Some(code);
        self
    }

    pub fn free_result(mut self, code: i32) -> Self {
        self.free_result = code;
        self
    }

    /// Leave the export `name` out of the module.
    pub fn without(mut self, name: &'static str) -> Self {
        self.omitted.push(name);
        self
    }

    pub fn wat(&self) -> String {
        let mut data = String::new();
        let mut funcs = String::new();
        let mut offset = 0usize;

        for (name, reply) in &self.replies {
            if self.omitted.contains(name) {
                continue;
            }
            match reply {
                Reply::Bytes(bytes) => {
                    let literal = bytes
                        .iter()
                        .map(|b| format!("\\{:02x}", b))
                        .collect::<String>();
                    let _ = writeln!(data, "  (data (i32.const {offset}) \"{literal}\")");
                    let _ = writeln!(
                        funcs,
                        "  (func (export \"{name}\") (param $res i32) (param i32 i32 i32)\n    local.get $res\n    i32.const {offset}\n    i32.const {len}\n    call $reply)",
                        len = bytes.len()
                    );
                    offset = align8(offset + bytes.len());
                }
                Reply::Spin => {
                    let _ = writeln!(
                        funcs,
                        "  (func (export \"{name}\") (param i32 i32 i32 i32)\n    (loop $spin\n      br $spin))"
                    );
                }
            }
        }

        let heap = align8(offset.max(8));
        let memory = if self.omitted.contains(&MEMORY_EXPORT) {
            "  (memory 1)".to_string()
        } else {
            format!("  (memory (export \"{MEMORY_EXPORT}\") 1)")
        };
        let alloc = self.export_attr(ALLOC_EXPORT);
        let create = self.export_attr(CREATE_EXPORT);
        let free = self.export_attr(FREE_EXPORT);
        let create_body = match self.create_result {
            Some(code) => format!("    i32.const {code}"),
            None => "    global.get $next\n    global.get $next\n    i32.const 1\n    i32.add\n    global.set $next"
                .to_string(),
        };

        format!(
            r#"(module
{memory}
  (global $heap (mut i32) (i32.const {heap}))
  (global $next (mut i32) (i32.const 0))
{data}  (func $reply (param $res i32) (param $ptr i32) (param $len i32)
    local.get $res
    local.get $ptr
    i32.store
    local.get $res
    local.get $len
    i32.store offset=4)
  (func {alloc}(param i32) (result i32)
    (local $old i32)
    global.get $heap
    local.tee $old
    local.get 0
    i32.add
    global.set $heap
    local.get $old)
  (func {create}(result i32)
{create_body})
  (func {free}(param i32) (result i32)
    i32.const {free_result})
{funcs})"#,
            free_result = self.free_result,
        )
    }

    pub fn wasm(&self) -> Vec<u8> {
        wat::parse_str(self.wat()).expect("stub backend WAT should parse")
    }

    /// Write the module to `dir/backend.wasm` and return its path.
    pub fn write_to(&self, dir: &Path) -> PathBuf {
        let path = dir.join("backend.wasm");
        std::fs::write(&path, self.wasm()).expect("write stub backend");
        path
    }

    fn set(&mut self, name: &'static str, reply: Reply) {
        match self.replies.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = reply,
            None => self.replies.push((name, reply)),
        }
    }

    fn export_attr(&self, name: &str) -> String {
        if self.omitted.iter().any(|omitted| *omitted == name) {
            String::new()
        } else {
            format!("(export \"{name}\") ")
        }
    }
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}
