//! Backend entry point table and per-session guest instances.
//!
//! Guest calling convention: envelope functions take
//! `(result_ptr, handle, input_ptr, input_len)` and write the CBOR output's
//! `(ptr, len)` as two little-endian `i32`s at `result_ptr`. Input and result
//! buffers are obtained through the guest's `alloc`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use bscript_abi::{
    AbiDecodeError, AbiEncodeError, CompileInput, CompileOutput, CompleteInput, CompleteOutput,
    InspectInput, InspectOutput, IsCompleteInput, IsCompleteOutput, RunInput, RunOutput,
};
use wasmtime::{Engine, ExternType, Linker, Memory, Module, Store, Trap, TypedFunc};

use crate::{InterruptHandle, LoadError};

pub const MEMORY_EXPORT: &str = "memory";
pub const ALLOC_EXPORT: &str = "alloc";
pub const CREATE_EXPORT: &str = "create_instance";
pub const FREE_EXPORT: &str = "free_instance";
pub const COMPILE_EXPORT: &str = "compile";
pub const RUN_EXPORT: &str = "run";
pub const COMPLETE_EXPORT: &str = "complete";
pub const INSPECT_EXPORT: &str = "inspect";
pub const IS_COMPLETE_EXPORT: &str = "is_complete";

/// Handle passed to envelope functions of an instance-less (scratch) guest.
const NO_HANDLE: i32 = -1;

type EnvelopeFn = TypedFunc<(i32, i32, i32, i32), ()>;

#[derive(Debug, thiserror::Error)]
pub enum GuestError {
    #[error("guest execution interrupted")]
    Interrupted,
    #[error("backend refused to create an instance (code {0})")]
    CreateRefused(i32),
    #[error("backend failed to free instance {handle} (code {code})")]
    FreeFailed { handle: i32, code: i32 },
    #[error("backend does not export '{0}'")]
    Unsupported(&'static str),
    #[error(transparent)]
    Encode(#[from] AbiEncodeError),
    #[error("backend returned an invalid envelope: {0}")]
    Decode(#[from] AbiDecodeError),
    #[error("guest call failed: {0:#}")]
    Call(anyhow::Error),
}

impl GuestError {
    fn from_call(err: anyhow::Error) -> Self {
        if matches!(err.downcast_ref::<Trap>(), Some(Trap::Interrupt)) {
            GuestError::Interrupted
        } else {
            GuestError::Call(err)
        }
    }
}

/// Which optional entry points the module exports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportTable {
    pub complete: bool,
    pub inspect: bool,
    pub is_complete: bool,
}

impl ExportTable {
    pub(crate) fn resolve(module: &Module) -> Result<Self, LoadError> {
        let mut memory = false;
        let mut found: Vec<(&str, usize, usize)> = Vec::new();
        for export in module.exports() {
            match export.ty() {
                ExternType::Memory(_) if export.name() == MEMORY_EXPORT => memory = true,
                ExternType::Func(func) => {
                    found.push((export.name(), func.params().len(), func.results().len()))
                }
                _ => {}
            }
        }
        if !memory {
            return Err(LoadError::MissingSymbol(MEMORY_EXPORT.into()));
        }

        let lookup = |name: &str, params: usize, results: usize, expected: &'static str| {
            match found.iter().find(|(n, _, _)| *n == name) {
                None => Ok(false),
                Some((_, p, r)) if *p == params && *r == results => Ok(true),
                Some(_) => Err(LoadError::BadSignature {
                    name: name.to_string(),
                    expected,
                }),
            }
        };
        let require = |name: &str, params: usize, results: usize, expected: &'static str| {
            if lookup(name, params, results, expected)? {
                Ok(())
            } else {
                Err(LoadError::MissingSymbol(name.to_string()))
            }
        };

        require(ALLOC_EXPORT, 1, 1, "(i32) -> i32")?;
        require(CREATE_EXPORT, 0, 1, "() -> i32")?;
        require(FREE_EXPORT, 1, 1, "(i32) -> i32")?;
        require(COMPILE_EXPORT, 4, 0, "(i32, i32, i32, i32)")?;
        require(RUN_EXPORT, 4, 0, "(i32, i32, i32, i32)")?;

        Ok(Self {
            complete: lookup(COMPLETE_EXPORT, 4, 0, "(i32, i32, i32, i32)")?,
            inspect: lookup(INSPECT_EXPORT, 4, 0, "(i32, i32, i32, i32)")?,
            is_complete: lookup(IS_COMPLETE_EXPORT, 4, 0, "(i32, i32, i32, i32)")?,
        })
    }
}

/// A compiled backend module whose entry points have been verified.
pub struct LoadedModule {
    engine: Arc<Engine>,
    module: Arc<Module>,
    exports: ExportTable,
    path: PathBuf,
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("path", &self.path)
            .field("exports", &self.exports)
            .finish_non_exhaustive()
    }
}

impl LoadedModule {
    pub(crate) fn new(
        engine: Arc<Engine>,
        module: Arc<Module>,
        exports: ExportTable,
        path: PathBuf,
    ) -> Self {
        Self {
            engine,
            module,
            exports,
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exports(&self) -> &ExportTable {
        &self.exports
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            engine: self.engine.clone(),
        }
    }

    /// Instantiate the module in a fresh store and ask it for a compiler instance.
    pub fn instantiate(&self) -> Result<GuestInstance, GuestError> {
        let mut guest = self.instantiate_raw()?;
        guest.store.set_epoch_deadline(1);
        let create = guest
            .create
            .call(&mut guest.store, ())
            .map_err(GuestError::from_call)?;
        if create < 0 {
            return Err(GuestError::CreateRefused(create));
        }
        guest.handle = create;
        Ok(guest)
    }

    /// Instantiate the module without a compiler instance, for session-less queries.
    pub fn scratch(&self) -> Result<GuestInstance, GuestError> {
        self.instantiate_raw()
    }

    fn instantiate_raw(&self) -> Result<GuestInstance, GuestError> {
        let mut store = Store::new(&self.engine, ());
        store.set_epoch_deadline(1);
        let linker = Linker::new(&self.engine);
        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(GuestError::from_call)?;
        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .context("wasm export 'memory' not found")
            .map_err(GuestError::Call)?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, ALLOC_EXPORT)
            .map_err(GuestError::Call)?;
        let create = instance
            .get_typed_func::<(), i32>(&mut store, CREATE_EXPORT)
            .map_err(GuestError::Call)?;
        let free = instance
            .get_typed_func::<i32, i32>(&mut store, FREE_EXPORT)
            .map_err(GuestError::Call)?;
        let compile = instance
            .get_typed_func::<(i32, i32, i32, i32), ()>(&mut store, COMPILE_EXPORT)
            .map_err(GuestError::Call)?;
        let run = instance
            .get_typed_func::<(i32, i32, i32, i32), ()>(&mut store, RUN_EXPORT)
            .map_err(GuestError::Call)?;
        let optional = |store: &mut Store<()>, present: bool, name: &str| {
            if !present {
                return Ok(None);
            }
            instance
                .get_typed_func::<(i32, i32, i32, i32), ()>(store, name)
                .map(Some)
                .map_err(GuestError::Call)
        };
        let complete = optional(&mut store, self.exports.complete, COMPLETE_EXPORT)?;
        let inspect = optional(&mut store, self.exports.inspect, INSPECT_EXPORT)?;
        let is_complete = optional(&mut store, self.exports.is_complete, IS_COMPLETE_EXPORT)?;

        Ok(GuestInstance {
            store,
            memory,
            alloc,
            create,
            free,
            compile,
            run,
            complete,
            inspect,
            is_complete,
            handle: NO_HANDLE,
        })
    }
}

/// One guest store plus the compiler instance handle it created.
pub struct GuestInstance {
    store: Store<()>,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    create: TypedFunc<(), i32>,
    free: TypedFunc<i32, i32>,
    compile: EnvelopeFn,
    run: EnvelopeFn,
    complete: Option<EnvelopeFn>,
    inspect: Option<EnvelopeFn>,
    is_complete: Option<EnvelopeFn>,
    handle: i32,
}

impl std::fmt::Debug for GuestInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestInstance")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl GuestInstance {
    pub fn handle(&self) -> i32 {
        self.handle
    }

    pub fn is_scratch(&self) -> bool {
        self.handle == NO_HANDLE
    }

    pub fn compile(&mut self, input: &CompileInput) -> Result<CompileOutput, GuestError> {
        let bytes = self.call(self.compile.clone(), &input.encode()?)?;
        Ok(CompileOutput::decode(&bytes)?)
    }

    pub fn run(&mut self, input: &RunInput) -> Result<RunOutput, GuestError> {
        let bytes = self.call(self.run.clone(), &input.encode()?)?;
        Ok(RunOutput::decode(&bytes)?)
    }

    pub fn complete(&mut self, input: &CompleteInput) -> Result<CompleteOutput, GuestError> {
        let func = self
            .complete
            .clone()
            .ok_or(GuestError::Unsupported(COMPLETE_EXPORT))?;
        let bytes = self.call(func, &input.encode()?)?;
        Ok(CompleteOutput::decode(&bytes)?)
    }

    pub fn inspect(&mut self, input: &InspectInput) -> Result<InspectOutput, GuestError> {
        let func = self
            .inspect
            .clone()
            .ok_or(GuestError::Unsupported(INSPECT_EXPORT))?;
        let bytes = self.call(func, &input.encode()?)?;
        Ok(InspectOutput::decode(&bytes)?)
    }

    pub fn is_complete(&mut self, input: &IsCompleteInput) -> Result<IsCompleteOutput, GuestError> {
        let func = self
            .is_complete
            .clone()
            .ok_or(GuestError::Unsupported(IS_COMPLETE_EXPORT))?;
        let bytes = self.call(func, &input.encode()?)?;
        Ok(IsCompleteOutput::decode(&bytes)?)
    }

    /// Release the compiler instance and drop the guest store.
    pub fn free(mut self) -> Result<(), GuestError> {
        if self.is_scratch() {
            return Ok(());
        }
        self.store.set_epoch_deadline(1);
        let code = self
            .free
            .call(&mut self.store, self.handle)
            .map_err(GuestError::from_call)?;
        if code != 0 {
            return Err(GuestError::FreeFailed {
                handle: self.handle,
                code,
            });
        }
        Ok(())
    }

    fn call(&mut self, func: EnvelopeFn, input: &[u8]) -> Result<Vec<u8>, GuestError> {
        self.store.set_epoch_deadline(1);
        invoke(
            &mut self.store,
            self.memory,
            &self.alloc,
            &func,
            self.handle,
            input,
        )
        .map_err(GuestError::from_call)
    }
}

fn invoke(
    store: &mut Store<()>,
    memory: Memory,
    alloc: &TypedFunc<i32, i32>,
    func: &EnvelopeFn,
    handle: i32,
    input: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let input_len = i32::try_from(input.len()).context("input too large for wasm32")?;
    let input_ptr = alloc.call(&mut *store, input_len)?;
    memory.write(&mut *store, input_ptr as usize, input)?;

    let result_ptr = alloc.call(&mut *store, 8)?;
    func.call(&mut *store, (result_ptr, handle, input_ptr, input_len))?;

    let mut result_buf = [0u8; 8];
    memory.read(&*store, result_ptr as usize, &mut result_buf)?;
    let out_ptr = i32::from_le_bytes([result_buf[0], result_buf[1], result_buf[2], result_buf[3]]);
    let out_len = i32::from_le_bytes([result_buf[4], result_buf[5], result_buf[6], result_buf[7]]);
    let output_len = usize::try_from(out_len).context("negative output length")?;
    let mut output = vec![0u8; output_len];
    memory.read(&*store, out_ptr as usize, &mut output)?;
    Ok(output)
}
