//! [`BackendModule`] implementation over a dynamically loaded WASM backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bscript_abi::{
    CompileInput, CompleteInput, CompleteOutput, InspectInput, InspectOutput, IsCompleteInput,
    IsCompleteOutput, Output, RunInput,
};
use bscript_wasm::{BackendRuntime, GuestError, GuestInstance, LoadedModule};

use super::{
    Artifact, BackendError, BackendLoader, BackendModule, ExecFailure, InstanceHandle, Interrupt,
    InterruptHandle, LoadError, RunOptions,
};

/// Loads backends through a shared wasmtime runtime.
pub struct WasmLoader {
    runtime: Arc<BackendRuntime>,
}

impl WasmLoader {
    pub fn new(module_cache_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::with_runtime(Arc::new(
            BackendRuntime::new_with_disk_cache(module_cache_dir)?,
        )))
    }

    pub fn with_runtime(runtime: Arc<BackendRuntime>) -> Self {
        Self { runtime }
    }
}

impl BackendLoader for WasmLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn BackendModule>, LoadError> {
        let module = self.runtime.load(path)?;
        Ok(Box::new(WasmBackend::new(module)))
    }
}

pub struct WasmBackend {
    name: String,
    module: LoadedModule,
    instances: HashMap<u64, GuestInstance>,
    scratch: Option<GuestInstance>,
    next_id: u64,
    loaded: bool,
}

impl WasmBackend {
    pub fn new(module: LoadedModule) -> Self {
        Self {
            name: module.path().display().to_string(),
            module,
            instances: HashMap::new(),
            scratch: None,
            next_id: 0,
            loaded: true,
        }
    }

    fn guest(&mut self, instance: &InstanceHandle) -> Result<&mut GuestInstance, ExecFailure> {
        self.instances.get_mut(&instance.id()).ok_or_else(|| {
            ExecFailure::Fault(format!("unknown instance handle {}", instance.id()))
        })
    }

    /// The session's guest when there is one, otherwise a lazily created scratch guest.
    fn query_guest(
        &mut self,
        instance: Option<&InstanceHandle>,
    ) -> Result<&mut GuestInstance, GuestError> {
        if let Some(guest) = instance.and_then(|handle| self.instances.get_mut(&handle.id())) {
            return Ok(guest);
        }
        let scratch = match self.scratch.take() {
            Some(guest) => guest,
            None => self.module.scratch()?,
        };
        Ok(self.scratch.insert(scratch))
    }
}

impl BackendModule for WasmBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_instance(&mut self) -> Result<InstanceHandle, BackendError> {
        let guest = self
            .module
            .instantiate()
            .map_err(|err| BackendError::new(err.to_string()))?;
        let id = self.next_id;
        self.next_id += 1;
        self.instances.insert(id, guest);
        Ok(InstanceHandle::new(id))
    }

    fn free_instance(&mut self, instance: InstanceHandle) -> Result<(), BackendError> {
        let guest = self.instances.remove(&instance.id()).ok_or_else(|| {
            BackendError::new(format!("unknown instance handle {}", instance.id()))
        })?;
        guest.free().map_err(|err| BackendError::new(err.to_string()))
    }

    fn compile(
        &mut self,
        instance: &InstanceHandle,
        source: &str,
    ) -> Result<Artifact, ExecFailure> {
        let output = self
            .guest(instance)?
            .compile(&CompileInput::new(source))
            .map_err(exec_failure)?;
        match (output.artifact, output.diagnostic) {
            (_, Some(diagnostic)) => Err(diagnostic.into()),
            (Some(artifact), None) => Ok(Artifact::new(artifact)),
            (None, None) => Err(ExecFailure::Fault(
                "backend returned neither an artifact nor a diagnostic".into(),
            )),
        }
    }

    fn run(
        &mut self,
        instance: &InstanceHandle,
        artifact: Artifact,
        options: RunOptions,
    ) -> Result<Vec<Output>, ExecFailure> {
        let input = RunInput::new(artifact.into_bytes(), options.allow_stdin);
        let output = self.guest(instance)?.run(&input).map_err(exec_failure)?;
        match output.diagnostic {
            Some(diagnostic) => Err(ExecFailure::Diagnostic {
                diagnostic,
                outputs: output.outputs,
            }),
            None => Ok(output.outputs),
        }
    }

    fn complete(
        &mut self,
        instance: Option<&InstanceHandle>,
        code: &str,
        cursor_pos: usize,
    ) -> Result<Option<CompleteOutput>, BackendError> {
        if !self.module.exports().complete {
            return Ok(None);
        }
        let cursor = u32::try_from(cursor_pos).unwrap_or(u32::MAX);
        self.query_guest(instance)
            .and_then(|guest| guest.complete(&CompleteInput::new(code, cursor)))
            .map(Some)
            .map_err(|err| BackendError::new(err.to_string()))
    }

    fn inspect(
        &mut self,
        instance: Option<&InstanceHandle>,
        token: &str,
        detail_level: u8,
    ) -> Result<Option<InspectOutput>, BackendError> {
        if !self.module.exports().inspect {
            return Ok(None);
        }
        self.query_guest(instance)
            .and_then(|guest| guest.inspect(&InspectInput::new(token, detail_level)))
            .map(Some)
            .map_err(|err| BackendError::new(err.to_string()))
    }

    fn is_complete(&mut self, code: &str) -> Result<Option<IsCompleteOutput>, BackendError> {
        if !self.module.exports().is_complete {
            return Ok(None);
        }
        self.query_guest(None)
            .and_then(|guest| guest.is_complete(&IsCompleteInput::new(code)))
            .map(Some)
            .map_err(|err| BackendError::new(err.to_string()))
    }

    fn interrupt_handle(&self) -> Option<InterruptHandle> {
        Some(InterruptHandle::new(Arc::new(EpochInterrupt(
            self.module.interrupt_handle(),
        ))))
    }

    fn unload(&mut self) {
        debug_assert!(self.loaded, "backend module unloaded twice");
        if !self.loaded {
            return;
        }
        if !self.instances.is_empty() {
            log::warn!(
                "unloading backend '{}' with {} live instance(s)",
                self.name,
                self.instances.len()
            );
        }
        self.instances.clear();
        self.scratch = None;
        self.loaded = false;
    }
}

struct EpochInterrupt(bscript_wasm::InterruptHandle);

impl Interrupt for EpochInterrupt {
    fn interrupt(&self) {
        self.0.interrupt();
    }
}

fn exec_failure(err: GuestError) -> ExecFailure {
    match err {
        GuestError::Interrupted => ExecFailure::Interrupted,
        other => ExecFailure::Fault(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bscript_abi::{CompileOutput, Completeness, Diagnostic, RunOutput};
    use bscript_wasm::fixtures::StubBackend;
    use bscript_wasm::{COMPILE_EXPORT, IS_COMPLETE_EXPORT, RUN_EXPORT};
    use tempfile::TempDir;

    fn load(stub: StubBackend) -> (TempDir, Box<dyn BackendModule>) {
        let dir = TempDir::new().unwrap();
        let path = stub.write_to(dir.path());
        let loader = WasmLoader::new(None).unwrap();
        let module = loader.load(&path).unwrap();
        (dir, module)
    }

    #[test]
    fn run_diagnostic_keeps_partial_outputs() {
        let failed = RunOutput {
            outputs: vec![Output::stdout("partial")],
            diagnostic: Some(Diagnostic::new("boom")),
        };
        let (_dir, mut backend) =
            load(StubBackend::new().reply(RUN_EXPORT, failed.encode().unwrap()));
        let instance = backend.create_instance().unwrap();
        let artifact = backend.compile(&instance, "boom()").unwrap();
        let err = backend
            .run(&instance, artifact, RunOptions::default())
            .unwrap_err();
        assert_eq!(
            err,
            ExecFailure::Diagnostic {
                diagnostic: Diagnostic::new("boom"),
                outputs: vec![Output::stdout("partial")],
            }
        );
        backend.free_instance(instance).unwrap();
    }

    #[test]
    fn empty_compile_output_is_a_fault() {
        let (_dir, mut backend) = load(
            StubBackend::new().reply(COMPILE_EXPORT, CompileOutput::default().encode().unwrap()),
        );
        let instance = backend.create_instance().unwrap();
        let err = backend.compile(&instance, "x").unwrap_err();
        assert!(matches!(err, ExecFailure::Fault(_)), "{err:?}");
    }

    #[test]
    fn missing_optional_exports_answer_none() {
        let (_dir, mut backend) = load(StubBackend::new());
        assert_eq!(backend.complete(None, "x", 1).unwrap(), None);
        assert_eq!(backend.inspect(None, "x", 0).unwrap(), None);
        assert_eq!(backend.is_complete("x").unwrap(), None);
    }

    #[test]
    fn is_complete_uses_scratch_guest() {
        let reply = IsCompleteOutput {
            status: Completeness::Incomplete,
            indent: Some("  ".into()),
        };
        let (_dir, mut backend) = load(
            StubBackend::new().reply(IS_COMPLETE_EXPORT, reply.encode().unwrap()),
        );
        assert_eq!(backend.is_complete("f(").unwrap(), Some(reply));
    }

    #[test]
    fn freeing_unknown_handle_fails() {
        let (_dir, mut backend) = load(StubBackend::new());
        let err = backend.free_instance(InstanceHandle::new(42)).unwrap_err();
        assert!(err.message.contains("42"));
    }
}
