//! In-process [`BackendModule`] running the test language from [`crate::script`].

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bscript_abi::{CompleteOutput, Completeness, InspectOutput, IsCompleteOutput, Output};
use bscript_kernel::query::token_at;
use bscript_kernel::{
    Artifact, BackendError, BackendLoader, BackendModule, ExecFailure, InstanceHandle, Interrupt,
    InterruptHandle, LoadError, RunOptions,
};

use crate::script::{self, BUILTINS, EvalError, Interpreter, Stmt};

/// Number of calls the kernel made into the backend, per entry point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub loads: usize,
    pub creates: usize,
    pub frees: usize,
    pub compiles: usize,
    pub runs: usize,
    pub completes: usize,
    pub inspects: usize,
    pub is_completes: usize,
    pub unloads: usize,
}

impl CallCounts {
    /// Calls into a loaded module (everything except `load`).
    pub fn backend_calls(&self) -> usize {
        self.creates
            + self.frees
            + self.compiles
            + self.runs
            + self.completes
            + self.inspects
            + self.is_completes
            + self.unloads
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    calls: CallCounts,
    live: usize,
    fail_load: bool,
    refuse_create: bool,
    fail_free: bool,
}

/// Shared view into a [`ScriptBackend`]: call counters and failure injection.
#[derive(Debug, Clone, Default)]
pub struct BackendProbe(Arc<Mutex<ProbeState>>);

impl BackendProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ProbeState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }

    /// Instances created and not yet freed.
    pub fn live_instances(&self) -> usize {
        self.state().live
    }

    pub fn fail_load(&self, fail: bool) {
        self.state().fail_load = fail;
    }

    pub fn refuse_create(&self, refuse: bool) {
        self.state().refuse_create = refuse;
    }

    pub fn fail_free(&self, fail: bool) {
        self.state().fail_free = fail;
    }
}

/// Loads a [`ScriptBackend`] for any path, unless the probe says otherwise.
#[derive(Debug, Clone, Default)]
pub struct ScriptLoader {
    probe: BackendProbe,
}

impl ScriptLoader {
    pub fn new(probe: BackendProbe) -> Self {
        Self { probe }
    }
}

impl BackendLoader for ScriptLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn BackendModule>, LoadError> {
        let fail = {
            let mut state = self.probe.state();
            state.calls.loads += 1;
            state.fail_load
        };
        if fail {
            return Err(LoadError::MissingModule {
                path: path.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        Ok(Box::new(ScriptBackend::new(
            path.display().to_string(),
            self.probe.clone(),
        )))
    }
}

pub struct ScriptBackend {
    name: String,
    probe: BackendProbe,
    instances: HashMap<u64, Interpreter>,
    next_id: u64,
    interrupted: Arc<AtomicBool>,
}

impl ScriptBackend {
    pub fn new(name: impl Into<String>, probe: BackendProbe) -> Self {
        Self {
            name: name.into(),
            probe,
            instances: HashMap::new(),
            next_id: 1,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    fn interpreter(&mut self, instance: &InstanceHandle) -> Result<&mut Interpreter, ExecFailure> {
        self.instances
            .get_mut(&instance.id())
            .ok_or_else(|| ExecFailure::Fault(format!("unknown instance {}", instance.id())))
    }

    /// Names visible to queries: builtins plus the instance's variables.
    fn names(&self, instance: Option<&InstanceHandle>) -> BTreeSet<String> {
        let mut names: BTreeSet<String> =
            BUILTINS.iter().map(|(name, _)| name.to_string()).collect();
        if let Some(interp) = instance.and_then(|handle| self.instances.get(&handle.id())) {
            names.extend(interp.known_names());
        }
        names
    }
}

impl BackendModule for ScriptBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_instance(&mut self) -> Result<InstanceHandle, BackendError> {
        let mut state = self.probe.state();
        state.calls.creates += 1;
        if state.refuse_create {
            return Err(BackendError::new("instance limit reached"));
        }
        state.live += 1;
        drop(state);

        let id = self.next_id;
        self.next_id += 1;
        self.instances.insert(id, Interpreter::default());
        log::debug!("script backend created instance {id}");
        Ok(InstanceHandle::new(id))
    }

    fn free_instance(&mut self, instance: InstanceHandle) -> Result<(), BackendError> {
        let mut state = self.probe.state();
        state.calls.frees += 1;
        if state.fail_free {
            return Err(BackendError::new(format!(
                "instance {} is still busy",
                instance.id()
            )));
        }
        match self.instances.remove(&instance.id()) {
            Some(_) => {
                state.live -= 1;
                Ok(())
            }
            None => Err(BackendError::new(format!(
                "unknown instance {}",
                instance.id()
            ))),
        }
    }

    fn compile(
        &mut self,
        instance: &InstanceHandle,
        source: &str,
    ) -> Result<Artifact, ExecFailure> {
        self.probe.state().calls.compiles += 1;
        let known = self.interpreter(instance)?.known_names();
        let program = script::check(source, &known)?;
        serde_json::to_vec(&program)
            .map(Artifact::new)
            .map_err(|err| ExecFailure::Fault(err.to_string()))
    }

    fn run(
        &mut self,
        instance: &InstanceHandle,
        artifact: Artifact,
        _options: RunOptions,
    ) -> Result<Vec<Output>, ExecFailure> {
        self.probe.state().calls.runs += 1;
        let program: Vec<Stmt> = serde_json::from_slice(artifact.as_bytes())
            .map_err(|err| ExecFailure::Fault(format!("corrupt artifact: {err}")))?;
        let interrupted = self.interrupted.clone();
        let interp = self.interpreter(instance)?;
        let (outputs, failure) =
            interp.run(&program, &|| interrupted.swap(false, Ordering::SeqCst));
        match failure {
            None => Ok(outputs),
            Some(EvalError::Interrupted) => Err(ExecFailure::Interrupted),
            Some(EvalError::Diagnostic(diagnostic)) => Err(ExecFailure::Diagnostic {
                diagnostic,
                outputs,
            }),
        }
    }

    fn complete(
        &mut self,
        instance: Option<&InstanceHandle>,
        code: &str,
        cursor_pos: usize,
    ) -> Result<Option<CompleteOutput>, BackendError> {
        self.probe.state().calls.completes += 1;
        let (start, _, _) = token_at(code, cursor_pos);
        let prefix: String = code
            .chars()
            .skip(start)
            .take(cursor_pos.saturating_sub(start))
            .collect();
        let matches = self
            .names(instance)
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .collect();
        Ok(Some(CompleteOutput {
            matches,
            cursor_start: u32::try_from(start).ok(),
            cursor_end: u32::try_from(cursor_pos).ok(),
        }))
    }

    fn inspect(
        &mut self,
        instance: Option<&InstanceHandle>,
        token: &str,
        detail_level: u8,
    ) -> Result<Option<InspectOutput>, BackendError> {
        self.probe.state().calls.inspects += 1;
        let var = instance
            .and_then(|handle| self.instances.get(&handle.id()))
            .and_then(|interp| interp.vars.get(token));
        let text = match (var, script::builtin_doc(token)) {
            (Some(value), _) if detail_level > 0 => {
                format!("{token}: {} = {value}", value.type_name())
            }
            (Some(value), _) => format!("{token}: {}", value.type_name()),
            (None, Some(doc)) => doc.to_string(),
            (None, None) => return Ok(Some(InspectOutput::default())),
        };
        Ok(Some(InspectOutput {
            found: true,
            text: Some(text),
        }))
    }

    fn is_complete(&mut self, code: &str) -> Result<Option<IsCompleteOutput>, BackendError> {
        self.probe.state().calls.is_completes += 1;
        let status = match script::completeness(code) {
            script::Completeness::Complete => Completeness::Complete,
            script::Completeness::Incomplete => Completeness::Incomplete,
            script::Completeness::Invalid => Completeness::Invalid,
        };
        let indent = (status == Completeness::Incomplete).then(|| "    ".to_string());
        Ok(Some(IsCompleteOutput { status, indent }))
    }

    fn interrupt_handle(&self) -> Option<InterruptHandle> {
        Some(InterruptHandle::new(Arc::new(FlagInterrupt(
            self.interrupted.clone(),
        ))))
    }

    fn unload(&mut self) {
        self.probe.state().calls.unloads += 1;
        self.instances.clear();
    }
}

struct FlagInterrupt(Arc<AtomicBool>);

impl Interrupt for FlagInterrupt {
    fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}
