//! Capability interface for language backends.
//!
//! The kernel only ever talks to a [`BackendModule`]; how the module was
//! obtained (dynamic WASM load, in-process test double) is the business of the
//! [`BackendLoader`] that produced it.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bscript_abi::{CompleteOutput, Diagnostic, InspectOutput, IsCompleteOutput, Output};

pub use bscript_wasm::LoadError;

pub mod wasm;

/// Opaque handle to one backend compiler instance.
///
/// Handles are neither `Clone` nor `Copy`: freeing consumes the handle, so an
/// instance cannot be released twice.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct InstanceHandle(u64);

impl InstanceHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Backend-specific compiled form of a snippet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact(Vec<u8>);

impl Artifact {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Flags forwarded to the backend's run entry point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Whether the backend may request interactive input mid-run.
    pub allow_stdin: bool,
}

/// Failure of a backend housekeeping call (instance creation/free, queries).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure of a compile or run call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecFailure {
    /// The snippet itself is at fault; `outputs` holds anything produced before the failure.
    Diagnostic {
        diagnostic: Diagnostic,
        outputs: Vec<Output>,
    },
    Interrupted,
    /// The backend broke (trap, bad envelope) rather than reporting a diagnostic.
    Fault(String),
}

impl From<Diagnostic> for ExecFailure {
    fn from(diagnostic: Diagnostic) -> Self {
        ExecFailure::Diagnostic {
            diagnostic,
            outputs: Vec::new(),
        }
    }
}

/// Interrupts the backend's currently running call from another thread.
pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

/// Cloneable interrupt capability handed to transports.
#[derive(Clone)]
pub struct InterruptHandle(Arc<dyn Interrupt>);

impl InterruptHandle {
    pub fn new(inner: Arc<dyn Interrupt>) -> Self {
        Self(inner)
    }

    pub fn interrupt(&self) {
        self.0.interrupt();
    }
}

impl fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InterruptHandle").finish()
    }
}

/// A loaded language backend.
pub trait BackendModule: Send {
    /// Human-readable name, usually the path the module was loaded from.
    fn name(&self) -> &str;

    fn create_instance(&mut self) -> Result<InstanceHandle, BackendError>;

    fn free_instance(&mut self, instance: InstanceHandle) -> Result<(), BackendError>;

    fn compile(&mut self, instance: &InstanceHandle, source: &str)
    -> Result<Artifact, ExecFailure>;

    fn run(
        &mut self,
        instance: &InstanceHandle,
        artifact: Artifact,
        options: RunOptions,
    ) -> Result<Vec<Output>, ExecFailure>;

    /// Completion candidates; `None` when the backend offers no completion.
    fn complete(
        &mut self,
        _instance: Option<&InstanceHandle>,
        _code: &str,
        _cursor_pos: usize,
    ) -> Result<Option<CompleteOutput>, BackendError> {
        Ok(None)
    }

    /// Documentation for `token`; `None` when the backend offers no inspection.
    fn inspect(
        &mut self,
        _instance: Option<&InstanceHandle>,
        _token: &str,
        _detail_level: u8,
    ) -> Result<Option<InspectOutput>, BackendError> {
        Ok(None)
    }

    /// Best-effort parse without compiling; `None` when unsupported.
    fn is_complete(&mut self, _code: &str) -> Result<Option<IsCompleteOutput>, BackendError> {
        Ok(None)
    }

    fn interrupt_handle(&self) -> Option<InterruptHandle> {
        None
    }

    /// Release module-wide resources. Called once, after every instance was freed.
    fn unload(&mut self) {}
}

/// Produces a [`BackendModule`] from a well-known path.
pub trait BackendLoader: Send {
    fn load(&self, path: &Path) -> Result<Box<dyn BackendModule>, LoadError>;
}
