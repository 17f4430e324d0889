use bscript_abi::Diagnostic;
use thiserror::Error;

use crate::backend::LoadError;
use crate::kernel::KernelStatus;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("backend failed to initialize: {0}")]
    Initialization(#[from] LoadError),
    #[error("kernel unavailable (status: {0})")]
    KernelUnavailable(KernelStatus),
    #[error("kernel is already configured")]
    AlreadyConfigured,
    #[error("failed to create backend instance for session '{session}': {reason}")]
    SessionCreation { session: String, reason: String },
    #[error("{}", .0.message)]
    Compile(Diagnostic),
    #[error("{}", .0.message)]
    Runtime(Diagnostic),
    #[error("execution interrupted")]
    Interrupted,
    #[error("backend fault: {0}")]
    BackendFault(String),
    #[error("unknown session '{0}'")]
    UnknownSession(String),
}

impl KernelError {
    /// Error name reported to the front-end.
    pub fn ename(&self) -> &str {
        match self {
            KernelError::Initialization(_) => "InitializationError",
            KernelError::KernelUnavailable(_) => "KernelUnavailableError",
            KernelError::AlreadyConfigured => "AlreadyConfiguredError",
            KernelError::SessionCreation { .. } => "SessionCreationError",
            KernelError::Compile(diag) => diag.kind.as_deref().unwrap_or("CompileError"),
            KernelError::Runtime(diag) => diag.kind.as_deref().unwrap_or("RuntimeError"),
            KernelError::Interrupted => "Interrupted",
            KernelError::BackendFault(_) => "BackendFault",
            KernelError::UnknownSession(_) => "UnknownSessionError",
        }
    }

    /// Traceback lines; the diagnostic location (if any) comes first.
    pub fn traceback(&self) -> Vec<String> {
        match self {
            KernelError::Compile(diag) | KernelError::Runtime(diag) => {
                let mut lines = Vec::with_capacity(diag.traceback.len() + 1);
                if let Some(loc) = diag.location {
                    lines.push(format!("at line {}, column {}", loc.line, loc.column));
                }
                lines.extend(diag.traceback.iter().cloned());
                lines
            }
            _ => Vec::new(),
        }
    }
}
