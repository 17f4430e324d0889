//! Kernel lifecycle: configure, readiness gate, shutdown.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::{BackendLoader, BackendModule, InterruptHandle};
use crate::config::KernelConfig;
use crate::display::DisplayResolver;
use crate::error::KernelError;
use crate::history::History;
use crate::notify::{Notifier, NullNotifier};
use crate::session::SessionTable;

pub const KERNEL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    Uninitialized,
    Ready,
    /// Backend loading failed; permanent.
    Errored,
    ShuttingDown,
}

impl fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KernelStatus::Uninitialized => "uninitialized",
            KernelStatus::Ready => "ready",
            KernelStatus::Errored => "errored",
            KernelStatus::ShuttingDown => "shutting down",
        };
        f.write_str(s)
    }
}

/// Outcome of freeing the session instances on shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub freed: usize,
    pub failed: usize,
}

/// Owns the loaded backend and every session instance created from it.
pub struct Kernel {
    pub(crate) config: KernelConfig,
    loader: Box<dyn BackendLoader>,
    pub(crate) status: KernelStatus,
    pub(crate) backend: Option<Box<dyn BackendModule>>,
    /// Bumped on every successful load; session entries record it.
    pub(crate) generation: u64,
    pub(crate) sessions: SessionTable,
    pub(crate) history: History,
    pub(crate) notifier: Box<dyn Notifier>,
    pub(crate) display: DisplayResolver,
    diagnostic: Option<String>,
}

impl Kernel {
    pub fn new(config: KernelConfig, loader: Box<dyn BackendLoader>) -> Self {
        Self::with_notifier(config, loader, Box::new(NullNotifier))
    }

    pub fn with_notifier(
        config: KernelConfig,
        loader: Box<dyn BackendLoader>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        let history = History::new(config.history_limit);
        let display = DisplayResolver::new(config.data_dir.clone());
        Self {
            config,
            loader,
            status: KernelStatus::Uninitialized,
            backend: None,
            generation: 0,
            sessions: SessionTable::new(),
            history,
            notifier,
            display,
            diagnostic: None,
        }
    }

    /// Loads the backend module. A load failure leaves the kernel `Errored` with
    /// the reason available from [`Kernel::diagnostic`]; it is not returned.
    pub fn configure(&mut self) -> Result<(), KernelError> {
        match self.status {
            KernelStatus::Uninitialized => {}
            KernelStatus::Ready => return Err(KernelError::AlreadyConfigured),
            other => return Err(KernelError::KernelUnavailable(other)),
        }
        log::info!(
            "initializing BraneScript kernel v{KERNEL_VERSION} with backend {}",
            self.config.backend_path.display()
        );
        match self.loader.load(&self.config.backend_path) {
            Ok(backend) => {
                self.generation += 1;
                self.backend = Some(backend);
                self.sessions = SessionTable::new();
                self.status = KernelStatus::Ready;
                log::info!("initialization done");
            }
            Err(err) => {
                let err = KernelError::Initialization(err);
                log::error!("initialization failed: {err}");
                self.diagnostic = Some(err.to_string());
                self.status = KernelStatus::Errored;
            }
        }
        Ok(())
    }

    /// Frees every session instance and unloads the backend. Idempotent.
    pub fn shutdown(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        match self.status {
            KernelStatus::Ready => {}
            KernelStatus::Uninitialized => {
                self.status = KernelStatus::ShuttingDown;
                return report;
            }
            KernelStatus::Errored | KernelStatus::ShuttingDown => return report,
        }
        log::info!("terminating BraneScript kernel v{KERNEL_VERSION}");
        self.status = KernelStatus::ShuttingDown;

        let drained = self.sessions.remove_all();
        let Some(mut backend) = self.backend.take() else {
            return report;
        };
        for (session, entry) in drained {
            debug_assert_eq!(entry.generation, self.generation);
            match backend.free_instance(entry.instance) {
                Ok(()) => report.freed += 1,
                Err(err) => {
                    log::warn!("failed to free instance of session '{session}': {err}");
                    report.failed += 1;
                }
            }
        }
        backend.unload();
        log::info!(
            "shutdown complete ({} freed, {} failed)",
            report.freed,
            report.failed
        );
        report
    }

    pub fn status(&self) -> KernelStatus {
        self.status
    }

    pub fn is_ready(&self) -> bool {
        self.status == KernelStatus::Ready
    }

    /// Why initialization failed, if it did.
    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_session(&self, id: &str) -> bool {
        self.sessions.contains(id)
    }

    /// Interrupt capability usable from other threads while a request runs.
    pub fn interrupt_handle(&self) -> Option<InterruptHandle> {
        self.backend
            .as_ref()
            .and_then(|backend| backend.interrupt_handle())
    }

    /// Interrupts the running backend call; `false` when the backend cannot be interrupted.
    pub fn interrupt(&self) -> bool {
        match self.interrupt_handle() {
            Some(handle) => {
                handle.interrupt();
                true
            }
            None => false,
        }
    }

    pub(crate) fn require_ready(&self) -> Result<(), KernelError> {
        if self.status == KernelStatus::Ready {
            Ok(())
        } else {
            Err(KernelError::KernelUnavailable(self.status))
        }
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if self.status == KernelStatus::Ready {
            log::warn!("kernel dropped while ready; shutting down");
            self.shutdown();
        }
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("status", &self.status)
            .field("backend", &self.backend.as_ref().map(|b| b.name()))
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use bscript_abi::Output;

    use crate::backend::{
        Artifact, BackendError, ExecFailure, InstanceHandle, LoadError, RunOptions,
    };

    #[derive(Default)]
    struct Calls {
        created: usize,
        freed: Vec<u64>,
        unloaded: usize,
    }

    struct Fake {
        calls: Arc<Mutex<Calls>>,
        fail_free: bool,
    }

    impl BackendModule for Fake {
        fn name(&self) -> &str {
            "fake"
        }

        fn create_instance(&mut self) -> Result<InstanceHandle, BackendError> {
            let mut calls = self.calls.lock().unwrap();
            calls.created += 1;
            Ok(InstanceHandle::new(calls.created as u64))
        }

        fn free_instance(&mut self, instance: InstanceHandle) -> Result<(), BackendError> {
            if self.fail_free {
                return Err(BackendError::new("busy"));
            }
            self.calls.lock().unwrap().freed.push(instance.id());
            Ok(())
        }

        fn compile(&mut self, _: &InstanceHandle, _: &str) -> Result<Artifact, ExecFailure> {
            Ok(Artifact::new(Vec::new()))
        }

        fn run(
            &mut self,
            _: &InstanceHandle,
            _: Artifact,
            _: RunOptions,
        ) -> Result<Vec<Output>, ExecFailure> {
            Ok(Vec::new())
        }

        fn unload(&mut self) {
            self.calls.lock().unwrap().unloaded += 1;
        }
    }

    struct FakeLoader {
        calls: Arc<Mutex<Calls>>,
        fail_free: bool,
    }

    impl BackendLoader for FakeLoader {
        fn load(&self, path: &Path) -> Result<Box<dyn BackendModule>, LoadError> {
            if !path.ends_with("present.wasm") {
                return Err(LoadError::MissingModule {
                    path: path.to_path_buf(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            Ok(Box::new(Fake {
                calls: self.calls.clone(),
                fail_free: self.fail_free,
            }))
        }
    }

    fn kernel(path: &str, fail_free: bool) -> (Kernel, Arc<Mutex<Calls>>) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let config = KernelConfig::default().with_backend_path(PathBuf::from(path));
        let loader = FakeLoader {
            calls: calls.clone(),
            fail_free,
        };
        (Kernel::new(config, Box::new(loader)), calls)
    }

    #[test]
    fn configure_reaches_ready_once() {
        let (mut kernel, _) = kernel("/opt/present.wasm", false);
        assert_eq!(kernel.status(), KernelStatus::Uninitialized);
        kernel.configure().unwrap();
        assert_eq!(kernel.status(), KernelStatus::Ready);
        assert!(matches!(
            kernel.configure(),
            Err(KernelError::AlreadyConfigured)
        ));
        assert_eq!(kernel.status(), KernelStatus::Ready);
    }

    #[test]
    fn missing_backend_leaves_kernel_errored() {
        let (mut kernel, calls) = kernel("/nonexistent/lib.wasm", false);
        kernel.configure().unwrap();
        assert_eq!(kernel.status(), KernelStatus::Errored);
        assert!(kernel.diagnostic().unwrap().contains("/nonexistent/lib.wasm"));
        assert_eq!(kernel.shutdown(), ShutdownReport::default());
        assert_eq!(kernel.status(), KernelStatus::Errored);
        assert_eq!(calls.lock().unwrap().unloaded, 0);
    }

    #[test]
    fn shutdown_frees_sessions_in_creation_order_and_is_idempotent() {
        let (mut kernel, calls) = kernel("/opt/present.wasm", false);
        kernel.configure().unwrap();
        let generation = kernel.generation;
        for id in ["b", "a"] {
            let backend = kernel.backend.as_deref_mut().unwrap();
            kernel
                .sessions
                .get_or_create(id, backend, generation)
                .unwrap();
        }
        let report = kernel.shutdown();
        assert_eq!(report, ShutdownReport { freed: 2, failed: 0 });
        assert_eq!(kernel.shutdown(), ShutdownReport::default());
        assert_eq!(kernel.status(), KernelStatus::ShuttingDown);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.freed, vec![1, 2]);
        assert_eq!(calls.unloaded, 1);
    }

    #[test]
    fn free_failures_are_counted_not_raised() {
        let (mut kernel, calls) = kernel("/opt/present.wasm", true);
        kernel.configure().unwrap();
        let generation = kernel.generation;
        let backend = kernel.backend.as_deref_mut().unwrap();
        kernel.sessions.get_or_create("a", backend, generation).unwrap();
        let report = kernel.shutdown();
        assert_eq!(report, ShutdownReport { freed: 0, failed: 1 });
        assert_eq!(kernel.session_count(), 0);
        assert_eq!(calls.lock().unwrap().unloaded, 1);
    }

    #[test]
    fn drop_shuts_down_ready_kernel() {
        let (mut kernel, calls) = kernel("/opt/present.wasm", false);
        kernel.configure().unwrap();
        drop(kernel);
        assert_eq!(calls.lock().unwrap().unloaded, 1);
    }

    #[test]
    fn unconfigured_shutdown_only_transitions() {
        let (mut kernel, _) = kernel("/opt/present.wasm", false);
        kernel.shutdown();
        assert_eq!(kernel.status(), KernelStatus::ShuttingDown);
        assert!(matches!(
            kernel.configure(),
            Err(KernelError::KernelUnavailable(KernelStatus::ShuttingDown))
        ));
        assert!(!kernel.interrupt());
    }
}
