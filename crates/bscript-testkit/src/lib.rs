//! Test utilities for exercising the kernel without a compiled backend.
//!
//! - [`ScriptBackend`]: in-process backend running a tiny expression language
//! - [`BackendProbe`]: call counters and failure injection for that backend
//! - [`RecordingNotifier`]: captures published notifications
//! - [`stub_backend`]: canned WASM backends for loader-level tests

pub mod backend;
pub mod script;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bscript_kernel::{Kernel, KernelConfig, Notification, Notifier};

pub use backend::{BackendProbe, CallCounts, ScriptBackend, ScriptLoader};
pub use bscript_wasm::fixtures as stub_backend;

/// Notifier that keeps every notification for later inspection.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier(Arc<Mutex<Vec<Notification>>>);

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Notification>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes and returns everything recorded so far.
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.lock())
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&mut self, notification: Notification) {
        self.lock().push(notification);
    }
}

/// A scripted kernel plus handles to observe it.
pub struct TestKernel {
    pub kernel: Kernel,
    pub probe: BackendProbe,
    pub notifications: RecordingNotifier,
}

impl TestKernel {
    /// Unconfigured kernel over a [`ScriptBackend`].
    pub fn new(config: KernelConfig) -> Self {
        let probe = BackendProbe::new();
        let notifications = RecordingNotifier::new();
        let kernel = Kernel::with_notifier(
            config,
            Box::new(ScriptLoader::new(probe.clone())),
            Box::new(notifications.clone()),
        );
        Self {
            kernel,
            probe,
            notifications,
        }
    }

    /// Configured kernel with default settings.
    pub fn ready() -> Self {
        Self::ready_with(test_config())
    }

    pub fn ready_with(config: KernelConfig) -> Self {
        let mut test = Self::new(config);
        if let Err(err) = test.kernel.configure() {
            panic!("configure failed: {err}");
        }
        assert!(test.kernel.is_ready(), "{:?}", test.kernel.diagnostic());
        test
    }
}

/// Config pointing at a nominal backend path; the script loader ignores it.
pub fn test_config() -> KernelConfig {
    KernelConfig::default().with_backend_path(PathBuf::from("script-backend"))
}
