//! WASM loader for language backends: resolves the backend entry points once
//! at load time and hands out one isolated guest instance per session.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use wasmtime::{Config, Engine, Module};

mod guest;

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures;

pub use guest::{
    ALLOC_EXPORT, COMPILE_EXPORT, COMPLETE_EXPORT, CREATE_EXPORT, ExportTable, FREE_EXPORT,
    GuestError, GuestInstance, INSPECT_EXPORT, IS_COMPLETE_EXPORT, LoadedModule, MEMORY_EXPORT,
    RUN_EXPORT,
};

/// Reasons a backend module cannot be loaded. A failed load never retains a
/// partially resolved module.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("backend module '{}' could not be opened: {source}", path.display())]
    MissingModule {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("backend module '{}' is malformed: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
    #[error("backend module is missing required entry point '{0}'")]
    MissingSymbol(String),
    #[error("backend entry point '{name}' has the wrong signature (expected {expected})")]
    BadSignature {
        name: String,
        expected: &'static str,
    },
}

/// Wasmtime engine wrapper shared by every backend module the process loads.
pub struct BackendRuntime {
    engine: Arc<Engine>,
    module_cache: Mutex<HashMap<ModuleKey, Arc<Module>>>,
    disk_cache: Option<DiskCache>,
}

impl BackendRuntime {
    /// Build a runtime with interruptible execution and no module cache on disk.
    pub fn new() -> Result<Self> {
        Self::new_with_disk_cache(None)
    }

    /// Build a runtime and optionally persist compiled modules under `cache_dir`.
    pub fn new_with_disk_cache(cache_dir: Option<PathBuf>) -> Result<Self> {
        let mut cfg = Config::new();
        cfg.epoch_interruption(true);
        let engine = Engine::new(&cfg)?;
        let disk_cache = cache_dir
            .map(|dir| DiskCache::open(&dir, &engine))
            .transpose()?;
        Ok(Self {
            engine: Arc::new(engine),
            module_cache: Mutex::new(HashMap::new()),
            disk_cache,
        })
    }

    /// Load the backend module at `path` and resolve its entry points.
    pub fn load(&self, path: &Path) -> Result<LoadedModule, LoadError> {
        let bytes = fs::read(path).map_err(|source| LoadError::MissingModule {
            path: path.to_path_buf(),
            source,
        })?;
        let module = self
            .module_from_cache(&bytes)
            .map_err(|err| LoadError::Malformed {
                path: path.to_path_buf(),
                reason: format!("{err:#}"),
            })?;
        let exports = ExportTable::resolve(&module)?;
        log::debug!(
            "resolved backend entry points in {} ({:?})",
            path.display(),
            exports
        );
        Ok(LoadedModule::new(
            self.engine.clone(),
            module,
            exports,
            path.to_path_buf(),
        ))
    }

    /// Compile raw WASM bytes without resolving entry points.
    pub fn compile(&self, wasm_bytes: &[u8]) -> Result<Module> {
        Module::new(&self.engine, wasm_bytes)
    }

    /// Handle that interrupts whatever guest call is currently running on this engine.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            engine: self.engine.clone(),
        }
    }

    fn module_from_cache(&self, wasm_bytes: &[u8]) -> Result<Arc<Module>> {
        let key = ModuleKey::from_bytes(wasm_bytes);
        if let Some(existing) = self.modules().get(&key) {
            return Ok(existing.clone());
        }

        let cached = self
            .disk_cache
            .as_ref()
            .and_then(|cache| cache.load(&self.engine, &key));
        let module = match cached {
            Some(module) => Arc::new(module),
            None => {
                let compiled = Arc::new(self.compile(wasm_bytes)?);
                if let Some(cache) = &self.disk_cache {
                    if let Err(err) = cache.store(&key, &compiled) {
                        log::warn!("could not persist compiled backend module: {err:#}");
                    }
                }
                compiled
            }
        };
        Ok(self.modules().entry(key).or_insert(module).clone())
    }

    fn modules(&self) -> MutexGuard<'_, HashMap<ModuleKey, Arc<Module>>> {
        self.module_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable, thread-safe handle used to interrupt a running guest call.
#[derive(Clone)]
pub struct InterruptHandle {
    engine: Arc<Engine>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.engine.increment_epoch();
    }
}

impl std::fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHandle").finish_non_exhaustive()
    }
}

/// Compiled modules on disk, under a directory per engine configuration.
struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    fn open(root: &Path, engine: &Engine) -> Result<Self> {
        let mut hasher = DefaultHasher::new();
        engine.precompile_compatibility_hash().hash(&mut hasher);
        let dir = root.join(format!("engine-{:016x}", hasher.finish()));
        fs::create_dir_all(&dir)
            .with_context(|| format!("create cache dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn module_path(&self, key: &ModuleKey) -> PathBuf {
        self.dir.join(format!("{}.cwasm", key.0))
    }

    /// Unreadable or stale entries are removed and treated as misses.
    fn load(&self, engine: &Engine, key: &ModuleKey) -> Option<Module> {
        let path = self.module_path(key);
        let bytes = fs::read(&path).ok()?;
        // Entries are only written by `store` for an engine with the same compatibility hash.
        match unsafe { Module::deserialize(engine, &bytes) } {
            Ok(module) => Some(module),
            Err(err) => {
                log::debug!("discarding cached module {}: {err:#}", path.display());
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    fn store(&self, key: &ModuleKey, module: &Module) -> Result<()> {
        let bytes = module
            .serialize()
            .context("serialize compiled backend module")?;
        let path = self.module_path(key);
        fs::write(&path, bytes)
            .with_context(|| format!("write serialized module {}", path.display()))
    }
}

/// SHA-256 of the module bytes, hex encoded.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ModuleKey(String);

impl ModuleKey {
    fn from_bytes(bytes: &[u8]) -> Self {
        Self(format!("{:x}", Sha256::digest(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::StubBackend;
    use bscript_abi::{CompileInput, CompileOutput, Diagnostic, Output, RunInput, RunOutput};
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_stub(dir: &TempDir, stub: &StubBackend) -> PathBuf {
        stub.write_to(dir.path())
    }

    #[test]
    fn compile_and_run_round_trip_through_guest() {
        let dir = TempDir::new().unwrap();
        let run_output = RunOutput {
            outputs: vec![Output::stdout("hello"), Output::value("1")],
            diagnostic: None,
        };
        let path = write_stub(
            &dir,
            &StubBackend::new()
                .reply(COMPILE_EXPORT, CompileOutput::artifact(vec![0xab]).encode().unwrap())
                .reply(RUN_EXPORT, run_output.encode().unwrap()),
        );

        let runtime = BackendRuntime::new().unwrap();
        let module = runtime.load(&path).unwrap();
        assert!(!module.exports().complete);

        let mut guest = module.instantiate().unwrap();
        let compiled = guest.compile(&CompileInput::new("x = 1")).unwrap();
        assert_eq!(compiled.artifact, Some(vec![0xab]));
        let ran = guest.run(&RunInput::new(vec![0xab], false)).unwrap();
        assert_eq!(ran, run_output);
        guest.free().unwrap();
    }

    #[test]
    fn loaded_module_and_instance_debug_without_guest_state() {
        let dir = TempDir::new().unwrap();
        let path = write_stub(&dir, &StubBackend::new());
        let runtime = BackendRuntime::new().unwrap();
        let module = runtime.load(&path).unwrap();
        let shown = format!("{module:?}");
        assert!(shown.starts_with("LoadedModule"), "{shown}");
        assert!(shown.contains("backend.wasm"), "{shown}");

        let guest = module.instantiate().unwrap();
        assert_eq!(format!("{guest:?}"), "GuestInstance { handle: 0, .. }");
    }

    #[test]
    fn missing_path_is_reported_as_missing_module() {
        let runtime = BackendRuntime::new().unwrap();
        let err = runtime
            .load(Path::new("/definitely/not/here/backend.wasm"))
            .unwrap_err();
        assert!(matches!(err, LoadError::MissingModule { .. }), "{err}");
    }

    #[test]
    fn garbage_bytes_are_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backend.wasm");
        fs::write(&path, b"not a wasm module").unwrap();
        let runtime = BackendRuntime::new().unwrap();
        let err = runtime.load(&path).unwrap_err();
        assert!(matches!(err, LoadError::Malformed { .. }), "{err}");
    }

    #[test]
    fn each_required_entry_point_is_checked() {
        let runtime = BackendRuntime::new().unwrap();
        for export in [
            MEMORY_EXPORT,
            ALLOC_EXPORT,
            CREATE_EXPORT,
            FREE_EXPORT,
            COMPILE_EXPORT,
            RUN_EXPORT,
        ] {
            let dir = TempDir::new().unwrap();
            let path = write_stub(&dir, &StubBackend::new().without(export));
            match runtime.load(&path) {
                Err(LoadError::MissingSymbol(name)) => assert_eq!(name, export),
                Err(other) => panic!("unexpected error for {export}: {other}"),
                Ok(_) => panic!("load should fail without '{export}'"),
            }
        }
    }

    #[test]
    fn optional_entry_points_are_detected() {
        let dir = TempDir::new().unwrap();
        let path = write_stub(
            &dir,
            &StubBackend::new().reply(IS_COMPLETE_EXPORT, vec![0xa0]),
        );
        let runtime = BackendRuntime::new().unwrap();
        let module = runtime.load(&path).unwrap();
        assert!(module.exports().is_complete);
        assert!(!module.exports().inspect);
    }

    #[test]
    fn refused_instance_creation_surfaces_guest_code() {
        let dir = TempDir::new().unwrap();
        let path = write_stub(&dir, &StubBackend::new().create_result(-3));
        let runtime = BackendRuntime::new().unwrap();
        let module = runtime.load(&path).unwrap();
        let err = module.instantiate().unwrap_err();
        assert!(matches!(err, GuestError::CreateRefused(-3)), "{err}");
    }

    #[test]
    fn free_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = write_stub(&dir, &StubBackend::new().free_result(7));
        let runtime = BackendRuntime::new().unwrap();
        let guest = runtime.load(&path).unwrap().instantiate().unwrap();
        let err = guest.free().unwrap_err();
        assert!(matches!(err, GuestError::FreeFailed { code: 7, .. }), "{err}");
    }

    #[test]
    fn instances_keep_separate_guest_state() {
        let dir = TempDir::new().unwrap();
        let path = write_stub(&dir, &StubBackend::new());
        let runtime = BackendRuntime::new().unwrap();
        let module = runtime.load(&path).unwrap();
        let first = module.instantiate().unwrap();
        let second = module.instantiate().unwrap();
        // The stub hands out handles from a per-instance counter.
        assert_eq!(first.handle(), 0);
        assert_eq!(second.handle(), 0);
    }

    #[test]
    fn diagnostic_from_guest_is_decoded() {
        let dir = TempDir::new().unwrap();
        let failed = CompileOutput::failed(Diagnostic::new("unexpected end of input").at(1, 4));
        let path = write_stub(
            &dir,
            &StubBackend::new().reply(COMPILE_EXPORT, failed.encode().unwrap()),
        );
        let runtime = BackendRuntime::new().unwrap();
        let mut guest = runtime.load(&path).unwrap().instantiate().unwrap();
        let out = guest.compile(&CompileInput::new("1 +")).unwrap();
        assert_eq!(out, failed);
    }

    #[test]
    fn interrupt_stops_a_spinning_guest() {
        let dir = TempDir::new().unwrap();
        let path = write_stub(&dir, &StubBackend::new().spin(RUN_EXPORT));
        let runtime = BackendRuntime::new().unwrap();
        let mut guest = runtime.load(&path).unwrap().instantiate().unwrap();

        let handle = runtime.interrupt_handle();
        let interrupter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            handle.interrupt();
        });
        let err = guest.run(&RunInput::new(vec![], false)).unwrap_err();
        interrupter.join().unwrap();
        assert!(matches!(err, GuestError::Interrupted), "{err}");
    }

    #[test]
    fn load_reuses_compiled_module() {
        let dir = TempDir::new().unwrap();
        let path = write_stub(&dir, &StubBackend::new());
        let runtime = BackendRuntime::new().unwrap();
        runtime.load(&path).unwrap();
        runtime.load(&path).unwrap();
        assert_eq!(runtime.cached_module_count(), 1);
    }

    #[test]
    fn serialized_module_cache_round_trip() {
        let temp = TempDir::new().unwrap();
        let cache_root = temp.path().join("cache");
        let stub = StubBackend::new();
        let wasm_bytes = stub.wasm();
        let path = stub.write_to(temp.path());

        let runtime = BackendRuntime::new_with_disk_cache(Some(cache_root.clone())).unwrap();
        runtime.load(&path).unwrap();
        let key = ModuleKey::from_bytes(&wasm_bytes);
        let serialized_path = runtime
            .disk_cache
            .as_ref()
            .expect("disk cache")
            .module_path(&key);
        assert!(serialized_path.exists(), "serialized module missing");
        drop(runtime);

        let runtime2 = BackendRuntime::new_with_disk_cache(Some(cache_root)).unwrap();
        runtime2.load(&path).unwrap();
        assert_eq!(runtime2.cached_module_count(), 1);
    }

    #[test]
    fn corrupt_cache_entry_is_replaced() {
        let temp = TempDir::new().unwrap();
        let cache_root = temp.path().join("cache");
        let stub = StubBackend::new();
        let path = stub.write_to(temp.path());

        let runtime = BackendRuntime::new_with_disk_cache(Some(cache_root)).unwrap();
        let entry = runtime
            .disk_cache
            .as_ref()
            .expect("disk cache")
            .module_path(&ModuleKey::from_bytes(&stub.wasm()));
        fs::write(&entry, b"not a serialized module").unwrap();

        let module = runtime.load(&path).unwrap();
        assert!(module.instantiate().is_ok());
        assert_ne!(fs::read(&entry).unwrap(), b"not a serialized module");
    }
}

#[cfg(test)]
impl BackendRuntime {
    fn cached_module_count(&self) -> usize {
        self.modules().len()
    }
}
