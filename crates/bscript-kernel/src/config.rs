use std::path::PathBuf;

pub const BACKEND_ENV: &str = "BSK_BACKEND";
pub const MODULE_CACHE_ENV: &str = "BSK_MODULE_CACHE";
pub const DATA_DIR_ENV: &str = "BRANE_DATA_DIR";

pub const DEFAULT_BACKEND_PATH: &str = "/libbrane_tsk.wasm";
pub const DEFAULT_DATA_DIR: &str = "/home/jovyan/data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Backend module loaded by `configure()`; read once.
    pub backend_path: PathBuf,
    /// Optional directory for compiled-module caching; if None, caching is in-memory only.
    pub module_cache_dir: Option<PathBuf>,
    /// Directory that `file:///data/...` outputs resolve against.
    pub data_dir: PathBuf,
    /// Maximum number of history entries kept in memory.
    pub history_limit: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            backend_path: PathBuf::from(DEFAULT_BACKEND_PATH),
            module_cache_dir: None,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            history_limit: 1000,
        }
    }
}

impl KernelConfig {
    /// Defaults overridden by `BSK_BACKEND`, `BSK_MODULE_CACHE` and `BRANE_DATA_DIR`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`KernelConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let set = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(path) = set(BACKEND_ENV) {
            config.backend_path = PathBuf::from(path);
        }
        if let Some(dir) = set(MODULE_CACHE_ENV) {
            config.module_cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = set(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir);
        }
        config
    }

    pub fn with_backend_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.backend_path = path.into();
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_notebook_image_layout() {
        let config = KernelConfig::default();
        assert_eq!(config.backend_path, PathBuf::from("/libbrane_tsk.wasm"));
        assert_eq!(config.data_dir, PathBuf::from("/home/jovyan/data"));
        assert_eq!(config.module_cache_dir, None);
        assert_eq!(config.history_limit, 1000);
    }

    #[test]
    fn environment_overrides_defaults() {
        let env: HashMap<&str, &str> = [
            (BACKEND_ENV, "/opt/brane/backend.wasm"),
            (MODULE_CACHE_ENV, "/tmp/cache"),
            (DATA_DIR_ENV, ""),
        ]
        .into_iter()
        .collect();
        let config = KernelConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.backend_path, PathBuf::from("/opt/brane/backend.wasm"));
        assert_eq!(config.module_cache_dir, Some(PathBuf::from("/tmp/cache")));
        // Blank values fall back to the default.
        assert_eq!(config.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
    }
}
