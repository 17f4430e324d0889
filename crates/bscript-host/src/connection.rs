//! Connection descriptor written by the front-end launcher.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::HostError;

fn default_transport() -> String {
    "ipc".into()
}

fn default_ip() -> String {
    "127.0.0.1".into()
}

fn default_signature_scheme() -> String {
    "hmac-sha256".into()
}

fn default_kernel_name() -> String {
    "bscript".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_ip")]
    pub ip: String,
    pub control_path: PathBuf,
    /// Message signing key; signing is not implemented, the key is only carried.
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_signature_scheme")]
    pub signature_scheme: String,
    #[serde(default = "default_kernel_name")]
    pub kernel_name: String,
}

impl ConnectionInfo {
    pub fn load(path: &Path) -> Result<Self, HostError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, HostError> {
        let info: ConnectionInfo =
            serde_json::from_str(text).map_err(|e| HostError::Connection(e.to_string()))?;
        if info.transport != "ipc" {
            return Err(HostError::Connection(format!(
                "unsupported transport '{}' (only ipc)",
                info.transport
            )));
        }
        if info.control_path.as_os_str().is_empty() {
            return Err(HostError::Connection("control_path is empty".into()));
        }
        if !info.key.is_empty() {
            tracing::debug!(
                scheme = %info.signature_scheme,
                "connection key present; messages are not signed"
            );
        }
        Ok(info)
    }

    pub fn control_socket(&self) -> PathBuf {
        self.control_path.clone()
    }
}
