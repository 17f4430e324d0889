use std::path::PathBuf;

use bscript_kernel::KernelConfig;

use crate::connection::ConnectionInfo;

pub const CONTROL_SOCKET_ENV: &str = "BSK_CONTROL_SOCKET";
pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/bsk-control.sock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Unix socket the control server listens on.
    pub control_socket: PathBuf,
    pub kernel: KernelConfig,
    /// Capacity of the daemon's request queue.
    pub control_queue: usize,
    /// Capacity of the notification broadcast channel.
    pub notification_buffer: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            control_socket: PathBuf::from(DEFAULT_CONTROL_SOCKET),
            kernel: KernelConfig::default(),
            control_queue: 64,
            notification_buffer: 256,
        }
    }
}

impl HostConfig {
    /// Build HostConfig from the environment (`BSK_CONTROL_SOCKET` plus the kernel variables).
    pub fn from_env() -> Self {
        let mut config = Self {
            kernel: KernelConfig::from_env(),
            ..Self::default()
        };
        if let Some(path) = std::env::var_os(CONTROL_SOCKET_ENV).filter(|p| !p.is_empty()) {
            config.control_socket = PathBuf::from(path);
        }
        config
    }

    /// Takes the control socket from a connection file.
    pub fn with_connection(mut self, info: &ConnectionInfo) -> Self {
        self.control_socket = info.control_socket();
        self
    }
}
