//! Process host for the BraneScript kernel: a daemon task owning the
//! [`bscript_kernel::Kernel`] and an NDJSON control server on a Unix socket.

pub mod config;
pub mod connection;
pub mod control;
pub mod daemon;
pub mod error;
pub mod notify;

pub use config::HostConfig;
pub use connection::ConnectionInfo;
pub use control::{
    ControlClient, ControlError, ControlServer, NotificationEnvelope, RequestEnvelope,
    ResponseEnvelope,
};
pub use daemon::{ControlMsg, KernelDaemon, serve};
pub use error::HostError;
pub use notify::BroadcastNotifier;
