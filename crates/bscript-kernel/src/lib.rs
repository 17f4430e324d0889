//! BraneScript execution kernel: lifecycle, per-session backend instances and
//! the execute/query request handlers. Transport-agnostic; the host crate
//! decodes requests and hands them to a single owned [`Kernel`].

pub mod backend;
pub mod config;
pub mod display;
pub mod error;
mod execute;
pub mod history;
pub mod kernel;
pub mod magic;
pub mod notify;
pub mod query;
pub mod reply;
pub mod session;

pub use backend::wasm::{WasmBackend, WasmLoader};
pub use backend::{
    Artifact, BackendError, BackendLoader, BackendModule, ExecFailure, InstanceHandle, Interrupt,
    InterruptHandle, LoadError, RunOptions,
};
pub use config::KernelConfig;
pub use error::KernelError;
pub use kernel::{KERNEL_VERSION, Kernel, KernelStatus, ShutdownReport};
pub use notify::{Notification, Notifier, NullNotifier};
pub use reply::{
    CompleteReply, CompleteRequest, ExecutionReply, ExecutionRequest, HistoryEntry,
    HistoryRequest, InspectReply, InspectRequest, IsCompleteReply, KernelInfo, LanguageInfo,
};
pub use session::{SessionEntry, SessionTable};

pub use bscript_abi::{Diagnostic, Output, StreamName};
