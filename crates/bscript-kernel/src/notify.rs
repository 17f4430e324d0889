use bscript_abi::Output;
use serde::{Deserialize, Serialize};

/// Side-channel messages published while handling requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Outputs of a successful, non-silent execution.
    ExecuteResult {
        session: String,
        execution_counter: u64,
        outputs: Vec<Output>,
    },
    /// Outputs produced by a run before it failed.
    PartialOutput {
        session: String,
        execution_counter: u64,
        outputs: Vec<Output>,
    },
}

impl Notification {
    pub fn execution_counter(&self) -> u64 {
        match self {
            Notification::ExecuteResult {
                execution_counter, ..
            }
            | Notification::PartialOutput {
                execution_counter, ..
            } => *execution_counter,
        }
    }
}

pub trait Notifier: Send {
    fn notify(&mut self, notification: Notification);
}

/// Drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&mut self, _notification: Notification) {}
}
