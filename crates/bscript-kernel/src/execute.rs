//! Execute-request handling.

use bscript_abi::Output;

use crate::backend::{ExecFailure, RunOptions};
use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::magic::{self, Magic};
use crate::notify::Notification;
use crate::reply::{ExecutionReply, ExecutionRequest, HistoryEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Received,
    SessionResolved,
    Compiled,
    Run,
    RepliedSuccess,
    RepliedError,
}

impl Kernel {
    /// Handles one execute request. Every path yields exactly one reply
    /// carrying the request's execution counter.
    pub fn execute(&mut self, request: &ExecutionRequest) -> ExecutionReply {
        let counter = request.execution_counter;
        trace_stage(request, Stage::Received);

        if let Err(err) = self.require_ready() {
            log::warn!("rejecting execute {counter}: {err}");
            trace_stage(request, Stage::RepliedError);
            return ExecutionReply::from_error(counter, &err);
        }

        let result = self.execute_ready(request);
        if request.store_history && !request.silent && !request.code.trim().is_empty() {
            self.history.record(HistoryEntry {
                session: request.session.clone(),
                execution_counter: counter,
                code: request.code.clone(),
            });
        }

        match result {
            Ok(outputs) => {
                if !request.silent {
                    self.notifier.notify(Notification::ExecuteResult {
                        session: request.session.clone(),
                        execution_counter: counter,
                        outputs: outputs.clone(),
                    });
                }
                trace_stage(request, Stage::RepliedSuccess);
                ExecutionReply::success(counter, outputs)
            }
            Err(err) => {
                log::info!(
                    "execute {counter} in session '{}' failed: {} ({err})",
                    request.session,
                    err.ename()
                );
                trace_stage(request, Stage::RepliedError);
                ExecutionReply::from_error(counter, &err)
            }
        }
    }

    fn execute_ready(&mut self, request: &ExecutionRequest) -> Result<Vec<Output>, KernelError> {
        if request.code.trim().is_empty() {
            return Ok(Vec::new());
        }

        let cell = magic::extract(&request.code);
        let mut outputs = Vec::new();
        for magic in &cell.magics {
            match magic {
                Magic::Attach(target) => {
                    self.sessions.attach(&request.session, target)?;
                    log::info!("session '{}' attached to '{target}'", request.session);
                }
                Magic::Session => {
                    let id = self.sessions.resolve(&request.session);
                    outputs.push(Output::stdout(format!("{id}\n")));
                }
                Magic::Unknown(command) => log::debug!("ignoring unknown magic '{command}'"),
            }
        }
        if cell.is_empty() {
            return Ok(outputs);
        }

        let Some(backend) = self.backend.as_deref_mut() else {
            return Err(KernelError::KernelUnavailable(self.status));
        };
        let entry = self
            .sessions
            .get_or_create(&request.session, backend, self.generation)?;
        trace_stage(request, Stage::SessionResolved);

        let artifact = backend
            .compile(&entry.instance, &cell.code)
            .map_err(|failure| exec_error(failure, KernelError::Compile).0)?;
        trace_stage(request, Stage::Compiled);

        let options = RunOptions {
            allow_stdin: request.allow_stdin,
        };
        match backend.run(&entry.instance, artifact, options) {
            Ok(produced) => {
                trace_stage(request, Stage::Run);
                outputs.extend(self.display.resolve_all(produced));
                Ok(outputs)
            }
            Err(failure) => {
                let (err, partial) = exec_error(failure, KernelError::Runtime);
                outputs.extend(self.display.resolve_all(partial));
                if !request.silent && !outputs.is_empty() {
                    self.notifier.notify(Notification::PartialOutput {
                        session: request.session.clone(),
                        execution_counter: request.execution_counter,
                        outputs,
                    });
                }
                Err(err)
            }
        }
    }
}

/// Maps a backend failure to its kernel error plus any outputs produced before it.
fn exec_error(
    failure: ExecFailure,
    diagnostic: fn(bscript_abi::Diagnostic) -> KernelError,
) -> (KernelError, Vec<Output>) {
    match failure {
        ExecFailure::Diagnostic {
            diagnostic: diag,
            outputs,
        } => (diagnostic(diag), outputs),
        ExecFailure::Interrupted => (KernelError::Interrupted, Vec::new()),
        ExecFailure::Fault(reason) => (KernelError::BackendFault(reason), Vec::new()),
    }
}

fn trace_stage(request: &ExecutionRequest, stage: Stage) {
    log::trace!(
        "execute {} in session '{}': {stage:?}",
        request.execution_counter,
        request.session
    );
}
