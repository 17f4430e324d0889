//! Daemon loop that owns the kernel.
//!
//! Every request reaches the kernel through the control channel and is
//! handled to completion before the next one, which also orders shutdown
//! after any in-flight request. Interrupts do not go through the channel.

use bscript_kernel::{
    BackendLoader, CompleteReply, CompleteRequest, ExecutionReply, ExecutionRequest,
    HistoryEntry, HistoryRequest, InspectReply, InspectRequest, InterruptHandle, IsCompleteReply,
    Kernel, KernelInfo, ShutdownReport,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::HostConfig;
use crate::control::ControlServer;
use crate::error::HostError;
use crate::notify::BroadcastNotifier;

/// Control message for the daemon.
#[derive(Debug)]
pub enum ControlMsg {
    Execute {
        request: ExecutionRequest,
        resp: oneshot::Sender<ExecutionReply>,
    },
    Complete {
        request: CompleteRequest,
        resp: oneshot::Sender<Result<CompleteReply, HostError>>,
    },
    Inspect {
        request: InspectRequest,
        resp: oneshot::Sender<Result<InspectReply, HostError>>,
    },
    IsComplete {
        code: String,
        resp: oneshot::Sender<Result<IsCompleteReply, HostError>>,
    },
    KernelInfo {
        resp: oneshot::Sender<Result<KernelInfo, HostError>>,
    },
    History {
        request: HistoryRequest,
        resp: oneshot::Sender<Result<Vec<HistoryEntry>, HostError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<ShutdownReport, HostError>>,
        /// Propagates shutdown to the control server.
        shutdown_tx: broadcast::Sender<()>,
    },
}

pub struct KernelDaemon {
    kernel: Kernel,
    control_rx: mpsc::Receiver<ControlMsg>,
    shutdown_rx: broadcast::Receiver<()>,
    control_server: Option<JoinHandle<()>>,
}

impl KernelDaemon {
    /// The kernel should already be configured.
    pub fn new(
        kernel: Kernel,
        control_rx: mpsc::Receiver<ControlMsg>,
        shutdown_rx: broadcast::Receiver<()>,
        control_server: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            kernel,
            control_rx,
            shutdown_rx,
            control_server,
        }
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn interrupt_handle(&self) -> Option<InterruptHandle> {
        self.kernel.interrupt_handle()
    }

    /// Serves control messages until shutdown, then releases the kernel.
    pub async fn run(&mut self) -> Result<ShutdownReport, HostError> {
        tracing::info!(status = %self.kernel.status(), "kernel daemon started");
        let mut report = None;

        loop {
            tokio::select! {
                msg = self.control_rx.recv() => {
                    match msg {
                        Some(cmd) => {
                            report = self.apply_control(cmd);
                            if report.is_some() {
                                tracing::info!("shutdown requested via control channel");
                                break;
                            }
                        }
                        None => {
                            tracing::debug!("control channel closed");
                            break;
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    tracing::info!("shutdown signal received");
                    break;
                }
            }
        }

        let report = match report {
            Some(report) => report,
            None => self.kernel.shutdown(),
        };
        tracing::info!(
            freed = report.freed,
            failed = report.failed,
            "kernel daemon stopped"
        );
        if let Some(handle) = self.control_server.take() {
            let _ = handle.await;
        }
        Ok(report)
    }

    /// Returns the shutdown report once a shutdown request was served.
    fn apply_control(&mut self, cmd: ControlMsg) -> Option<ShutdownReport> {
        match cmd {
            ControlMsg::Execute { request, resp } => {
                tracing::debug!(
                    session = %request.session,
                    counter = request.execution_counter,
                    "execute"
                );
                let _ = resp.send(self.kernel.execute(&request));
            }
            ControlMsg::Complete { request, resp } => {
                let _ = resp.send(self.kernel.complete(&request).map_err(HostError::from));
            }
            ControlMsg::Inspect { request, resp } => {
                let _ = resp.send(self.kernel.inspect(&request).map_err(HostError::from));
            }
            ControlMsg::IsComplete { code, resp } => {
                let _ = resp.send(self.kernel.is_complete(&code).map_err(HostError::from));
            }
            ControlMsg::KernelInfo { resp } => {
                let _ = resp.send(self.kernel.kernel_info().map_err(HostError::from));
            }
            ControlMsg::History { request, resp } => {
                let _ = resp.send(self.kernel.history(&request).map_err(HostError::from));
            }
            ControlMsg::Shutdown { resp, shutdown_tx } => {
                let done = self.kernel.shutdown();
                let _ = shutdown_tx.send(());
                let _ = resp.send(Ok(done));
                return Some(done);
            }
        }
        None
    }
}

/// Configures a kernel, serves it on the control socket and returns once it shut down.
/// Fails without serving when the backend cannot be loaded.
pub async fn serve(
    config: HostConfig,
    loader: Box<dyn BackendLoader>,
) -> Result<ShutdownReport, HostError> {
    let (notify_tx, _) = broadcast::channel(config.notification_buffer.max(1));
    let mut kernel = Kernel::with_notifier(
        config.kernel.clone(),
        loader,
        Box::new(BroadcastNotifier::new(notify_tx.clone())),
    );
    kernel.configure()?;
    if !kernel.is_ready() {
        let reason = kernel
            .diagnostic()
            .unwrap_or("backend did not load")
            .to_string();
        return Err(HostError::Initialization(reason));
    }

    let (control_tx, control_rx) = mpsc::channel(config.control_queue.max(1));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let server = ControlServer::new(
        config.control_socket.clone(),
        control_tx,
        shutdown_tx.clone(),
    )
    .with_interrupt(kernel.interrupt_handle())
    .with_notifications(notify_tx);
    let listening = server.bind()?;
    let server_handle = tokio::spawn(async move {
        if let Err(err) = server.serve(listening).await {
            tracing::error!("control server failed: {err}");
        }
    });

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt signal received; shutting down");
            let _ = signal_tx.send(());
        }
    });

    tracing::info!(socket = %config.control_socket.display(), "kernel ready");
    let mut daemon = KernelDaemon::new(kernel, control_rx, shutdown_rx, Some(server_handle));
    let report = daemon.run().await;
    // Wake the control server if the daemon stopped on its own.
    let _ = shutdown_tx.send(());
    report
}
