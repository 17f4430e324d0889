//! The kernel over a real wasmtime-loaded backend module.

use bscript_abi::{CompileOutput, Diagnostic, RunOutput};
use bscript_kernel::{
    ExecutionReply, ExecutionRequest, Kernel, KernelConfig, KernelStatus, Output, WasmLoader,
};
use bscript_testkit::stub_backend::StubBackend;
use bscript_testkit::RecordingNotifier;
use bscript_wasm::{COMPILE_EXPORT, RUN_EXPORT};
use tempfile::TempDir;

fn kernel_for(stub: &StubBackend) -> (TempDir, Kernel, RecordingNotifier) {
    let dir = TempDir::new().unwrap();
    let path = stub.write_to(dir.path());
    let config = KernelConfig::default()
        .with_backend_path(path)
        .with_data_dir(dir.path());
    let notifier = RecordingNotifier::new();
    let kernel = Kernel::with_notifier(
        config,
        Box::new(WasmLoader::new(None).unwrap()),
        Box::new(notifier.clone()),
    );
    (dir, kernel, notifier)
}

#[test]
fn executes_against_loaded_module() {
    let ran = RunOutput {
        outputs: vec![Output::stdout("hello\n"), Output::value("3")],
        diagnostic: None,
    };
    let stub = StubBackend::new().reply(RUN_EXPORT, ran.encode().unwrap());
    let (_dir, mut kernel, notifier) = kernel_for(&stub);
    kernel.configure().unwrap();
    assert_eq!(kernel.status(), KernelStatus::Ready);

    let reply = kernel.execute(&ExecutionRequest::new("A", 1, "1 + 2"));
    assert_eq!(
        reply,
        ExecutionReply::success(1, vec![Output::stdout("hello\n"), Output::value("3")])
    );
    assert_eq!(notifier.len(), 1);
    assert!(kernel.has_session("A"));
    assert_eq!(kernel.shutdown().freed, 1);
}

#[test]
fn backend_diagnostic_becomes_error_reply() {
    let failed = CompileOutput::failed(
        Diagnostic::new("unexpected token")
            .with_kind("SyntaxError")
            .at(3, 2),
    );
    let stub = StubBackend::new().reply(COMPILE_EXPORT, failed.encode().unwrap());
    let (_dir, mut kernel, _) = kernel_for(&stub);
    kernel.configure().unwrap();

    let reply = kernel.execute(&ExecutionRequest::new("B", 4, "x ="));
    assert_eq!(
        reply,
        ExecutionReply::Error {
            execution_counter: 4,
            ename: "SyntaxError".into(),
            evalue: "unexpected token".into(),
            traceback: vec!["at line 3, column 2".into()],
        }
    );
    assert!(kernel.has_session("B"));
}

#[test]
fn refused_instance_is_a_session_creation_error() {
    let stub = StubBackend::new().create_result(-1);
    let (_dir, mut kernel, _) = kernel_for(&stub);
    kernel.configure().unwrap();
    let reply = kernel.execute(&ExecutionRequest::new("A", 1, "x"));
    assert_eq!(reply.ename(), Some("SessionCreationError"));
    assert!(!kernel.has_session("A"));
}

#[test]
fn nonexistent_backend_path_errors_without_aborting() {
    let dir = TempDir::new().unwrap();
    let config = KernelConfig::default().with_backend_path(dir.path().join("missing.wasm"));
    let mut kernel = Kernel::new(config, Box::new(WasmLoader::new(None).unwrap()));
    kernel.configure().unwrap();
    assert_eq!(kernel.status(), KernelStatus::Errored);
    assert!(kernel.diagnostic().unwrap().contains("missing.wasm"));

    let reply = kernel.execute(&ExecutionRequest::new("A", 1, "x = 1"));
    assert_eq!(reply.ename(), Some("KernelUnavailableError"));
}

#[test]
fn module_missing_an_export_fails_initialization() {
    let stub = StubBackend::new().without(RUN_EXPORT);
    let (_dir, mut kernel, _) = kernel_for(&stub);
    kernel.configure().unwrap();
    assert_eq!(kernel.status(), KernelStatus::Errored);
    assert!(kernel.diagnostic().unwrap().contains("'run'"));
}

#[test]
fn interrupt_reaches_a_spinning_guest() {
    let stub = StubBackend::new().spin(RUN_EXPORT);
    let (_dir, mut kernel, _) = kernel_for(&stub);
    kernel.configure().unwrap();
    let handle = kernel.interrupt_handle().unwrap();
    let interrupter = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(100));
        handle.interrupt();
    });
    let reply = kernel.execute(&ExecutionRequest::new("A", 1, "loop"));
    interrupter.join().unwrap();
    assert_eq!(reply.ename(), Some("Interrupted"));
}
