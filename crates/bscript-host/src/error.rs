use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("kernel error: {0}")]
    Kernel(#[from] bscript_kernel::KernelError),
    #[error("kernel failed to initialize: {0}")]
    Initialization(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid connection file: {0}")]
    Connection(String),
    #[error("control channel error: {0}")]
    Control(String),
}
