use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = ScanError> = std::result::Result<T, E>;

/// Everything that can stop a scan from starting, running or finishing cleanly.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("no device found: {0}")]
    NoDevice(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("no data sync on any input channel. Power? Cables?")]
    NoSync,

    #[error("scan is already running")]
    AlreadyRunning,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid mask plan: {0}")]
    InvalidPlan(String),

    #[error("malformed command: {0}")]
    MalformedCommand(String),

    #[error("scan failed: {0:#}")]
    Scan(anyhow::Error),

    #[error("register model error: {0}")]
    Register(String),

    #[error("corrupt ledger {}: line {line}: {content:?}", path.display())]
    LedgerCorruption {
        path: PathBuf,
        line: usize,
        content: String,
    },

    #[error("no run number left for scan {identifier}")]
    RunNumbersExhausted { identifier: String },

    #[error("run {run_number} was never assigned for scan {identifier}")]
    UnknownRun { identifier: String, run_number: u64 },

    #[error("configuration error: {0}")]
    Config(#[from] confique::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
