//! Error taxonomy for the GPU profiling subsystem
//!
//! Two classes of failure exist: recoverable conditions surfaced as
//! [`ProfilingError`] values, and unrecoverable vendor/allocation failures
//! that terminate the process. The tool cannot meaningfully continue once
//! its correlation state diverges from the driver's, so vendor API errors
//! are not propagated upward; they end the run with a one-line diagnostic.

use std::path::PathBuf;
use thiserror::Error;

/// URL printed alongside fatal diagnostics
const TROUBLESHOOTING_URL: &str = "https://github.com/paiml/centinela/blob/main/docs/troubleshooting.md";

/// Recoverable errors of the profiling subsystem
#[derive(Debug, Error)]
pub enum ProfilingError {
    /// A cubin image could not be parsed as ELF; symbols resolve to empty
    #[error("unreadable device binary ({0})")]
    UnreadableCubin(String),

    /// Writing a deduplicated cubin failed after the file was opened
    #[error("short write while emitting cubin to {path}")]
    CubinEmit { path: PathBuf },

    /// The sanitizer patch fatbin is missing on disk; sanitization is
    /// disabled for the affected context
    #[error("patch image not found: {0}")]
    PatchImageMissing(PathBuf),

    /// An activity referenced a correlation id with no published record
    #[error("no correlation record for vendor id {0}")]
    MissingCorrelation(u32),

    /// I/O error from the filesystem layer
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Terminate the process after a vendor API failure.
///
/// `fn_name` is the vendor entry point, `detail` the vendor-provided error
/// string. Never returns: correlation push/pop balance is unrecoverable once
/// a vendor call fails mid-protocol.
pub fn vendor_fatal(fn_name: &str, detail: &str) -> ! {
    tracing::error!(
        "vendor call {} failed: {}; see {}",
        fn_name,
        detail,
        TROUBLESHOOTING_URL
    );
    eprintln!("centinela: {fn_name} failed with {detail} (see {TROUBLESHOOTING_URL})");
    std::process::exit(1);
}

/// Terminate the process when a cubin cache file cannot be opened.
/// `AlreadyExists` never reaches here; any other open failure means the
/// measurement directory is unusable.
pub fn cubin_open_fatal(path: &std::path::Path, err: &std::io::Error) -> ! {
    tracing::error!(path = %path.display(), %err, "unable to open cubin file");
    eprintln!(
        "centinela: unable to open file '{}': {err} (see {TROUBLESHOOTING_URL})",
        path.display()
    );
    std::process::exit(1);
}

/// Terminate the process on allocation failure in a vendor buffer path.
pub fn alloc_fatal(what: &str) -> ! {
    tracing::error!("out of memory allocating {}", what);
    eprintln!("centinela: out of memory allocating {what} (see {TROUBLESHOOTING_URL})");
    std::process::exit(1);
}
