//! Unified error type for the engine's control surface.
//!
//! `CoreError` is the single error type returned by `start()` and the other
//! fallible control operations. It serializes as `{ "kind": "...", "message": "..." }`
//! so a controller (UI, CLI, or otherwise) can programmatically distinguish
//! error categories without string matching.

use serde::ser::SerializeStruct;

/// Error taxonomy for the control surface (see spec §7).
///
/// Packet-path failures never surface as `CoreError` — the hot loop is
/// self-healing by design and only ever logs and continues. This type is
/// for `start()` preflight/open failures and other control-plane calls.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The capture driver file (e.g. a kernel driver) could not be found.
    #[error("capture driver missing: {0}")]
    MissingDriverFile(String),

    /// The user-mode capture library could not be loaded.
    #[error("capture library missing: {0}")]
    MissingCaptureLib(String),

    /// `open()` failed because the process lacks the privilege to install
    /// the packet hook.
    #[error("access denied opening capture handle: {0}")]
    AccessDenied(String),

    /// `open()` failed because the capture driver is not loaded/installed.
    #[error("capture driver not loaded: {0}")]
    DriverNotLoaded(String),

    /// Any other capture-layer failure, tagged with the raw OS code.
    #[error("capture error (code {code}): {message}")]
    Other { code: i32, message: String },

    /// I/O or OS-level failure outside the capture layer.
    #[error("{0}")]
    Io(String),

    /// Invalid or missing input to a control operation.
    #[error("{0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Returns the error kind as a string matching the variant name, for
    /// callers that want to branch on category without matching on text.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::MissingDriverFile(_) => "MissingDriverFile",
            CoreError::MissingCaptureLib(_) => "MissingCaptureLib",
            CoreError::AccessDenied(_) => "AccessDenied",
            CoreError::DriverNotLoaded(_) => "DriverNotLoaded",
            CoreError::Other { .. } => "Other",
            CoreError::Io(_) => "Io",
            CoreError::InvalidInput(_) => "InvalidInput",
        }
    }

    /// Exit code suitable for a CLI wrapper (spec §6: 0 on clean stop,
    /// non-zero on start failure from the error taxonomy).
    pub fn exit_code(&self) -> i32 {
        match self {
            CoreError::MissingDriverFile(_) => 2,
            CoreError::MissingCaptureLib(_) => 3,
            CoreError::AccessDenied(_) => 4,
            CoreError::DriverNotLoaded(_) => 5,
            CoreError::Other { code, .. } => *code,
            CoreError::Io(_) => 6,
            CoreError::InvalidInput(_) => 7,
        }
    }
}

/// Produces `{ "kind": "Variant", "message": "..." }` for any downstream controller.
impl serde::Serialize for CoreError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("CoreError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

// ---- From implementations for ergonomic error conversion ----

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::Other {
            code: -1,
            message: err.to_string(),
        }
    }
}
