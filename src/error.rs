use camino::Utf8PathBuf;
use thiserror::Error;

#[macro_export]
macro_rules! function_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        type_name_of(f)
            .rsplit("::")
            .find(|&part| part != "f" && part != "{{closure}}")
            .expect("Short function name")
    }};
}

#[macro_export]
macro_rules! bail_loc {
    ($msg:expr) => {
        anyhow::bail!("[{}:{} - {}] {}", file!(), $crate::function_name!(), line!(), $msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        anyhow::bail!("[{}:{} - {}] {}", file!(), $crate::function_name!(), line!(), format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! anyhow_loc {
    ($msg:expr) => {
        anyhow::anyhow!("[{}:{} - {}] {}", file!(), $crate::function_name!(), line!(), $msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        anyhow::anyhow!("[{}:{} - {}] {}", file!(), $crate::function_name!(), line!(), format!($fmt, $($arg)*))
    };
}

/// The error kinds named by the action executor's error-handling design.
///
/// Every variant but [`ActionError::NonHermeticIdentical`] is fatal: it
/// terminates the action that raised it. `NonHermeticIdentical` is kept as a
/// variant (rather than only a log line) so callers can assert a warning was
/// produced, but the executor always logs and continues past it rather than
/// returning it.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("not found: {0}")]
    NotFound(Utf8PathBuf),

    #[error("hash mismatch on replay: {field} expected {expected}, got {actual}")]
    HashMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },

    #[error("non-hermetic access with divergent content: {0}")]
    NonHermeticDivergent(Utf8PathBuf),

    #[error("non-hermetic access with identical content: {0}")]
    NonHermeticIdentical(Utf8PathBuf),

    #[error("undeclared input accessed: {0}")]
    UndeclaredInput(Utf8PathBuf),

    #[error("declared output missing after execution: {0}")]
    MissingOutput(Utf8PathBuf),

    #[error("impossible filesystem-trace transition for {path}: {detail}")]
    TraceStateError { path: Utf8PathBuf, detail: String },

    #[error("filesystem tracer failed: {0}")]
    TracerFailure(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ActionResult<T> = Result<T, ActionError>;
