//! The five-level diagnostic stream from spec.md §7.
//!
//! `object` itself has no logging story (it just returns `Result`), but the
//! linker-driver crates built on top of it reach for `log`
//! (`examples/other_examples/880ee93f_jiegec-cold__src-link.rs.rs` imports
//! `log::{info, warn}`). A linking *kernel* sits in the same place those
//! drivers do with respect to per-relocation and per-section diagnostics: it
//! needs to tell the caller "this happened" without aborting, which is
//! exactly what `log` is for.
//!
//! `Fatal` is deliberately not a log level here: per spec.md §5 a fatal error
//! aborts the process, but a library can only propagate `Err`, so callers
//! that want process-exit-on-fatal behavior (the out-of-scope CLI front end)
//! check `Result` themselves.

use crate::error::Severity;
use core::fmt;

/// Report a resolvable linking condition at the given severity.
///
/// `target` is a short, stable tag identifying the subsystem (`"script"`,
/// `"resolve"`, `"segment"`, a format name) so a caller filtering `log`
/// output by module can do so without string-matching full messages.
pub fn emit(severity: Severity, target: &str, message: fmt::Arguments<'_>) {
    let level = match severity {
        Severity::Debug => log::Level::Debug,
        Severity::Info => log::Level::Info,
        Severity::Warning => log::Level::Warn,
        Severity::Error => log::Level::Error,
    };
    log::log!(target: "retrolink", level, "[{target}] {message}");
}

macro_rules! diag {
    ($severity:expr, $target:expr, $($arg:tt)+) => {
        $crate::diagnostics::emit($severity, $target, format_args!($($arg)+))
    };
}

macro_rules! diag_debug {
    ($target:expr, $($arg:tt)+) => {
        $crate::diagnostics::diag!($crate::error::Severity::Debug, $target, $($arg)+)
    };
}

macro_rules! diag_warn {
    ($target:expr, $($arg:tt)+) => {
        $crate::diagnostics::diag!($crate::error::Severity::Warning, $target, $($arg)+)
    };
}

macro_rules! diag_error {
    ($target:expr, $($arg:tt)+) => {
        $crate::diagnostics::diag!($crate::error::Severity::Error, $target, $($arg)+)
    };
}

pub(crate) use {diag, diag_debug, diag_error, diag_warn};

/// Counts `Error`-severity diagnostics emitted during one `ProcessModule`
/// pass, used to pick exit code 2 the way spec.md §7 describes ("The count
/// of `Error` messages determines exit code 2 when nonzero"). The count
/// itself is exposed to callers; deciding what to do with it belongs to the
/// out-of-scope CLI front end.
#[derive(Debug, Default)]
pub struct DiagnosticCounts {
    pub warnings: u32,
    pub errors: u32,
}

impl DiagnosticCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Warning => self.warnings += 1,
            Severity::Error => self.errors += 1,
            _ => {}
        }
    }

    /// Exit code per spec.md §7: 0 if no errors, 2 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.errors > 0 {
            2
        } else {
            0
        }
    }
}
