use core::fmt;

/// An error from parsing, linking or writing.
///
/// Mirrors `object::read::Error`: a thin wrapper around a static message, not
/// a hierarchy of error types. Every fallible operation in this crate returns
/// [`Result`]; there is no dynamic payload because nothing here needs one the
/// teacher crate didn't already need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error(pub &'static str);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// Severity of a non-fatal diagnostic (spec.md §7).
///
/// `Fatal` is not a member here: a fatal condition is always surfaced as
/// `Err(Error)`, never merely logged, because a library cannot unilaterally
/// terminate its host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}
