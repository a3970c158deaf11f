//! A format-agnostic linking kernel and multi-format historical
//! executable/object reader, writer and dumper.
//!
//! The crate root mirrors `object`'s: a small always-on core (data model,
//! I/O primitives, the script engine, the segment manager, the resolution
//! engine) plus a `format` module of per-container plugins, each gated by
//! its own Cargo feature so a consumer that only cares about one family
//! does not pull in the rest.
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod common;
pub mod diagnostics;
pub mod dump;
pub mod error;
pub mod image;
pub mod io;
pub mod module;
pub mod pod;
pub mod relocation;
pub mod resolve;
pub mod script;
pub mod section;
pub mod segment;
pub mod symbol;

pub mod format;

pub use common::Cpu;
pub use error::{Error, Result, Severity};
pub use module::Module;
