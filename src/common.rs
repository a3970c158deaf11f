//! Shared enums for the data model (spec.md §3), grounded in the same
//! "small closed enum, not a trait object" style `object::common` uses for
//! `Architecture`/`SymbolKind`/`SectionKind`.

use core::fmt;

/// Target instruction set of a [`crate::module::Module`].
///
/// The historical-format corpus this crate targets covers every CPU family
/// `RetroLinker` (`examples/original_source/`) names across its container
/// plugins, not just the mainstream ones `object` enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Cpu {
    I86,
    I386,
    X86_64,
    M68K,
    Ppc,
    Arm,
    Arm64,
    Mips,
    Sh,
    Alpha,
    Ia64,
    Pdp11,
    Vax,
    Z80,
    Z8K,
    M6502,
    RiscV,
    Sparc,
    Unknown,
}

impl fmt::Display for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Cpu::I86 => "i86",
            Cpu::I386 => "i386",
            Cpu::X86_64 => "x86_64",
            Cpu::M68K => "m68k",
            Cpu::Ppc => "ppc",
            Cpu::Arm => "arm",
            Cpu::Arm64 => "arm64",
            Cpu::Mips => "mips",
            Cpu::Sh => "sh",
            Cpu::Alpha => "alpha",
            Cpu::Ia64 => "ia64",
            Cpu::Pdp11 => "pdp11",
            Cpu::Vax => "vax",
            Cpu::Z80 => "z80",
            Cpu::Z8K => "z8k",
            Cpu::M6502 => "m6502",
            Cpu::RiscV => "riscv",
            Cpu::Sparc => "sparc",
            Cpu::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

bitflags::bitflags! {
    /// Section attribute bits (spec.md §3 Section).
    ///
    /// `FORMAT_BIT_0`..`FORMAT_BIT_3` are reserved for the per-output-format
    /// additional flags `FormatAdditionalSectionFlags` (§4.6) contributes —
    /// e.g. the PE writer maps its own "discardable"/"shared" bits onto
    /// them, rather than every format needing its own flags type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        const NONE = 0;
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const EXECUTABLE = 1 << 2;
        const ZERO_FILLED = 1 << 3;
        const MERGEABLE = 1 << 4;
        const FIXED = 1 << 5;
        const STACK = 1 << 6;
        const HEAP = 1 << 7;
        const OPTIONAL = 1 << 8;
        const RESOURCE = 1 << 9;
        const COMDAT = 1 << 10;
        const FORMAT_BIT_0 = 1 << 24;
        const FORMAT_BIT_1 = 1 << 25;
        const FORMAT_BIT_2 = 1 << 26;
        const FORMAT_BIT_3 = 1 << 27;
    }
}

impl Default for SectionFlags {
    fn default() -> Self {
        SectionFlags::NONE
    }
}

/// A 0-based index into a [`crate::module::Module`]'s section list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionIndex(pub usize);

/// A 0-based index into a symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolIndex(pub usize);

/// A 0-based index into a [`crate::module::Module`]'s laid-out segment list,
/// assigned by the segment manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentIndex(pub usize);
