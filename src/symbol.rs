//! Symbol identity and definition (spec.md §3: SymbolName, SymbolDefinition,
//! Location, Target).

use crate::common::SectionIndex;
use alloc::string::String;

/// A symbol's visibility/identity, as distinct from what it's bound to.
///
/// The four "by name"/"by ordinal" variants exist because several target
/// formats (NE, LE/LX, PE) can export or import a symbol known only by a
/// numeric ordinal within its (D)DLL, with the name present merely as a hint
/// for tools. Helpers below let callers that don't care about the
/// distinction (the resolution engine, mostly) still get *a* name or *a*
/// library name out of any variant that has one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SymbolName {
    Internal(String),
    ExportedByName(String, Option<u32>),
    ExportedByOrdinal(u32, Option<String>),
    ImportedByName(String, String, Option<u32>),
    ImportedByOrdinal(String, u32),
}

impl SymbolName {
    pub fn internal(name: impl Into<String>) -> Self {
        SymbolName::Internal(name.into())
    }

    /// The name to use when loading/binding this symbol, if it has one.
    pub fn load_name(&self) -> Option<&str> {
        match self {
            SymbolName::Internal(n) => Some(n),
            SymbolName::ExportedByName(n, _) => Some(n),
            SymbolName::ExportedByOrdinal(_, hint) => hint.as_deref(),
            SymbolName::ImportedByName(_, n, _) => Some(n),
            SymbolName::ImportedByOrdinal(_, _) => None,
        }
    }

    /// The exporting library's name, for the two `Imported*` variants.
    pub fn load_library_name(&self) -> Option<&str> {
        match self {
            SymbolName::ImportedByName(lib, _, _) => Some(lib),
            SymbolName::ImportedByOrdinal(lib, _) => Some(lib),
            _ => None,
        }
    }

    /// The ordinal if known, else the hint ordinal accompanying a name.
    pub fn load_ordinal_or_hint(&self) -> Option<u32> {
        match self {
            SymbolName::ExportedByName(_, hint) => *hint,
            SymbolName::ExportedByOrdinal(ord, _) => Some(*ord),
            SymbolName::ImportedByName(_, _, hint) => *hint,
            SymbolName::ImportedByOrdinal(_, ord) => Some(*ord),
            SymbolName::Internal(_) => None,
        }
    }

    pub fn get_imported_name(&self) -> Option<(&str, &str)> {
        match self {
            SymbolName::ImportedByName(lib, name, _) => Some((lib, name)),
            _ => None,
        }
    }

    pub fn get_imported_ordinal(&self) -> Option<(&str, u32)> {
        match self {
            SymbolName::ImportedByOrdinal(lib, ord) => Some((lib, *ord)),
            _ => None,
        }
    }

    pub fn is_imported(&self) -> bool {
        matches!(
            self,
            SymbolName::ImportedByName(..) | SymbolName::ImportedByOrdinal(..)
        )
    }

    pub fn is_exported(&self) -> bool {
        matches!(
            self,
            SymbolName::ExportedByName(..) | SymbolName::ExportedByOrdinal(..)
        )
    }
}

/// A `(section, offset)` pair naming a byte within a section's address
/// space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub section: SectionIndex,
    pub offset: u64,
}

impl Location {
    pub fn new(section: SectionIndex, offset: u64) -> Self {
        Location { section, offset }
    }

    /// The address, either aligned to the containing segment's base
    /// (`aligned = true`) or as an absolute in-segment address.
    ///
    /// Resolving either form requires the section to have already been
    /// placed by the segment manager (`section.bias`/`section.segment` are
    /// `Some`); callers must run linking before calling this.
    pub fn get_position(
        &self,
        module: &crate::module::Module,
        aligned: bool,
    ) -> Option<u64> {
        let section = module.section(self.section)?;
        let bias = section.bias?;
        let segment_base = if aligned {
            0
        } else {
            module.segment(section.segment?)?.base_address
        };
        Some(segment_base + bias + self.offset)
    }
}

/// What a symbol is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolDefinition {
    Absolute(u64),
    Located(Location),
    /// A common (merge-by-name, take-the-max) symbol: `(size, alignment)`.
    /// The owning section is recorded separately in
    /// `Module::common_symbols` because a common symbol has no section of
    /// its own until the output format decides to allocate it one (usually
    /// folded into `.bss`).
    Common(u64, u64),
    Undefined,
}

/// The right-hand side of a relocation (spec.md §3 Target).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Location(Location),
    Symbol(SymbolName),
    SegmentBase(SectionIndex),
    Absolute(u64),
}
