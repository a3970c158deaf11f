//! The resolution engine (spec.md §4.5).

use crate::common::SegmentIndex;
use crate::diagnostics::diag_warn;
use crate::module::Module;
use crate::relocation::{Relocation, RelocationKind};
use crate::symbol::{SymbolDefinition, SymbolName, Target};

/// Output of resolving one relocation (spec.md §3 Resolution).
///
/// `target`/`reference` are normalized to `None` when they coincide, per
/// spec.md's constructor note: "the offset is then absolute from the
/// perspective of the reference frame."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub value: u64,
    pub target: Option<SegmentIndex>,
    pub reference: Option<SegmentIndex>,
}

impl Resolution {
    pub fn new(value: u64, target: Option<SegmentIndex>, reference: Option<SegmentIndex>) -> Self {
        if target == reference {
            Resolution {
                value,
                target: None,
                reference: None,
            }
        } else {
            Resolution {
                value,
                target,
                reference,
            }
        }
    }
}

impl core::fmt::Display for Resolution {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "resolution({:#x}", self.value)?;
        if let Some(t) = self.target {
            write!(f, " to target segment {}", t.0)?;
        }
        if let Some(r) = self.reference {
            write!(f, " wrt reference segment {}", r.0)?;
        }
        write!(f, ")")
    }
}

/// Result of running a relocation through the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved(Resolution),
    /// The value resolved but does not fit `size` bytes after sign
    /// extension (spec.md §4.5 step 5): still written, diagnostic only.
    Truncated(Resolution),
    /// The target or reference is an as-yet-unresolved symbol and this
    /// relocation's kind cannot defer to the output format's own import
    /// mechanism.
    Unresolved(SymbolName),
    /// The target names an imported symbol and the relocation kind permits
    /// deferring to the format's import encoding (spec.md §4.5 step 3).
    DeferToImport(SymbolName),
}

enum Collapsed {
    Located(u64, Option<SegmentIndex>),
    Absolute(u64),
    /// The name is a declared import (spec.md §4.5 step 3: "import-allowed
    /// kind"): the caller may defer to the output format's own import
    /// encoding instead of treating this as a link error.
    Imported(SymbolName),
    /// Genuinely undefined: no definition anywhere in the module and not
    /// declared as an import. Always a link error, never a silent defer.
    Unresolved(SymbolName),
}

fn collapse(target: &Target, module: &Module) -> Collapsed {
    match target {
        Target::Absolute(n) => Collapsed::Absolute(*n),
        Target::Location(loc) => match module.section(loc.section) {
            Some(section) => match (section.bias, section.segment) {
                (Some(bias), segment) => Collapsed::Located(bias + loc.offset, segment),
                (None, _) => Collapsed::Unresolved(SymbolName::internal("<unplaced section>")),
            },
            None => Collapsed::Unresolved(SymbolName::internal("<invalid section>")),
        },
        Target::SegmentBase(section) => match module.section(*section) {
            Some(s) => match (s.bias, s.segment) {
                (Some(bias), segment) => Collapsed::Located(bias, segment),
                (None, _) => Collapsed::Unresolved(SymbolName::internal("<unplaced section>")),
            },
            None => Collapsed::Unresolved(SymbolName::internal("<invalid section>")),
        },
        Target::Symbol(name) => {
            if module.is_imported(name) {
                return Collapsed::Imported(name.clone());
            }
            let load_name = match name.load_name() {
                Some(n) => n,
                None => return Collapsed::Unresolved(name.clone()),
            };
            match module.lookup(load_name) {
                Some(SymbolDefinition::Absolute(v)) => Collapsed::Absolute(v),
                Some(SymbolDefinition::Located(loc)) => match module.section(loc.section) {
                    Some(section) => match (section.bias, section.segment) {
                        (Some(bias), segment) => Collapsed::Located(bias + loc.offset, segment),
                        (None, _) => Collapsed::Unresolved(name.clone()),
                    },
                    None => Collapsed::Unresolved(name.clone()),
                },
                // Common-symbol addresses are only known once the output
                // format has folded them into a concrete section (usually
                // `.bss`); until then resolution must defer (spec.md §4.5:
                // "For common symbols, resolution is deferred until after
                // common-merging").
                Some(SymbolDefinition::Common(..)) | Some(SymbolDefinition::Undefined) | None => {
                    Collapsed::Unresolved(name.clone())
                }
            }
        }
    }
}

/// `Resolve(relocation, module) -> Resolution | Unresolved` (spec.md §4.5).
pub fn resolve(relocation: &Relocation, module: &Module) -> ResolveOutcome {
    let target = collapse(&relocation.target, module);
    let reference = match &relocation.reference {
        Some(t) => collapse(t, module),
        None => Collapsed::Absolute(0),
    };

    let (target_value, target_segment) = match target {
        Collapsed::Located(v, seg) => (v, seg),
        Collapsed::Absolute(v) => (v, None),
        // Deferring to the format's import encoding is a property of the
        // *symbol* (is it a declared import?), never of the relocation's
        // `kind` — a genuinely undefined name must always surface as an
        // error, regardless of what kind of relocation referenced it.
        Collapsed::Imported(name) => return ResolveOutcome::DeferToImport(name),
        Collapsed::Unresolved(name) => return ResolveOutcome::Unresolved(name),
    };
    let (reference_value, reference_segment) = match reference {
        Collapsed::Located(v, seg) => (v, seg),
        Collapsed::Absolute(v) => (v, None),
        // An import can't serve as a relative reference frame; there is no
        // format-level encoding for "relative to an imported symbol", so
        // this is always a link error, never a defer.
        Collapsed::Imported(name) | Collapsed::Unresolved(name) => return ResolveOutcome::Unresolved(name),
    };

    let mut value = target_value
        .wrapping_sub(reference_value)
        .wrapping_add(relocation.addend as u64);

    value = match relocation.kind {
        RelocationKind::Direct => value,
        RelocationKind::ParagraphAddress => value >> 4,
        RelocationKind::SelectorIndex => value,
    };

    let shifted = if relocation.shift >= 0 {
        value >> relocation.shift as u32
    } else {
        value << (-relocation.shift) as u32
    };
    let masked = shifted & relocation.mask;

    let resolution = Resolution::new(masked, target_segment, reference_segment);

    let signed = masked as i64;
    if relocation.truncates(signed) {
        diag_warn!(
            "resolve",
            "relocation at section {} offset {:#x} truncated to {} bytes",
            relocation.source.section.0,
            relocation.source.offset,
            relocation.size
        );
        ResolveOutcome::Truncated(resolution)
    } else {
        ResolveOutcome::Resolved(resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SectionFlags;
    use crate::relocation::Relocation;
    use crate::section::Section;
    use crate::segment::Segment;
    use crate::symbol::Location;

    fn placed_module() -> (Module, crate::common::SectionIndex) {
        let mut m = Module::new();
        let code = m.add_section(Section::new(".code", SectionFlags::EXECUTABLE));
        m.section_mut(code).unwrap().bias = Some(0);
        m.section_mut(code).unwrap().segment = Some(crate::common::SegmentIndex(0));
        m.segments.push(Segment {
            base_address: 0x1000,
            ..Segment::new(".code")
        });
        (m, code)
    }

    #[test]
    fn direct_absolute_difference() {
        let (module, code) = placed_module();
        let reloc = Relocation::new(
            Location::new(code, 0x10),
            Target::Location(Location::new(code, 0x1000)),
            RelocationKind::Direct,
            4,
        );
        match resolve(&reloc, &module) {
            ResolveOutcome::Resolved(r) => assert_eq!(r.value, 0x1000),
            other => panic!("expected resolved, got {other:?}"),
        }
    }

    #[test]
    fn paragraph_address_shifts_by_four() {
        let (module, code) = placed_module();
        let reloc = Relocation::new(
            Location::new(code, 0x10),
            Target::Location(Location::new(code, 0x1000)),
            RelocationKind::ParagraphAddress,
            2,
        );
        match resolve(&reloc, &module) {
            ResolveOutcome::Resolved(r) => assert_eq!(r.value, 0x100),
            other => panic!("expected resolved, got {other:?}"),
        }
    }

    #[test]
    fn unresolved_imported_symbol_defers() {
        let (module, code) = placed_module();
        let name = SymbolName::ImportedByName("KERNEL".into(), "GetProcAddress".into(), None);
        let mut m = module;
        m.imported_symbols.push(name.clone());
        let reloc = Relocation::new(
            Location::new(code, 0x10),
            Target::Symbol(name.clone()),
            RelocationKind::Direct,
            4,
        );
        match resolve(&reloc, &m) {
            ResolveOutcome::DeferToImport(n) => assert_eq!(n, name),
            other => panic!("expected defer, got {other:?}"),
        }
    }

    #[test]
    fn undefined_direct_symbol_is_unresolved_not_deferred() {
        // A typo'd/undefined symbol referenced by a `Direct` relocation
        // must never be mistaken for an import defer: only a name actually
        // present in `imported_symbols` may defer.
        let (module, code) = placed_module();
        let name = SymbolName::internal("does_not_exist");
        let reloc = Relocation::new(
            Location::new(code, 0x10),
            Target::Symbol(name.clone()),
            RelocationKind::Direct,
            4,
        );
        match resolve(&reloc, &module) {
            ResolveOutcome::Unresolved(n) => assert_eq!(n, name),
            other => panic!("expected unresolved, got {other:?}"),
        }
    }

    #[test]
    fn truncation_detected_but_value_returned() {
        let (module, code) = placed_module();
        let reloc = Relocation::new(
            Location::new(code, 0x10),
            Target::Location(Location::new(code, 0x10000)),
            RelocationKind::Direct,
            1,
        );
        match resolve(&reloc, &module) {
            ResolveOutcome::Truncated(r) => assert_eq!(r.value, 0x10000),
            other => panic!("expected truncated, got {other:?}"),
        }
    }
}
