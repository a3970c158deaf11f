//! The `Module` aggregate (spec.md §3 Module): the common representation
//! every input plugin populates and exactly one output plugin consumes.

use crate::common::{Cpu, SectionFlags, SectionIndex, SegmentIndex, SymbolIndex};
use crate::relocation::Relocation;
use crate::section::Section;
use crate::segment::Segment;
use crate::symbol::{Location, SymbolDefinition, SymbolName};
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

/// A common (uninitialized) symbol contributed by one or more input modules,
/// before merging (spec.md §4.2: "Common symbols are merged by name: the
/// surviving entry has the maximum size and maximum alignment across
/// contributions").
#[derive(Debug, Clone, Copy)]
pub struct CommonSymbol {
    pub size: u64,
    pub alignment: u64,
}

/// The format-agnostic container for everything a link needs: sections,
/// the four symbol tables, and relocations, plus enough target metadata
/// (`cpu`) for format plugins that branch on architecture.
///
/// Lifecycle (spec.md §3): constructed empty, populated by one or more
/// input plugins, consumed once by a single output plugin. After
/// `ProcessModule` returns, the only mutation is `Relocation::write_word`'s
/// in-place patch of section bytes during resolution.
#[derive(Debug, Default)]
pub struct Module {
    pub cpu: Option<Cpu>,
    sections: Vec<Section>,
    pub segments: Vec<Segment>,
    pub global_symbols: BTreeMap<String, Location>,
    pub local_symbols: BTreeMap<String, Location>,
    pub imported_symbols: Vec<SymbolName>,
    pub exported_symbols: BTreeMap<SymbolName, Location>,
    pub common_symbols: BTreeMap<String, CommonSymbol>,
    pub relocations: Vec<Relocation>,
    /// Alignment negotiated for `.stack`/`.heap` sections between the
    /// format and the module (spec.md §3).
    pub stack_heap_alignment: u64,
}

impl Module {
    pub fn new() -> Self {
        Module {
            stack_heap_alignment: 1,
            ..Default::default()
        }
    }

    /// Add a section, returning the index it was assigned. Section addition
    /// order is the order the module later presents sections to a script
    /// (spec.md §5).
    pub fn add_section(&mut self, section: Section) -> SectionIndex {
        let index = SectionIndex(self.sections.len());
        self.sections.push(section);
        index
    }

    pub fn section(&self, index: SectionIndex) -> Option<&Section> {
        self.sections.get(index.0)
    }

    pub fn section_mut(&mut self, index: SectionIndex) -> Option<&mut Section> {
        self.sections.get_mut(index.0)
    }

    pub fn sections(&self) -> impl Iterator<Item = (SectionIndex, &Section)> {
        self.sections
            .iter()
            .enumerate()
            .map(|(i, s)| (SectionIndex(i), s))
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn section_by_name(&self, name: &str) -> Option<SectionIndex> {
        self.sections
            .iter()
            .position(|s| s.name == name)
            .map(SectionIndex)
    }

    pub fn segment(&self, index: SegmentIndex) -> Option<&Segment> {
        self.segments.get(index.0)
    }

    /// Add a relocation. Relocation resolution order equals insertion order
    /// (spec.md §4.5, §5).
    pub fn add_relocation(&mut self, relocation: Relocation) {
        self.relocations.push(relocation);
    }

    /// Define a global symbol.
    pub fn define_global(&mut self, name: impl Into<String>, location: Location) {
        self.global_symbols.insert(name.into(), location);
    }

    /// Define a local (module-private) symbol.
    pub fn define_local(&mut self, name: impl Into<String>, location: Location) {
        self.local_symbols.insert(name.into(), location);
    }

    /// Contribute a common symbol, merging with any prior contribution by
    /// taking the maximum size and maximum alignment (spec.md §4.2, §8).
    pub fn contribute_common(&mut self, name: impl Into<String>, size: u64, alignment: u64) {
        let name = name.into();
        self.common_symbols
            .entry(name)
            .and_modify(|c| {
                c.size = c.size.max(size);
                c.alignment = c.alignment.max(alignment);
            })
            .or_insert(CommonSymbol { size, alignment });
    }

    /// Look up a defined symbol's definition across the global, local and
    /// common tables, in that order (globals shadow locals of the same
    /// name, matching a conventional linker's visibility rule: a global
    /// definition elsewhere in the link always wins over a same-named local
    /// symbol in this module).
    pub fn lookup(&self, name: &str) -> Option<SymbolDefinition> {
        if let Some(loc) = self.global_symbols.get(name) {
            return Some(SymbolDefinition::Located(*loc));
        }
        if let Some(loc) = self.local_symbols.get(name) {
            return Some(SymbolDefinition::Located(*loc));
        }
        if let Some(common) = self.common_symbols.get(name) {
            return Some(SymbolDefinition::Common(common.size, common.alignment));
        }
        None
    }

    pub fn is_imported(&self, name: &SymbolName) -> bool {
        self.imported_symbols.contains(name)
    }

    /// Materialize every merged common symbol (spec.md §4.2 merge, §4.5
    /// "resolution is deferred until after common-merging") into one
    /// zero-filled section named `bss_name`, so the resolution engine has
    /// a concrete `Location` to collapse `Target::Symbol` references to.
    ///
    /// Every output plugin's default `ProcessModule` calls this before
    /// running the script, so `.bss`/equivalent participates in placement
    /// like any other section (spec.md §5: "Section addition order is the
    /// order in which the Module presents sections to a script").
    pub fn fold_common_symbols(&mut self, bss_name: &str, flags: SectionFlags) {
        if self.common_symbols.is_empty() {
            return;
        }
        let names: Vec<String> = self.common_symbols.keys().cloned().collect();
        let section = self.add_section(Section::new(bss_name, flags | SectionFlags::ZERO_FILLED));
        let mut offset = 0u64;
        for name in names {
            let common = self.common_symbols[&name];
            offset = align_up(offset, common.alignment.max(1));
            self.define_global(name, Location::new(section, offset));
            offset += common.size;
        }
        if let Some(s) = self.section_mut(section) {
            s.zero_fill = offset;
        }
        self.common_symbols.clear();
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        (value + alignment - 1) & !(alignment - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SectionFlags;

    #[test]
    fn common_symbol_merge_takes_max_size_and_alignment() {
        let mut m = Module::new();
        m.contribute_common("foo", 4, 2);
        m.contribute_common("foo", 8, 4);
        let c = m.common_symbols.get("foo").unwrap();
        assert_eq!(c.size, 8);
        assert_eq!(c.alignment, 4);
    }

    #[test]
    fn section_addition_preserves_order() {
        let mut m = Module::new();
        let a = m.add_section(Section::new(".text", SectionFlags::EXECUTABLE));
        let b = m.add_section(Section::new(".data", SectionFlags::WRITABLE));
        assert_eq!(a.0, 0);
        assert_eq!(b.0, 1);
        assert_eq!(m.section_by_name(".data"), Some(b));
    }

    #[test]
    fn fold_common_symbols_allocates_aligned_bss_offsets() {
        let mut m = Module::new();
        m.contribute_common("foo", 3, 2);
        m.contribute_common("bar", 8, 4);
        m.fold_common_symbols(".bss", SectionFlags::NONE);
        assert!(m.common_symbols.is_empty());
        let foo = m.global_symbols.get("foo").unwrap();
        let bar = m.global_symbols.get("bar").unwrap();
        assert_eq!(foo.offset, 0);
        // `bar` needs 4-byte alignment, so it doesn't start right after
        // `foo`'s 3 bytes at offset 3.
        assert_eq!(bar.offset, 4);
        let section = m.section(foo.section).unwrap();
        assert_eq!(section.zero_fill, 12);
    }
}
