//! The OS/2 LE/LX ("Linear Executable") format (spec.md §6, §8 scenario 3),
//! grounded in `examples/original_source/src/format/leexe.h`'s `LEFormat`,
//! `Object`, `Page` and `Page::Relocation` classes.
//!
//! Where NE addresses memory in 16-bit segments, LE/LX addresses memory in
//! 32-bit flat *objects*, each split into fixed-size *pages* (spec.md §4.7:
//! "Paged containers (LE/LX): split each Segment into page-sized chunks,
//! emit per-page fixup tables"). This plugin always emits the LX variant
//! (`examples/original_source/src/format/leexe.h`'s `Page::LXPage`, which
//! carries an explicit file offset per page; the plain LE variant's
//! page-number-only addressing is a strict subset we don't need to target
//! separately).

use crate::common::{SectionFlags, SectionIndex};
use crate::diagnostics::diag_warn;
use crate::dump::{Block, Region, Report};
use crate::error::{Error, Result};
use crate::image::Image;
use crate::io::Writer;
use crate::module::Module;
use crate::relocation::RelocationKind;
use crate::script::{self, Script};
use crate::segment::{Segment as LinkSegment, SegmentSink};
use crate::symbol::{SymbolName, Target};
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use super::options::{OptionCollector, OptionField, OptionMap};
use super::OutputFormat;

pub const HEADER_SIZE: u64 = 0xA8;
pub const DEFAULT_PAGE_SIZE: u64 = 0x1000;

bitflags::bitflags! {
    /// `leexe.h`'s `Object::flag_type`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LeObjectFlags: u32 {
        const READABLE = 0x0001;
        const WRITABLE = 0x0002;
        const EXECUTABLE = 0x0004;
        const RESOURCE = 0x0008;
        const DISCARDABLE = 0x0010;
        const SHARED = 0x0020;
        const PRELOAD_PAGES = 0x0040;
        const ZERO_FILLED_PAGES = 0x0100;
        const BIG_SEGMENT = 0x2000;
    }
}

/// `leexe.h`'s `Page::page_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LePageType {
    Preload = 0,
    ZeroFilled = 3,
}

/// `leexe.h`'s `Page::Relocation::source_type` (the subset this writer
/// emits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeRelocationSourceType {
    Offset16 = 5,
    Offset32 = 7,
    Selector16 = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeRelocationFlagType {
    Internal = 0,
    ImportOrdinal = 1,
    ImportName = 2,
}

#[derive(Debug, Clone)]
struct LeFixup {
    /// Offset within the page.
    page_offset: u16,
    source_type: LeRelocationSourceType,
    flag_type: LeRelocationFlagType,
    /// Object number (`Internal`) or module table index (`Import*`), both
    /// one-based the way `leexe.h` stores them.
    module_or_object: u16,
    /// In-object target offset (`Internal`) or ordinal/name-table offset
    /// (`Import*`).
    target: u32,
}

/// The LE/LX output plugin.
#[derive(Debug, Clone)]
pub struct LeFormat {
    pub is_lx: bool,
    page_size: OptionField<u64>,
    stack_size: OptionField<u64>,
    page_size_resolved: u64,
    stack_size_resolved: u64,

    entry_object: u16,
    entry_offset: u32,
    stack_object: u16,
    stack_offset: u32,
}

impl Default for LeFormat {
    fn default() -> Self {
        LeFormat {
            is_lx: true,
            page_size: OptionField::new("page_size", "Page size for object splitting", DEFAULT_PAGE_SIZE),
            stack_size: OptionField::new("stack", "Specify the stack size", 0x1000),
            page_size_resolved: DEFAULT_PAGE_SIZE,
            stack_size_resolved: 0x1000,
            entry_object: 0,
            entry_offset: 0,
            stack_object: 0,
            stack_offset: 0,
        }
    }
}

impl LeFormat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn le() -> Self {
        LeFormat {
            is_lx: false,
            ..Self::default()
        }
    }

    fn object_flags(&self, section: &crate::section::Section) -> LeObjectFlags {
        let mut flags = LeObjectFlags::empty();
        if section.is_executable() {
            flags |= LeObjectFlags::READABLE | LeObjectFlags::EXECUTABLE;
        } else {
            flags |= LeObjectFlags::READABLE;
        }
        if section.is_writable() {
            flags |= LeObjectFlags::WRITABLE;
        }
        if section.is_zero_filled() {
            flags |= LeObjectFlags::ZERO_FILLED_PAGES;
        }
        flags
    }

    fn le_object_number(&self, module: &Module, section: SectionIndex) -> Option<u16> {
        let segment = module.section(section)?.segment?;
        Some((segment.0 + 1) as u16)
    }
}

impl SegmentSink for LeFormat {
    fn on_new_segment(&mut self, _module: &Module, _segment: &LinkSegment, _index: crate::common::SegmentIndex) {}
}

/// One object's page table entries, plus the concatenated bytes of every
/// page that isn't purely zero-filled.
struct ObjectPages {
    /// `(page_type, fixup_first_index)` per page, filled in once fixups are
    /// assigned below.
    page_types: Vec<LePageType>,
    page_bytes: Vec<Vec<u8>>,
    /// Fixups per page index within this object.
    fixups: Vec<Vec<LeFixup>>,
}

fn split_into_pages(section: &crate::section::Section, page_size: u64) -> ObjectPages {
    let footprint = section.footprint();
    let page_count = footprint.div_ceil(page_size.max(1)).max(1) as usize;
    let mut page_types = Vec::with_capacity(page_count);
    let mut page_bytes = Vec::with_capacity(page_count);
    let data_len = section.size();
    for i in 0..page_count {
        let start = i as u64 * page_size;
        let end = (start + page_size).min(footprint);
        if start >= data_len {
            page_types.push(LePageType::ZeroFilled);
            page_bytes.push(Vec::new());
        } else {
            let mut w = crate::io::MemoryWriter::new();
            section.write_to(&mut w, start, end - start);
            page_types.push(LePageType::Preload);
            page_bytes.push(w.into_bytes());
        }
    }
    ObjectPages {
        page_types,
        fixups: alloc::vec![Vec::new(); page_count],
        page_bytes,
    }
}

/// Flat name table shared between the module-reference and
/// imported-procedure-name tables, mirroring NE's (spec.md §4.7 applies the
/// same entry-table/name-table shape to every movable-segment format).
struct NameTable {
    bytes: Vec<u8>,
    offsets: BTreeMap<String, u32>,
}

impl NameTable {
    fn new() -> Self {
        NameTable {
            bytes: alloc::vec![0u8],
            offsets: BTreeMap::new(),
        }
    }

    fn intern(&mut self, name: &str) -> u32 {
        if let Some(&off) = self.offsets.get(name) {
            return off;
        }
        let off = self.bytes.len() as u32;
        self.bytes.push(name.len() as u8);
        self.bytes.extend_from_slice(name.as_bytes());
        self.offsets.insert(name.to_string(), off);
        off
    }
}

impl OutputFormat for LeFormat {
    fn set_options(&mut self, options: &OptionMap) -> Result<()> {
        self.page_size_resolved = self.page_size.resolve(options)?.max(1);
        self.stack_size_resolved = self.stack_size.resolve(options)?;
        Ok(())
    }

    fn get_options(&self) -> OptionCollector {
        OptionCollector::new()
            .with_field(self.page_size.name, self.page_size.help)
            .with_field(self.stack_size.name, self.stack_size.help)
    }

    fn default_script(&self, _module: &Module) -> Script {
        script::parse("for any { all any; };").expect("built-in LE default script must parse")
    }

    fn additional_section_flags(&self, name: &str) -> SectionFlags {
        match name {
            ".stack" => SectionFlags::STACK,
            ".heap" => SectionFlags::HEAP,
            _ => SectionFlags::NONE,
        }
    }

    fn supports_segmentation(&self) -> bool {
        true
    }

    fn is_16bit(&self) -> bool {
        false
    }

    fn is_protected_mode(&self) -> bool {
        true
    }

    fn supports_libraries(&self) -> bool {
        true
    }

    fn calculate_values(&mut self, module: &Module) -> Result<()> {
        if let Some(loc) = module.global_symbols.get("_start") {
            self.entry_object = self.le_object_number(module, loc.section).unwrap_or(1);
            self.entry_offset = loc.offset as u32;
        } else {
            self.entry_object = 1;
        }
        if let Some(idx) = module.section_by_name(".stack") {
            self.stack_object = self.le_object_number(module, idx).unwrap_or(1);
            self.stack_offset = module.section(idx).map(|s| s.footprint() as u32).unwrap_or(0);
        }
        Ok(())
    }

    fn write_file(&self, module: &Module, writer: &mut dyn Writer) -> Result<()> {
        let page_size = self.page_size_resolved;
        let sections: Vec<(SectionIndex, &crate::section::Section)> = module.sections().collect();

        let mut object_pages: Vec<ObjectPages> = sections
            .iter()
            .map(|(_, s)| split_into_pages(s, page_size))
            .collect();

        let mut names = NameTable::new();
        let mut modules: Vec<String> = Vec::new();
        let mut module_index: BTreeMap<String, u16> = BTreeMap::new();

        for reloc in &module.relocations {
            let (object_index_in_list, obj_no) = match self.le_object_number(module, reloc.source.section) {
                Some(n) => (reloc.source.section.0, n),
                None => {
                    diag_warn!("le", "relocation source section was never placed, skipped");
                    continue;
                }
            };
            let _ = obj_no;
            let source_type = match (reloc.size, reloc.kind) {
                (2, RelocationKind::SelectorIndex) => LeRelocationSourceType::Selector16,
                (2, _) => LeRelocationSourceType::Offset16,
                (4, _) => LeRelocationSourceType::Offset32,
                _ => {
                    diag_warn!("le", "relocation size {} has no LE encoding, skipped", reloc.size);
                    continue;
                }
            };

            let (flag_type, module_field, target_field) = match &reloc.target {
                Target::Symbol(SymbolName::ImportedByOrdinal(lib, ordinal)) => {
                    let idx = *module_index.entry(lib.clone()).or_insert_with(|| {
                        names.intern(lib);
                        modules.push(lib.clone());
                        modules.len() as u16
                    });
                    (LeRelocationFlagType::ImportOrdinal, idx, *ordinal)
                }
                Target::Symbol(SymbolName::ImportedByName(lib, name, _)) => {
                    let idx = *module_index.entry(lib.clone()).or_insert_with(|| {
                        names.intern(lib);
                        modules.push(lib.clone());
                        modules.len() as u16
                    });
                    let off = names.intern(name);
                    (LeRelocationFlagType::ImportName, idx, off)
                }
                Target::Location(loc) => {
                    let Some(target_obj) = self.le_object_number(module, loc.section) else {
                        diag_warn!("le", "relocation target was never placed, skipped");
                        continue;
                    };
                    (LeRelocationFlagType::Internal, target_obj, loc.offset as u32)
                }
                _ => {
                    diag_warn!("le", "relocation target has no LE encoding, skipped");
                    continue;
                }
            };

            let source_section = module.section(reloc.source.section).ok_or(Error("relocation names an unknown section"))?;
            let offset = reloc.source.offset;
            let page_index = (offset / page_size) as usize;
            let page_offset = (offset % page_size) as u16;
            if page_index >= object_pages[object_index_in_list].fixups.len() {
                diag_warn!("le", "relocation offset past its object's page table, skipped");
                continue;
            }
            let _ = source_section;
            object_pages[object_index_in_list].fixups[page_index].push(LeFixup {
                page_offset,
                source_type,
                flag_type,
                module_or_object: module_field,
                target: target_field,
            });
        }

        // Object table: one entry per section-as-object, in module order
        // (spec.md §5 "`OnNewSegment` calls arrive in script-declaration
        // order" — for LE's `for any { all any; }` default script this
        // coincides with section order).
        let object_count = sections.len() as u64;
        let mut total_pages = 0u64;
        let mut page_counts = Vec::with_capacity(sections.len());
        for pages in &object_pages {
            page_counts.push(pages.page_types.len() as u32);
            total_pages += pages.page_types.len() as u64;
        }

        let object_table_offset = HEADER_SIZE;
        let object_table_size = object_count * 24;
        let page_table_offset = object_table_offset + object_table_size;
        // One extra sentinel entry terminates the page table (spec.md §8
        // boundary case: "fixup page table has three entries (pages+1)").
        let page_table_size = (total_pages + 1) * 4;
        let resident_names_offset = page_table_offset + page_table_size;
        let resident_names = alloc::vec![0u8, 0u8];
        let module_ref_table_offset = resident_names_offset + resident_names.len() as u64;
        let module_ref_table_size = modules.len() as u64 * 2;
        let imported_names_offset = module_ref_table_offset + module_ref_table_size;
        let header_end = imported_names_offset + names.bytes.len() as u64;

        let mut data_pages_offset = align_up(header_end, page_size);
        let mut object_records: Vec<(u32, u32, LeObjectFlags, u32, u32)> = Vec::new();
        let mut fixup_page_offsets: Vec<u32> = Vec::new();
        let mut fixup_records: Vec<u8> = Vec::new();
        let mut running_data_offset = data_pages_offset;
        let mut page_table_entries: Vec<(u32, u16)> = Vec::new(); // (data_pages_offset_in_pages, type)

        for ((index, section), pages) in sections.iter().zip(object_pages.iter()) {
            let first_page_index = page_table_entries.len() as u32 + 1;
            object_records.push((
                section.footprint() as u32,
                0, // relocation base address: resolved separately by the segment manager
                self.object_flags(section),
                first_page_index,
                page_counts[index.0],
            ));
            for (page_idx, page_type) in pages.page_types.iter().enumerate() {
                let page_data_offset = (running_data_offset / page_size) as u32;
                page_table_entries.push((page_data_offset, *page_type as u16));
                running_data_offset += page_size;

                fixup_page_offsets.push(fixup_records.len() as u32);
                for fixup in &pages.fixups[page_idx] {
                    fixup_records.push(fixup.source_type as u8);
                    fixup_records.push(fixup.flag_type as u8);
                    fixup_records.extend_from_slice(&fixup.page_offset.to_le_bytes());
                    fixup_records.extend_from_slice(&fixup.module_or_object.to_le_bytes());
                    match fixup.flag_type {
                        LeRelocationFlagType::Internal => {
                            fixup_records.extend_from_slice(&fixup.target.to_le_bytes());
                        }
                        LeRelocationFlagType::ImportOrdinal => {
                            fixup_records.extend_from_slice(&(fixup.target as u16).to_le_bytes());
                        }
                        LeRelocationFlagType::ImportName => {
                            fixup_records.extend_from_slice(&fixup.target.to_le_bytes());
                        }
                    }
                }
            }
        }
        fixup_page_offsets.push(fixup_records.len() as u32); // sentinel terminator
        data_pages_offset = align_up(header_end, page_size);

        writer.seek(0);
        writer.write_data(if self.is_lx { b"LX" } else { b"LE" });
        writer.write_data(&[0, 0]); // byte order / word order: both little-endian
        writer.write_word(4, 0, Default::default()); // format level
        writer.write_word(2, 2, Default::default()); // CPU type: 80386
        writer.write_word(2, 1, Default::default()); // OS type: OS/2
        writer.write_word(4, 0, Default::default()); // module version
        writer.write_word(4, 0x2000, Default::default()); // module flags: DLL initialization not required
        writer.write_word(4, total_pages, Default::default()); // page count
        writer.write_word(4, self.entry_object as u64, Default::default()); // EIP object
        writer.write_word(4, self.entry_offset as u64, Default::default()); // EIP
        writer.write_word(4, self.stack_object as u64, Default::default()); // ESP object
        writer.write_word(4, self.stack_offset as u64, Default::default()); // ESP
        writer.write_word(4, page_size, Default::default()); // page size
        writer.write_word(4, 0, Default::default()); // page offset shift (LX: log2 not applied here, file offsets stored directly)
        let fixup_section_size = fixup_page_offsets.len() as u64 * 4 + fixup_records.len() as u64;
        writer.write_word(4, fixup_section_size, Default::default()); // fixup section size (page table + records)
        writer.write_word(4, 0, Default::default()); // fixup page table checksum: unused
        writer.write_word(4, object_count, Default::default()); // object count
        writer.write_word(4, object_table_offset, Default::default());
        writer.write_word(4, page_table_offset, Default::default());
        writer.write_word(4, 0, Default::default()); // object iterated data map offset: unused
        writer.write_word(4, resident_names_offset, Default::default()); // reused for resource table offset (empty)
        writer.write_word(4, resident_names_offset, Default::default());
        writer.write_word(4, 0, Default::default()); // entry table offset placeholder (LX has a separate Entry structure; relocations only use the object table here)
        writer.write_word(4, module_ref_table_offset, Default::default());
        writer.write_word(4, module_ref_table_offset, Default::default());
        writer.write_word(4, imported_names_offset, Default::default());
        writer.write_word(4, imported_names_offset, Default::default());
        writer.write_word(4, page_table_offset + page_table_size, Default::default()); // fixup page table offset
        writer.write_word(4, page_table_offset + page_table_size + fixup_page_offsets.len() as u64 * 4, Default::default());
        writer.write_word(4, 0, Default::default()); // import module name table offset: folded into module_ref_table above
        writer.write_word(4, modules.len() as u64, Default::default());
        writer.write_word(4, 0, Default::default()); // per-page checksum table offset: unused
        writer.write_word(4, data_pages_offset, Default::default());
        writer.write_word(4, 0, Default::default()); // preload page count
        writer.write_word(4, 0, Default::default()); // non-resident names offset: unused
        writer.write_word(4, 0, Default::default()); // non-resident names length
        writer.write_word(4, 0, Default::default()); // non-resident names checksum
        writer.write_word(4, 0, Default::default()); // auto data segment object
        writer.write_word(4, 0, Default::default()); // debug info offset
        writer.write_word(4, 0, Default::default()); // debug info length
        writer.write_word(4, 0, Default::default()); // instance preload page count
        writer.write_word(4, 0, Default::default()); // instance demand page count
        writer.write_word(4, 0, Default::default()); // heap size

        writer.fill_to(object_table_offset);
        for (size, base, flags, first_page, page_count) in &object_records {
            writer.write_word(4, *size as u64, Default::default());
            writer.write_word(4, *base as u64, Default::default());
            writer.write_word(4, flags.bits() as u64, Default::default());
            writer.write_word(4, *first_page as u64, Default::default());
            writer.write_word(4, *page_count as u64, Default::default());
            writer.write_word(4, 0, Default::default()); // reserved
        }

        writer.fill_to(page_table_offset);
        for (data_offset, page_type) in &page_table_entries {
            writer.write_word(4, *data_offset as u64, Default::default());
            writer.write_data(&[0, 0]); // per-page checksum/flags: unused
            writer.write_word(2, *page_type as u64, Default::default());
        }

        writer.fill_to(resident_names_offset);
        writer.write_data(&resident_names);
        writer.fill_to(module_ref_table_offset);
        for name in &modules {
            let off = *names.offsets.get(name).unwrap_or(&0);
            writer.write_word(2, off as u64, Default::default());
        }
        writer.fill_to(imported_names_offset);
        writer.write_data(&names.bytes);

        writer.fill_to(page_table_offset + page_table_size);
        for off in &fixup_page_offsets {
            writer.write_word(4, *off as u64, Default::default());
        }
        writer.write_data(&fixup_records);

        writer.fill_to(data_pages_offset);
        for pages in &object_pages {
            for (page_type, bytes) in pages.page_types.iter().zip(pages.page_bytes.iter()) {
                match page_type {
                    LePageType::Preload => {
                        writer.write_data(bytes);
                        writer.skip(page_size - bytes.len() as u64);
                    }
                    LePageType::ZeroFilled => writer.skip(page_size),
                }
            }
        }

        Ok(())
    }

    fn dump(&self, module: &Module) -> Report {
        let mut region = Region::new("objects", HEADER_SIZE, 0);
        for (index, section) in module.sections() {
            let pages = split_into_pages(section, self.page_size_resolved.max(DEFAULT_PAGE_SIZE.min(1).max(1)));
            region = region.block(
                Block::new(format!("object[{}]", index.0 + 1), 0, section.footprint())
                    .field("name", section.name.clone())
                    .field("flags", self.object_flags(section).bits() as u64)
                    .field("page_count", pages.page_types.len() as u64),
            );
        }
        Report::new(if self.is_lx { "lx" } else { "le" }).region(region)
    }

    fn default_extension(&self) -> &'static str {
        "exe"
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
    use crate::image::Buffer;
    use crate::io::MemoryWriter;
    use crate::section::Section;

    /// spec.md §8 scenario 3: one `.code` object of 0x1800 bytes, page size
    /// 0x1000 -> two pages, both `Preload`, second page's physical size is
    /// 0x800, and the fixup page table has `pages + 1 = 3` entries.
    #[test]
    fn page_split_produces_two_pages() {
        let mut module = Module::new();
        module.add_section(
            Section::new(".code", SectionFlags::EXECUTABLE)
                .with_data(Buffer::from_bytes(alloc::vec![0x90u8; 0x1800])),
        );
        let mut fmt = LeFormat::new();
        fmt.set_options(&OptionMap::new()).unwrap();
        let script = fmt.default_script(&module);
        let params = script::Parameters::new();
        crate::segment::apply_script(&mut module, &script, &params, &mut fmt).unwrap();
        fmt.calculate_values(&module).unwrap();

        let section = module.section(SectionIndex(0)).unwrap();
        let pages = split_into_pages(section, DEFAULT_PAGE_SIZE);
        assert_eq!(pages.page_types.len(), 2);
        assert_eq!(pages.page_bytes[0].len(), 0x1000);
        assert_eq!(pages.page_bytes[1].len(), 0x800);
        assert!(pages.page_types.iter().all(|t| matches!(t, LePageType::Preload)));
    }

    #[test]
    fn writes_lx_signature() {
        let mut module = Module::new();
        module.add_section(Section::new(".code", SectionFlags::EXECUTABLE).with_data(Buffer::from_bytes(alloc::vec![0u8; 0x10])));
        let mut fmt = LeFormat::new();
        fmt.set_options(&OptionMap::new()).unwrap();
        let script = fmt.default_script(&module);
        let params = script::Parameters::new();
        crate::segment::apply_script(&mut module, &script, &params, &mut fmt).unwrap();
        fmt.calculate_values(&module).unwrap();
        let mut writer = MemoryWriter::new();
        fmt.write_file(&module, &mut writer).unwrap();
        assert_eq!(&writer.as_bytes()[0..2], b"LX");
    }

    /// The `e32_fixupsize` header field (offset 0x30, right before the
    /// unused fixup checksum) must report the real byte length of the
    /// fixup page table plus fixup record table, not a computed-then-
    /// discarded placeholder.
    #[test]
    fn fixup_section_size_reflects_actual_fixup_bytes() {
        use crate::relocation::{Relocation, RelocationKind};
        use crate::symbol::{Location, Target};

        let mut module = Module::new();
        let code = module.add_section(
            Section::new(".code", SectionFlags::EXECUTABLE).with_data(Buffer::from_bytes(alloc::vec![0u8; 0x10])),
        );
        module.add_relocation(Relocation::new(
            Location::new(code, 0),
            Target::Location(Location::new(code, 4)),
            RelocationKind::Direct,
            4,
        ));

        let mut fmt = LeFormat::new();
        fmt.set_options(&OptionMap::new()).unwrap();
        let script = fmt.default_script(&module);
        let params = script::Parameters::new();
        crate::segment::apply_script(&mut module, &script, &params, &mut fmt).unwrap();
        fmt.calculate_values(&module).unwrap();
        let mut writer = MemoryWriter::new();
        fmt.write_file(&module, &mut writer).unwrap();

        let bytes = writer.as_bytes();
        // One page, one internal 32-bit fixup: fixup_page_offsets = [0, 10]
        // (one entry per page plus the sentinel) and fixup_records is the
        // single 10-byte record (1 + 1 + 2 + 2 + 4), so the field must read
        // 2*4 + 10 = 18, never 0.
        let fixup_section_size = u32::from_le_bytes(bytes[0x30..0x34].try_into().unwrap());
        assert_eq!(fixup_section_size, 18);
    }
}
