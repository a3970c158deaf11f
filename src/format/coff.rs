//! COFF (Common Object File Format) object/image output (spec.md §6), the
//! base container the `pe` plugin's optional header builds on top of
//! (spec.md §9 Open Questions: "the PE writer ... only requires what the
//! base COFF plus PE optional header code covers").
//!
//! Not directly modeled in `examples/original_source/` (its COFF support
//! lives only behind the PE front end), so this module is grounded instead
//! in the public Microsoft/System V COFF section-header/relocation-entry
//! layout, written in the same style this crate's other format plugins use:
//! a flat file header, a section-header table, section bodies, and a
//! symbol table with its attached string table.

use crate::common::{Cpu, SectionFlags, SectionIndex};
use crate::diagnostics::diag_warn;
use crate::dump::{Block, Region, Report};
use crate::error::Result;
use crate::image::Image;
use crate::io::Writer;
use crate::module::Module;
use crate::relocation::RelocationKind;
use crate::script::{self, Script};
use crate::segment::{Segment as LinkSegment, SegmentSink};
use crate::symbol::Target;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use super::options::{OptionCollector, OptionField, OptionMap};
use super::OutputFormat;

pub const FILE_HEADER_SIZE: u64 = 20;
pub const SECTION_HEADER_SIZE: u64 = 40;
pub const SYMBOL_SIZE: u64 = 18;
pub const RELOCATION_SIZE: u64 = 10;

/// `IMAGE_FILE_MACHINE_*`/classic a.out COFF machine values this plugin
/// knows how to pick from a [`Cpu`].
fn machine_for_cpu(cpu: Option<Cpu>) -> u16 {
    match cpu {
        Some(Cpu::I386) => 0x014C,
        Some(Cpu::X86_64) => 0x8664,
        Some(Cpu::M68K) => 0x0150,
        Some(Cpu::Arm) => 0x01C0,
        Some(Cpu::Mips) => 0x0162,
        _ => 0x014C,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum I386RelocationType {
    Dir32 = 0x0006,
    Rel32 = 0x0014,
}

/// The COFF output plugin: emits a relinkable/loadable i386 COFF object or
/// image (no optional header — that's `pe`'s job).
#[derive(Debug, Clone, Default)]
pub struct CoffFormat {
    strip_symbols: OptionField<bool>,
    strip_symbols_resolved: bool,
}

impl CoffFormat {
    pub fn new() -> Self {
        CoffFormat {
            strip_symbols: OptionField::new("strip", "Omit the symbol table", false),
            strip_symbols_resolved: false,
        }
    }

    fn section_flags_word(&self, flags: SectionFlags) -> u32 {
        let mut word = 0u32;
        if flags.contains(SectionFlags::EXECUTABLE) {
            word |= 0x0000_0020; // STYP_TEXT
        }
        if flags.contains(SectionFlags::WRITABLE) && !flags.contains(SectionFlags::EXECUTABLE) {
            word |= 0x0000_0040; // STYP_DATA
        }
        if flags.contains(SectionFlags::ZERO_FILLED) {
            word |= 0x0000_0080; // STYP_BSS
        }
        word
    }
}

impl SegmentSink for CoffFormat {
    fn on_new_segment(&mut self, _module: &Module, _segment: &LinkSegment, _index: crate::common::SegmentIndex) {}
}

impl OutputFormat for CoffFormat {
    fn set_options(&mut self, options: &OptionMap) -> Result<()> {
        self.strip_symbols_resolved = self.strip_symbols.resolve(options)?;
        Ok(())
    }

    fn get_options(&self) -> OptionCollector {
        OptionCollector::new().with_field(self.strip_symbols.name, self.strip_symbols.help)
    }

    fn default_script(&self, _module: &Module) -> Script {
        // One segment per section: COFF has no segmentation model of its
        // own, every section keeps its own base (spec.md §4.6
        // `FormatSupportsSegmentation` -> false below).
        script::parse("for any { all any; };").expect("built-in COFF default script must parse")
    }

    fn additional_section_flags(&self, _name: &str) -> SectionFlags {
        SectionFlags::NONE
    }

    fn supports_segmentation(&self) -> bool {
        false
    }

    fn is_16bit(&self) -> bool {
        false
    }

    fn is_protected_mode(&self) -> bool {
        true
    }

    fn supports_libraries(&self) -> bool {
        false
    }

    fn calculate_values(&mut self, _module: &Module) -> Result<()> {
        Ok(())
    }

    fn write_file(&self, module: &Module, writer: &mut dyn Writer) -> Result<()> {
        let sections: Vec<(SectionIndex, &crate::section::Section)> = module.sections().collect();
        let machine = machine_for_cpu(module.cpu);

        let header_end = FILE_HEADER_SIZE + sections.len() as u64 * SECTION_HEADER_SIZE;
        let mut data_offsets = Vec::with_capacity(sections.len());
        let mut cursor = header_end;
        for (_, section) in &sections {
            data_offsets.push(cursor);
            if !section.is_zero_filled() {
                cursor += section.size();
            }
        }

        // One symbol per section (`IMAGE_SYM_CLASS_STATIC`, storage class 3),
        // plus one per defined global (spec.md §4.7's "every
        // `ExportedByName` goes into a resident-name-style table" applies
        // loosely here: COFF's equivalent is an `IMAGE_SYM_CLASS_EXTERNAL`,
        // storage class 2, entry).
        let mut symbol_records: Vec<(String, u16, u32, u16)> = Vec::new(); // (name, section_number, value, storage_class)
        for (index, (_, section)) in sections.iter().enumerate() {
            symbol_records.push((section.name.clone(), (index + 1) as u16, 0, 3));
        }
        if !self.strip_symbols_resolved {
            for (name, loc) in &module.global_symbols {
                let section_number = sections
                    .iter()
                    .position(|(i, _)| *i == loc.section)
                    .map(|i| (i + 1) as u16)
                    .unwrap_or(0);
                symbol_records.push((name.clone(), section_number, loc.offset as u32, 2));
            }
        }

        // Names over 8 bytes spill into the string table, addressed by a
        // 4-byte offset with the first 4 zero (classic COFF convention);
        // the table's own length prefix occupies those first 4 bytes.
        let mut string_offsets: BTreeMap<String, u32> = BTreeMap::new();
        let mut strings = alloc::vec![0u8; 4];
        for (name, _, _, _) in &symbol_records {
            if name.len() > 8 && !string_offsets.contains_key(name) {
                string_offsets.insert(name.clone(), strings.len() as u32);
                strings.extend_from_slice(name.as_bytes());
                strings.push(0);
            }
        }
        let total_len = strings.len() as u32;
        strings[0..4].copy_from_slice(&total_len.to_le_bytes());

        // Relocations, grouped per section (spec.md §5 relocation
        // resolution order equals insertion order; COFF records preserve
        // that by walking `module.relocations` once per section in the
        // same pass).
        let mut per_section_relocs: BTreeMap<SectionIndex, Vec<(u32, u32, I386RelocationType)>> = BTreeMap::new();
        for reloc in &module.relocations {
            let rel_type = match (reloc.size, reloc.kind) {
                (4, RelocationKind::Direct) if reloc.is_relative() => I386RelocationType::Rel32,
                (4, RelocationKind::Direct) => I386RelocationType::Dir32,
                _ => {
                    diag_warn!("coff", "relocation kind/size {:?}/{} has no COFF encoding, skipped", reloc.kind, reloc.size);
                    continue;
                }
            };
            let symbol_index = match &reloc.target {
                Target::Location(loc) => sections.iter().position(|(i, _)| *i == loc.section).map(|i| i as u32),
                _ => {
                    diag_warn!("coff", "relocation target has no COFF symbol encoding, skipped");
                    continue;
                }
            };
            let Some(symbol_index) = symbol_index else { continue };
            per_section_relocs
                .entry(reloc.source.section)
                .or_default()
                .push((reloc.source.offset as u32, symbol_index, rel_type));
        }

        let mut reloc_offsets = Vec::with_capacity(sections.len());
        let mut symtab_cursor = cursor;
        for (_, relocs) in sections.iter().map(|(i, _)| (i, per_section_relocs.get(i))) {
            reloc_offsets.push(symtab_cursor);
            if let Some(rs) = relocs {
                symtab_cursor += rs.len() as u64 * RELOCATION_SIZE;
            }
        }
        let symbol_table_offset = symtab_cursor;

        writer.seek(0);
        writer.write_word(2, machine as u64, Default::default());
        writer.write_word(2, sections.len() as u64, Default::default());
        writer.write_word(4, 0, Default::default()); // timestamp
        writer.write_word(4, symbol_table_offset, Default::default());
        writer.write_word(4, symbol_records.len() as u64, Default::default());
        writer.write_word(2, 0, Default::default()); // optional header size: none (plain COFF)
        writer.write_word(2, 0, Default::default()); // characteristics

        for ((index, section), (&data_offset, &reloc_offset)) in sections.iter().zip(data_offsets.iter().zip(reloc_offsets.iter())) {
            let mut name_bytes = [0u8; 8];
            let raw = section.name.as_bytes();
            let n = raw.len().min(8);
            name_bytes[..n].copy_from_slice(&raw[..n]);
            writer.write_data(&name_bytes);
            writer.write_word(4, 0, Default::default()); // physical address / virtual size
            writer.write_word(4, 0, Default::default()); // virtual address: assigned by a loader, not this writer
            writer.write_word(4, if section.is_zero_filled() { 0 } else { section.size() }, Default::default());
            writer.write_word(4, if section.is_zero_filled() { 0 } else { data_offset }, Default::default());
            writer.write_word(4, reloc_offset, Default::default());
            writer.write_word(4, 0, Default::default()); // line-number table offset: unused
            let reloc_count = per_section_relocs.get(index).map(|r| r.len()).unwrap_or(0);
            writer.write_word(2, reloc_count as u64, Default::default());
            writer.write_word(2, 0, Default::default()); // line-number count: unused
            writer.write_word(4, self.section_flags_word(section.flags) as u64, Default::default());
        }

        for (_, section) in &sections {
            if !section.is_zero_filled() {
                section.write_to(writer, 0, section.size());
            }
        }

        for (index, _) in &sections {
            if let Some(relocs) = per_section_relocs.get(index) {
                for (offset, symbol_index, rel_type) in relocs {
                    writer.write_word(4, *offset as u64, Default::default());
                    writer.write_word(4, *symbol_index as u64, Default::default());
                    writer.write_word(2, *rel_type as u64, Default::default());
                }
            }
        }

        for (name, section_number, value, storage_class) in &symbol_records {
            if name.len() > 8 {
                writer.write_word(4, 0, Default::default());
                writer.write_word(4, *string_offsets.get(name).unwrap_or(&0) as u64, Default::default());
            } else {
                let mut name_bytes = [0u8; 8];
                let raw = name.as_bytes();
                name_bytes[..raw.len()].copy_from_slice(raw);
                writer.write_data(&name_bytes);
            }
            writer.write_word(4, *value as u64, Default::default());
            writer.write_word(2, *section_number as u64, Default::default());
            writer.write_word(2, 0, Default::default()); // type: notype
            writer.write_data(&[*storage_class as u8]);
            writer.write_data(&[0]); // no auxiliary entries
        }

        writer.write_data(&strings);

        Ok(())
    }

    fn dump(&self, module: &Module) -> Report {
        let mut region = Region::new("sections", FILE_HEADER_SIZE, 0);
        for (index, section) in module.sections() {
            region = region.block(
                Block::new(format!("section[{}]", index.0), 0, section.footprint())
                    .field("name", section.name.clone())
                    .field("flags", self.section_flags_word(section.flags) as u64),
            );
        }
        Report::new("coff").region(region)
    }

    fn default_extension(&self) -> &'static str {
        "o"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SectionFlags;
    use crate::image::Buffer;
    use crate::io::MemoryWriter;
    use crate::section::Section;

    #[test]
    fn writes_expected_machine_and_section_count() {
        let mut module = Module::new();
        module.cpu = Some(Cpu::I386);
        module.add_section(Section::new(".text", SectionFlags::EXECUTABLE).with_data(Buffer::from_bytes(alloc::vec![0x90; 16])));
        module.add_section(Section::new(".data", SectionFlags::WRITABLE).with_data(Buffer::from_bytes(alloc::vec![1, 2, 3, 4])));

        let mut fmt = CoffFormat::new();
        fmt.set_options(&OptionMap::new()).unwrap();
        let script = fmt.default_script(&module);
        let params = script::Parameters::new();
        crate::segment::apply_script(&mut module, &script, &params, &mut fmt).unwrap();
        fmt.calculate_values(&module).unwrap();

        let mut writer = MemoryWriter::new();
        fmt.write_file(&module, &mut writer).unwrap();
        let bytes = writer.into_bytes();
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), 0x014C);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 2);
    }

    #[test]
    fn long_section_names_go_through_the_string_table() {
        let mut module = Module::new();
        module.add_section(
            Section::new(".a_very_long_section_name", SectionFlags::WRITABLE)
                .with_data(Buffer::from_bytes(alloc::vec![0u8; 4])),
        );
        let mut fmt = CoffFormat::new();
        fmt.set_options(&OptionMap::new()).unwrap();
        let script = fmt.default_script(&module);
        let params = script::Parameters::new();
        crate::segment::apply_script(&mut module, &script, &params, &mut fmt).unwrap();
        fmt.calculate_values(&module).unwrap();
        let mut writer = MemoryWriter::new();
        fmt.write_file(&module, &mut writer).unwrap();
        let bytes = writer.into_bytes();
        assert!(bytes.windows(b".a_very_long_section_name".len()).any(|w| w == b".a_very_long_section_name"));
    }
}
