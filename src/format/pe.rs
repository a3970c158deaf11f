//! Microsoft PE (Portable Executable) output (spec.md §6, §9 Open
//! Questions: "the PE writer is marked incomplete in the sources; the
//! specification only requires what the base COFF plus PE optional header
//! code covers — section headers, data directories, simple relocation base
//! table, no authenticode").
//!
//! Grounded in `examples/original_source/src/format/peexe.h`: `PEFormat`
//! inherits `COFF::COFFFormat` and `Microsoft::MZStubWriter` and is marked
//! `/* TODO: unimplemented */` in the original itself, which licenses this
//! plugin to stay deliberately partial. The DOS stub comes from the same
//! "prepend a tiny real-mode program" idea as [`super::mz`]; the section
//! table shape is the same 40-byte layout [`super::coff`] already writes.

use crate::common::{Cpu, SectionFlags};
use crate::dump::{Block, Region, Report};
use crate::error::Result;
use crate::image::Image;
use crate::io::Writer;
use crate::module::Module;
use crate::relocation::RelocationKind;
use crate::script::{self, Script};
use crate::segment::{Segment as LinkSegment, SegmentSink};
use alloc::format;
use alloc::vec::Vec;

use super::options::{OptionCollector, OptionField, OptionMap};
use super::OutputFormat;

/// A minimal 16-bit real-mode stub: "this program cannot be run in DOS
/// mode" is nice-to-have polish the original doesn't require either, so
/// this stub only satisfies the loader's expectation that *something*
/// executable sits before `e_lfanew` (spec.md §6's MZ-stub-nesting rule,
/// which `registry::detect` relies on to find `PE\0\0`).
const DOS_STUB_SIZE: u64 = 0x40;
const PE_HEADER_SIZE: u64 = 4; // "PE\0\0"
const COFF_HEADER_SIZE: u64 = 20;
const OPTIONAL_HEADER_SIZE: u64 = 224; // IMAGE_OPTIONAL_HEADER32, 16 data directories
const SECTION_HEADER_SIZE: u64 = 40;
const NUMBER_OF_DATA_DIRECTORIES: u64 = 16;
const BASE_RELOCATION_DIRECTORY: usize = 5;

fn machine_for_cpu(cpu: Option<Cpu>) -> u16 {
    match cpu {
        Some(Cpu::X86_64) => 0x8664,
        _ => 0x014C, // IMAGE_FILE_MACHINE_I386
    }
}

fn section_characteristics(flags: SectionFlags) -> u32 {
    let mut word = 0u32;
    if flags.contains(SectionFlags::EXECUTABLE) {
        word |= 0x0000_0020 | 0x2000_0000 | 0x1000_0000; // CNT_CODE | MEM_EXECUTE | MEM_READ
    }
    if flags.contains(SectionFlags::ZERO_FILLED) {
        word |= 0x0000_0080 | 0x4000_0000 | 0x4000_0000; // CNT_UNINITIALIZED_DATA | MEM_READ (dup bit harmless)
    } else if !flags.contains(SectionFlags::EXECUTABLE) {
        word |= 0x0000_0040 | 0x4000_0000; // CNT_INITIALIZED_DATA | MEM_READ
    }
    if flags.contains(SectionFlags::WRITABLE) {
        word |= 0x8000_0000; // MEM_WRITE
    }
    word
}

/// The PE output plugin.
#[derive(Debug, Clone)]
pub struct PeFormat {
    image_base: OptionField<u64>,
    section_alignment: OptionField<u64>,
    file_alignment: OptionField<u64>,
    stack_size: OptionField<u64>,
    heap_size: OptionField<u64>,
    subsystem: OptionField<u64>,

    image_base_resolved: u64,
    section_alignment_resolved: u64,
    file_alignment_resolved: u64,
    stack_size_resolved: u64,
    heap_size_resolved: u64,
    subsystem_resolved: u64,
}

impl Default for PeFormat {
    fn default() -> Self {
        PeFormat {
            image_base: OptionField::new("image_base", "Preferred load address", 0x0040_0000),
            section_alignment: OptionField::new("section_alignment", "In-memory section alignment", 0x1000),
            file_alignment: OptionField::new("file_alignment", "On-disk section alignment", 0x200),
            stack_size: OptionField::new("stack", "Reserved stack size", 0x10_0000),
            heap_size: OptionField::new("heap", "Reserved heap size", 0x10_0000),
            subsystem: OptionField::new("subsystem", "IMAGE_SUBSYSTEM_* value (3 = console, 2 = GUI)", 3),
            image_base_resolved: 0x0040_0000,
            section_alignment_resolved: 0x1000,
            file_alignment_resolved: 0x200,
            stack_size_resolved: 0x10_0000,
            heap_size_resolved: 0x10_0000,
            subsystem_resolved: 3,
        }
    }
}

impl PeFormat {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SegmentSink for PeFormat {
    fn on_new_segment(&mut self, _module: &Module, _segment: &LinkSegment, _index: crate::common::SegmentIndex) {}
}

impl OutputFormat for PeFormat {
    fn set_options(&mut self, options: &OptionMap) -> Result<()> {
        self.image_base_resolved = self.image_base.resolve(options)?;
        self.section_alignment_resolved = self.section_alignment.resolve(options)?.max(1);
        self.file_alignment_resolved = self.file_alignment.resolve(options)?.max(1);
        self.stack_size_resolved = self.stack_size.resolve(options)?;
        self.heap_size_resolved = self.heap_size.resolve(options)?;
        self.subsystem_resolved = self.subsystem.resolve(options)?;
        Ok(())
    }

    fn get_options(&self) -> OptionCollector {
        OptionCollector::new()
            .with_field(self.image_base.name, self.image_base.help)
            .with_field(self.section_alignment.name, self.section_alignment.help)
            .with_field(self.file_alignment.name, self.file_alignment.help)
            .with_field(self.stack_size.name, self.stack_size.help)
            .with_field(self.heap_size.name, self.heap_size.help)
            .with_field(self.subsystem.name, self.subsystem.help)
    }

    fn script_parameter_names(&self) -> &'static [&'static str] {
        &["section_alignment"]
    }

    fn script_parameters(&self, _module: &Module) -> script::Parameters {
        let mut params = script::Parameters::new();
        params.insert(
            alloc::string::String::from("section_alignment"),
            self.section_alignment_resolved,
        );
        params
    }

    fn default_script(&self, _module: &Module) -> Script {
        // One segment per section, each opening on a section-alignment
        // boundary in the virtual address space the RVA fields below are
        // computed from; the file itself uses `file_alignment` separately
        // (handled directly in `write_file`, since the script DSL only
        // models one address space per segment, not a file/virtual split).
        script::parse("for any { align ?section_alignment?; all any; };")
            .expect("built-in PE default script must parse")
    }

    fn additional_section_flags(&self, name: &str) -> SectionFlags {
        match name {
            ".stack" => SectionFlags::STACK,
            ".heap" => SectionFlags::HEAP,
            _ => SectionFlags::NONE,
        }
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

    fn calculate_values(&mut self, _module: &Module) -> Result<()> {
        Ok(())
    }

    fn write_file(&self, module: &Module, writer: &mut dyn Writer) -> Result<()> {
        // Base relocations: every absolute (non-PC-relative) fixup needs a
        // load-time adjustment if the OS can't honor `image_base` (spec.md
        // §9's "simple relocation base table" — `IMAGE_REL_BASED_HIGHLOW`
        // only, no `IMAGE_REL_BASED_DIR64`/ARM variants). Computed up front
        // since its presence changes the section count in the headers.
        let mut reloc_rvas: Vec<u32> = module
            .relocations
            .iter()
            .filter(|r| r.reference.is_none() && r.kind == RelocationKind::Direct && r.size == 4)
            .filter_map(|r| r.source.get_position(module, true).map(|p| p as u32))
            .collect();
        reloc_rvas.sort_unstable();
        let reloc_section = build_base_relocation_section(&reloc_rvas);
        let has_reloc = !reloc_section.is_empty();
        let section_count = module.segments.len() + if has_reloc { 1 } else { 0 };

        let headers_size_raw = DOS_STUB_SIZE + PE_HEADER_SIZE + COFF_HEADER_SIZE + OPTIONAL_HEADER_SIZE
            + section_count as u64 * SECTION_HEADER_SIZE;
        let size_of_headers = align_up(headers_size_raw, self.file_alignment_resolved);

        // Lay out each segment's file position and size (file-aligned raw
        // data) independently of its already-computed virtual RVA
        // (section-alignment-spaced by the default script above).
        let mut file_offsets = Vec::with_capacity(module.segments.len());
        let mut cursor = size_of_headers;
        for segment in &module.segments {
            file_offsets.push(cursor);
            let raw_size = align_up(segment.data_size, self.file_alignment_resolved);
            cursor += raw_size;
        }
        let reloc_file_offset = cursor;
        if has_reloc {
            cursor += align_up(reloc_section.len() as u64, self.file_alignment_resolved);
        }

        let entry_rva = module
            .global_symbols
            .get("_start")
            .and_then(|loc| loc.get_position(module, true))
            .unwrap_or(0);

        let code_segments: Vec<&LinkSegment> = module
            .segments
            .iter()
            .filter(|s| s.sections.iter().any(|&i| module.section(i).map(|sec| sec.is_executable()).unwrap_or(false)))
            .collect();
        let size_of_code: u64 = code_segments.iter().map(|s| align_up(s.data_size, self.file_alignment_resolved)).sum();
        let base_of_code = code_segments.first().map(|s| s.base_address).unwrap_or(self.section_alignment_resolved);

        let data_segments: Vec<&LinkSegment> = module
            .segments
            .iter()
            .filter(|s| !s.sections.iter().any(|&i| module.section(i).map(|sec| sec.is_executable()).unwrap_or(false)))
            .collect();
        let size_of_initialized_data: u64 = data_segments
            .iter()
            .filter(|s| s.data_size > 0)
            .map(|s| align_up(s.data_size, self.file_alignment_resolved))
            .sum();
        let size_of_uninitialized_data: u64 = data_segments.iter().map(|s| s.zero_fill).sum();
        let base_of_data = data_segments.first().map(|s| s.base_address).unwrap_or(base_of_code);

        let image_end = module
            .segments
            .last()
            .map(|s| s.base_address + align_up(s.footprint(), self.section_alignment_resolved))
            .unwrap_or(size_of_headers);
        let size_of_image = align_up(image_end, self.section_alignment_resolved);
        let reloc_section_rva = if has_reloc {
            align_up(size_of_image, self.section_alignment_resolved)
        } else {
            0
        };

        writer.seek(0);
        writer.write_data(b"MZ");
        writer.skip(DOS_STUB_SIZE - 2 - 4);
        writer.write_word(4, DOS_STUB_SIZE, Default::default()); // e_lfanew

        writer.write_data(b"PE\0\0");

        writer.write_word(2, machine_for_cpu(module.cpu) as u64, Default::default());
        writer.write_word(2, section_count as u64, Default::default());
        writer.write_word(4, 0, Default::default()); // timestamp
        writer.write_word(4, 0, Default::default()); // symbol table pointer: none, stripped
        writer.write_word(4, 0, Default::default()); // number of symbols
        writer.write_word(2, OPTIONAL_HEADER_SIZE as u64, Default::default());
        writer.write_word(2, 0x0102, Default::default()); // EXECUTABLE_IMAGE | 32BIT_MACHINE

        writer.write_word(2, 0x10B, Default::default()); // PE32 magic
        writer.write_data(&[0, 0]); // linker version
        writer.write_word(4, size_of_code, Default::default());
        writer.write_word(4, size_of_initialized_data, Default::default());
        writer.write_word(4, size_of_uninitialized_data, Default::default());
        writer.write_word(4, entry_rva, Default::default());
        writer.write_word(4, base_of_code, Default::default());
        writer.write_word(4, base_of_data, Default::default());
        writer.write_word(4, self.image_base_resolved, Default::default());
        writer.write_word(4, self.section_alignment_resolved, Default::default());
        writer.write_word(4, self.file_alignment_resolved, Default::default());
        writer.write_word(2, 4, Default::default()); // major OS version
        writer.write_word(2, 0, Default::default());
        writer.write_word(2, 0, Default::default()); // major image version
        writer.write_word(2, 0, Default::default());
        writer.write_word(2, 4, Default::default()); // major subsystem version
        writer.write_word(2, 0, Default::default());
        writer.write_word(4, 0, Default::default()); // Win32VersionValue
        writer.write_word(4, size_of_image, Default::default());
        writer.write_word(4, size_of_headers, Default::default());
        writer.write_word(4, 0, Default::default()); // checksum: unchecked by most loaders
        writer.write_word(2, self.subsystem_resolved, Default::default());
        writer.write_word(2, 0, Default::default()); // DLL characteristics
        writer.write_word(4, self.stack_size_resolved, Default::default());
        writer.write_word(4, 0x1000, Default::default()); // stack commit
        writer.write_word(4, self.heap_size_resolved, Default::default());
        writer.write_word(4, 0x1000, Default::default()); // heap commit
        writer.write_word(4, 0, Default::default()); // loader flags
        writer.write_word(4, NUMBER_OF_DATA_DIRECTORIES, Default::default());

        for dir in 0..NUMBER_OF_DATA_DIRECTORIES as usize {
            if dir == BASE_RELOCATION_DIRECTORY && has_reloc {
                writer.write_word(4, reloc_section_rva, Default::default());
                writer.write_word(4, reloc_section.len() as u64, Default::default());
            } else {
                writer.write_word(4, 0, Default::default());
                writer.write_word(4, 0, Default::default());
            }
        }

        for (segment, &file_offset) in module.segments.iter().zip(file_offsets.iter()) {
            let mut name_bytes = [0u8; 8];
            let raw = segment.name.as_bytes();
            let n = raw.len().min(8);
            name_bytes[..n].copy_from_slice(&raw[..n]);
            writer.write_data(&name_bytes);
            writer.write_word(4, segment.footprint(), Default::default()); // virtual size
            writer.write_word(4, segment.base_address, Default::default()); // RVA
            let raw_size = align_up(segment.data_size, self.file_alignment_resolved);
            writer.write_word(4, raw_size, Default::default());
            writer.write_word(4, if segment.data_size == 0 { 0 } else { file_offset }, Default::default());
            writer.write_word(4, 0, Default::default()); // relocations pointer: unused, COFF-only
            writer.write_word(4, 0, Default::default()); // linenumbers pointer: unused
            writer.write_word(2, 0, Default::default());
            writer.write_word(2, 0, Default::default());
            let flags = segment
                .sections
                .iter()
                .filter_map(|&i| module.section(i))
                .fold(SectionFlags::NONE, |acc, s| acc | s.flags);
            writer.write_word(4, section_characteristics(flags) as u64, Default::default());
        }

        if has_reloc {
            writer.write_data(b".reloc\0\0");
            let raw_size = align_up(reloc_section.len() as u64, self.file_alignment_resolved);
            writer.write_word(4, raw_size, Default::default()); // virtual size
            writer.write_word(4, reloc_section_rva, Default::default());
            writer.write_word(4, raw_size, Default::default());
            writer.write_word(4, reloc_file_offset, Default::default());
            writer.write_word(4, 0, Default::default());
            writer.write_word(4, 0, Default::default());
            writer.write_word(2, 0, Default::default());
            writer.write_word(2, 0, Default::default());
            writer.write_word(4, 0x4200_0040, Default::default()); // CNT_INITIALIZED_DATA | MEM_READ | MEM_DISCARDABLE
        }

        writer.fill_to(size_of_headers);

        for (segment, &file_offset) in module.segments.iter().zip(file_offsets.iter()) {
            if segment.data_size == 0 {
                continue;
            }
            writer.fill_to(file_offset);
            for &section_index in &segment.sections {
                if let Some(section) = module.section(section_index) {
                    section.write_to(writer, 0, section.size());
                }
            }
            writer.fill_to(file_offset + align_up(segment.data_size, self.file_alignment_resolved));
        }

        if has_reloc {
            writer.fill_to(reloc_file_offset);
            writer.write_data(&reloc_section);
            writer.align_to(self.file_alignment_resolved);
        }

        Ok(())
    }

    fn dump(&self, module: &Module) -> Report {
        let mut region = Region::new("sections", DOS_STUB_SIZE + PE_HEADER_SIZE + COFF_HEADER_SIZE + OPTIONAL_HEADER_SIZE, 0);
        for (index, segment) in module.segments.iter().enumerate() {
            region = region.block(
                Block::new(format!("section[{index}]"), segment.base_address, segment.footprint())
                    .field("name", segment.name.clone())
                    .field("rva", segment.base_address)
                    .field("virtual_size", segment.footprint()),
            );
        }
        Report::new("pe").region(region)
    }

    fn default_extension(&self) -> &'static str {
        "exe"
    }
}

/// Pack a sorted list of absolute-addressed-fixup RVAs into
/// `IMAGE_BASE_RELOCATION` blocks: one block per 4K page, a `(page_rva,
/// block_size)` header followed by 16-bit `(type << 12) | page_offset`
/// entries, `IMAGE_REL_BASED_HIGHLOW` (3) only, padded to a 4-byte
/// boundary with an `IMAGE_REL_BASED_ABSOLUTE` (0) filler entry.
fn build_base_relocation_section(rvas: &[u32]) -> Vec<u8> {
    if rvas.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut i = 0;
    while i < rvas.len() {
        let page = rvas[i] & !0xFFF;
        let mut entries: Vec<u16> = Vec::new();
        while i < rvas.len() && (rvas[i] & !0xFFF) == page {
            let offset = (rvas[i] & 0xFFF) as u16;
            entries.push((3u16 << 12) | offset);
            i += 1;
        }
        if entries.len() % 2 == 1 {
            entries.push(0);
        }
        let block_size = 8 + entries.len() as u32 * 2;
        out.extend_from_slice(&page.to_le_bytes());
        out.extend_from_slice(&block_size.to_le_bytes());
        for entry in entries {
            out.extend_from_slice(&entry.to_le_bytes());
        }
    }
    out
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
    use crate::symbol::Location;

    #[test]
    fn writes_pe_signature_after_dos_stub() {
        let mut module = Module::new();
        module.cpu = Some(Cpu::I386);
        let code = module.add_section(
            Section::new(".text", SectionFlags::EXECUTABLE).with_data(Buffer::from_bytes(alloc::vec![0x90u8; 16])),
        );
        module.define_global("_start", Location::new(code, 0));

        let mut fmt = PeFormat::new();
        fmt.set_options(&OptionMap::new()).unwrap();
        let script = fmt.default_script(&module);
        let params = fmt.script_parameters(&module);
        crate::segment::apply_script(&mut module, &script, &params, &mut fmt).unwrap();
        fmt.calculate_values(&module).unwrap();

        let mut writer = MemoryWriter::new();
        fmt.write_file(&module, &mut writer).unwrap();
        let bytes = writer.into_bytes();
        assert_eq!(&bytes[0..2], b"MZ");
        let lfanew = u32::from_le_bytes([bytes[0x3C], bytes[0x3D], bytes[0x3E], bytes[0x3F]]) as usize;
        assert_eq!(&bytes[lfanew..lfanew + 4], b"PE\0\0");
    }

    #[test]
    fn base_relocations_group_by_page() {
        let bytes = build_base_relocation_section(&[0x1000, 0x1004, 0x2000]);
        let block_size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        assert_eq!(block_size, 8 + 2 * 2); // one page, two entries (even count, no filler)
    }
}
