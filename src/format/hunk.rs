//! Amiga Hunk output (spec.md §6), grounded in the public AmigaOS hunk
//! file format: a `HUNK_HEADER` block listing every hunk's longword size,
//! followed by one `HUNK_CODE`/`HUNK_DATA`/`HUNK_BSS` block per segment,
//! each optionally followed by a `HUNK_RELOC32` block and closed with
//! `HUNK_END`. All longwords are big-endian (68k native order), and every
//! size in the format is counted in 32-bit longwords rather than bytes.
//!
//! Not listed among spec.md §9's stub-only formats, so this plugin
//! implements a genuine (if single-hunk-per-segment, non-overlaid) writer
//! rather than identity round-trip plus dump.

use crate::common::SectionFlags;
use crate::dump::{Block, Region, Report};
use crate::error::Result;
use crate::image::Image;
use crate::io::{Endian, Writer};
use crate::module::Module;
use crate::relocation::RelocationKind;
use crate::script::{self, Script};
use crate::segment::{Segment as LinkSegment, SegmentSink};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::options::{OptionCollector, OptionField, OptionMap};
use super::OutputFormat;

const HUNK_HEADER: u32 = 0x3F3;
const HUNK_CODE: u32 = 0x3E9;
const HUNK_DATA: u32 = 0x3EA;
const HUNK_BSS: u32 = 0x3EB;
const HUNK_RELOC32: u32 = 0x3EC;
const HUNK_END: u32 = 0x3F2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HunkKind {
    Code,
    Data,
    Bss,
}

fn classify(segment: &LinkSegment, module: &Module) -> HunkKind {
    if segment.sections.iter().any(|&i| module.section(i).map(|s| s.is_executable()).unwrap_or(false)) {
        HunkKind::Code
    } else if segment.zero_fill > 0 && segment.data_size == 0 {
        HunkKind::Bss
    } else {
        HunkKind::Data
    }
}

fn longwords(byte_len: u64) -> u64 {
    (byte_len + 3) / 4
}

/// The Amiga Hunk output plugin.
#[derive(Debug, Clone, Default)]
pub struct HunkFormat {
    chip_mem: OptionField<bool>,
    chip_mem_resolved: bool,
}

impl HunkFormat {
    pub fn new() -> Self {
        HunkFormat {
            chip_mem: OptionField::new("chip_mem", "Allocate hunks from chip memory", false),
            chip_mem_resolved: false,
        }
    }
}

impl SegmentSink for HunkFormat {
    fn on_new_segment(&mut self, _module: &Module, _segment: &LinkSegment, _index: crate::common::SegmentIndex) {}
}

impl OutputFormat for HunkFormat {
    fn set_options(&mut self, options: &OptionMap) -> Result<()> {
        self.chip_mem_resolved = self.chip_mem.resolve(options)?;
        Ok(())
    }

    fn get_options(&self) -> OptionCollector {
        OptionCollector::new().with_field(self.chip_mem.name, self.chip_mem.help)
    }

    fn default_script(&self, _module: &Module) -> Script {
        script::parse("for any { all any; };").expect("built-in hunk default script must parse")
    }

    fn additional_section_flags(&self, _name: &str) -> SectionFlags {
        SectionFlags::NONE
    }

    fn supports_segmentation(&self) -> bool {
        true
    }

    fn is_16bit(&self) -> bool {
        false
    }

    fn is_protected_mode(&self) -> bool {
        false
    }

    fn calculate_values(&mut self, _module: &Module) -> Result<()> {
        Ok(())
    }

    fn write_file(&self, module: &Module, writer: &mut dyn Writer) -> Result<()> {
        let endian = Endian::Big;
        let hunk_count = module.segments.len() as u64;

        writer.write_word(4, HUNK_HEADER as u64, endian);
        writer.write_word(4, 0, endian); // no resident library names
        writer.write_word(4, hunk_count, endian); // table size
        writer.write_word(4, 0, endian); // first hunk
        writer.write_word(4, hunk_count.saturating_sub(1), endian); // last hunk
        for segment in &module.segments {
            let size = longwords(segment.footprint());
            let tagged = if self.chip_mem_resolved { size | 0x4000_0000 } else { size };
            writer.write_word(4, tagged, endian);
        }

        for (index, segment) in module.segments.iter().enumerate() {
            let kind = classify(segment, module);
            let size_bytes = if kind == HunkKind::Bss { segment.footprint() } else { segment.data_size };
            let size_lw = longwords(size_bytes);

            let hunk_type = match kind {
                HunkKind::Code => HUNK_CODE,
                HunkKind::Data => HUNK_DATA,
                HunkKind::Bss => HUNK_BSS,
            };
            writer.write_word(4, hunk_type as u64, endian);
            writer.write_word(4, size_lw, endian);

            if kind != HunkKind::Bss {
                for &section_index in &segment.sections {
                    if let Some(section) = module.section(section_index) {
                        section.write_to(writer, 0, section.size());
                    }
                }
                let padding = size_lw * 4 - size_bytes;
                for _ in 0..padding {
                    writer.write_data(&[0]);
                }

                // Group this segment's 32-bit direct relocations by target
                // hunk, matching the `HUNK_RELOC32` table-of-tables shape.
                let mut by_target: BTreeMap<usize, Vec<u32>> = BTreeMap::new();
                for reloc in &module.relocations {
                    if reloc.kind != RelocationKind::Direct || reloc.size != 4 {
                        continue;
                    }
                    if reloc.source.section != segment.sections.first().copied().unwrap_or(reloc.source.section) {
                        continue;
                    }
                    let crate::symbol::Target::SegmentBase(target_index) = reloc.target else {
                        continue;
                    };
                    let Some(offset) = reloc.source.get_position(module, false) else { continue };
                    by_target.entry(target_index.0).or_default().push(offset as u32);
                }
                if !by_target.is_empty() {
                    writer.write_word(4, HUNK_RELOC32 as u64, endian);
                    for (target_hunk, offsets) in &by_target {
                        writer.write_word(4, offsets.len() as u64, endian);
                        writer.write_word(4, *target_hunk as u64, endian);
                        for offset in offsets {
                            writer.write_word(4, *offset as u64, endian);
                        }
                    }
                    writer.write_word(4, 0, endian);
                }
            }
            writer.write_word(4, HUNK_END as u64, endian);
            let _ = index;
        }

        Ok(())
    }

    fn dump(&self, module: &Module) -> Report {
        let mut report = Report::new("hunk");
        let mut offset = 0u64;
        for (index, segment) in module.segments.iter().enumerate() {
            let kind = classify(segment, module);
            let label = match kind {
                HunkKind::Code => "HUNK_CODE",
                HunkKind::Data => "HUNK_DATA",
                HunkKind::Bss => "HUNK_BSS",
            };
            let size = segment.footprint();
            let region = Region::new(segment.name.clone(), offset, size).block(
                Block::new(label, offset, size)
                    .field("hunk_index", index as u64)
                    .field("longwords", longwords(size)),
            );
            report = report.region(region);
            offset += size;
        }
        report
    }

    fn default_extension(&self) -> &'static str {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Cpu, SectionFlags};
    use crate::image::Buffer;
    use crate::io::MemoryWriter;
    use crate::section::Section;

    #[test]
    fn header_lists_one_size_per_segment() {
        let mut module = Module::new();
        module.cpu = Some(Cpu::M68K);
        module.add_section(
            Section::new(".text", SectionFlags::EXECUTABLE).with_data(Buffer::from_bytes(alloc::vec![0x4Eu8, 0x75])),
        );

        let mut fmt = HunkFormat::new();
        fmt.set_options(&OptionMap::new()).unwrap();
        let script = fmt.default_script(&module);
        let params = script::Parameters::new();
        crate::segment::apply_script(&mut module, &script, &params, &mut fmt).unwrap();

        let mut writer = MemoryWriter::new();
        fmt.write_file(&module, &mut writer).unwrap();
        let bytes = writer.into_bytes();
        let word = |i: usize| u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        assert_eq!(word(0), HUNK_HEADER);
        assert_eq!(word(16), HUNK_CODE);
    }
}
