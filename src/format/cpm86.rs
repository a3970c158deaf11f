//! CP/M-86 `.cmd` output (spec.md §6, §8 scenario 2 "CP/M-86 small
//! model"), grounded in the Digital Research CP/M-86 command-file layout:
//! a 128-byte header holding one 4-byte group descriptor per memory group
//! (a type byte — `1` code, `2` data, `3` extra, `4` stack — followed by a
//! 24-bit little-endian paragraph count), zero-padded to 128 bytes, then
//! the code bytes, then the data bytes. No group descriptor is emitted for
//! an empty group.
//!
//! Only the "small model" (one code group, one data group, no relocatable
//! segments) scenario spec.md §8 exercises is implemented; the protected-
//! mode CP/M-86 variant (spec.md §4.5: "protected-mode containers ...
//! CP/M-86 protected-mode: record each SelectorIndex") is left for a
//! later plugin revision.

use crate::common::SectionFlags;
use crate::dump::{Block, Region, Report};
use crate::error::Result;
use crate::image::Image;
use crate::io::{Endian, Writer};
use crate::module::Module;
use crate::script::{self, Script};
use crate::segment::{Segment as LinkSegment, SegmentSink};

use super::options::{OptionCollector, OptionField, OptionMap};
use super::OutputFormat;

pub const HEADER_SIZE: u64 = 128;
const GROUP_CODE: u8 = 1;
const GROUP_DATA: u8 = 2;

fn paragraphs(byte_len: u64) -> u32 {
    ((byte_len + 15) / 16) as u32
}

fn write_group_descriptor(writer: &mut dyn Writer, group_type: u8, paragraph_count: u32) {
    writer.write_data(&[group_type]);
    let bytes = paragraph_count.to_le_bytes();
    writer.write_data(&bytes[..3]);
}

/// Write every section of `segment` starting at file offset `group_start`,
/// padding out to each section's recorded `bias` first so a stricter-than-
/// default alignment between two sections (a real gap `segment.data_size`
/// now counts, see segment.rs `place_section`) lands in the file instead of
/// being silently skipped by writing sections back-to-back.
fn write_segment_sections(module: &Module, segment: &LinkSegment, writer: &mut dyn Writer, group_start: u64) {
    for &section_index in &segment.sections {
        if let Some(section) = module.section(section_index) {
            if let Some(bias) = section.bias {
                writer.fill_to(group_start + bias);
            }
            section.write_to(writer, 0, section.size());
        }
    }
}

/// The CP/M-86 small-model `.cmd` output plugin.
#[derive(Debug, Clone, Default)]
pub struct Cpm86Format {
    small_model: OptionField<bool>,
}

impl Cpm86Format {
    pub fn new() -> Self {
        Cpm86Format { small_model: OptionField::new("small_model", "Emit the small-model cmd layout", true) }
    }
}

impl SegmentSink for Cpm86Format {
    fn on_new_segment(&mut self, _module: &Module, _segment: &LinkSegment, _index: crate::common::SegmentIndex) {}
}

impl OutputFormat for Cpm86Format {
    fn set_options(&mut self, options: &OptionMap) -> Result<()> {
        let _ = self.small_model.resolve(options)?;
        Ok(())
    }

    fn get_options(&self) -> OptionCollector {
        OptionCollector::new().with_field(self.small_model.name, self.small_model.help)
    }

    fn default_script(&self, _module: &Module) -> Script {
        script::parse("\".code\" { at 0; all exec; }; \".data\" { all write and not zero; };")
            .expect("built-in cpm86 default script must parse")
    }

    fn additional_section_flags(&self, _name: &str) -> SectionFlags {
        SectionFlags::NONE
    }

    fn supports_segmentation(&self) -> bool {
        false
    }

    fn is_16bit(&self) -> bool {
        true
    }

    fn is_protected_mode(&self) -> bool {
        false
    }

    fn calculate_values(&mut self, _module: &Module) -> Result<()> {
        Ok(())
    }

    fn write_file(&self, module: &Module, writer: &mut dyn Writer) -> Result<()> {
        let code_segment = module.segments.iter().find(|s| {
            s.sections.iter().any(|&i| module.section(i).map(|sec| sec.is_executable()).unwrap_or(false))
        });
        let data_segment = module.segments.iter().find(|s| {
            !s.sections.iter().any(|&i| module.section(i).map(|sec| sec.is_executable()).unwrap_or(false))
                && s.data_size > 0
        });

        writer.seek(0);
        if let Some(segment) = code_segment {
            write_group_descriptor(writer, GROUP_CODE, paragraphs(segment.data_size));
        }
        if let Some(segment) = data_segment {
            write_group_descriptor(writer, GROUP_DATA, paragraphs(segment.data_size));
        }
        writer.fill_to(HEADER_SIZE);

        if let Some(segment) = code_segment {
            write_segment_sections(module, segment, writer, HEADER_SIZE);
        }
        if let Some(segment) = data_segment {
            // The data group starts right after the code group's own bytes
            // (including any internal alignment padding `segment.data_size`
            // now accounts for, see segment.rs `place_section`), not after
            // a bare sum of section sizes.
            let data_start = HEADER_SIZE + code_segment.map(|s| s.data_size).unwrap_or(0);
            write_segment_sections(module, segment, writer, data_start);
        }

        Ok(())
    }

    fn dump(&self, module: &Module) -> Report {
        let region = Region::new("header", 0, HEADER_SIZE).block(
            Block::new("group descriptors", 0, HEADER_SIZE)
                .field("segments", module.segments.len() as u64)
                .field("endian", Endian::Little as u64),
        );
        Report::new("cpm86").region(region)
    }

    fn default_extension(&self) -> &'static str {
        "cmd"
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
    fn small_model_header_then_code_then_data() {
        let mut module = Module::new();
        module.add_section(
            Section::new(".code", SectionFlags::EXECUTABLE)
                .with_data(Buffer::from_bytes(alloc::vec![0xCDu8; 0x100])),
        );
        module.add_section(
            Section::new(".data", SectionFlags::WRITABLE).with_data(Buffer::from_bytes(alloc::vec![0x11u8; 0x40])),
        );

        let mut fmt = Cpm86Format::new();
        fmt.set_options(&OptionMap::new()).unwrap();
        let script = fmt.default_script(&module);
        let params = script::Parameters::new();
        crate::segment::apply_script(&mut module, &script, &params, &mut fmt).unwrap();

        let mut writer = MemoryWriter::new();
        fmt.write_file(&module, &mut writer).unwrap();
        let bytes = writer.into_bytes();

        assert_eq!(bytes.len(), HEADER_SIZE as usize + 0x100 + 0x40);
        assert_eq!(bytes[0], GROUP_CODE);
        assert_eq!(u32::from_le_bytes([bytes[1], bytes[2], bytes[3], 0]), 0x10);
        assert_eq!(bytes[4], GROUP_DATA);
        assert_eq!(u32::from_le_bytes([bytes[5], bytes[6], bytes[7], 0]), 0x04);
        assert_eq!(&bytes[HEADER_SIZE as usize..HEADER_SIZE as usize + 4], &[0xCD, 0xCD, 0xCD, 0xCD]);
        assert_eq!(&bytes[HEADER_SIZE as usize + 0x100..HEADER_SIZE as usize + 0x100 + 4], &[0x11, 0x11, 0x11, 0x11]);
    }
}
