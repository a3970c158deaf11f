//! Read-only/stub container plugins (spec.md §9: "Several plugins (AIF,
//! GEOS, AS86, o65, OMF, W3/W4, Xenix, XP, PEF) have read-only or stub
//! implementations; the spec treats them as identity round-trip plus dump
//! only").
//!
//! Rather than thirteen near-identical near-empty files, one
//! [`StubFormat`] backs all of them: [`InputFormat::read_file`] stores the
//! whole input verbatim as a single unstructured section, and
//! [`OutputFormat::write_file`] writes that same section back out
//! byte-for-byte. The registry tags the right [`StubKind`] after
//! construction so `dump` can still name the container it came from.

use crate::common::SectionFlags;
use crate::dump::{Block, Region, Report};
use crate::error::Result;
use crate::image::{Buffer, Image};
use crate::io::Writer;
use crate::module::Module;
use crate::script::{self, Script};
use crate::section::Section;
use crate::segment::{Segment as LinkSegment, SegmentSink};
use alloc::vec::Vec;

use super::options::{OptionCollector, OptionMap};
use super::{InputFormat, OutputFormat};

/// The handful of containers spec.md §9 names as identity-round-trip
/// only, plus a fallback for a tag the registry doesn't recognize yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubKind {
    Aif,
    Geos,
    As86,
    O65,
    AppleOmf,
    W3W4,
    Xenix,
    Xp,
    Pef,
    Unknown,
}

impl StubKind {
    pub fn tag(self) -> &'static str {
        match self {
            StubKind::Aif => "aif",
            StubKind::Geos => "geos",
            StubKind::As86 => "as86",
            StubKind::O65 => "o65",
            StubKind::AppleOmf => "appleomf",
            StubKind::W3W4 => "w3w4",
            StubKind::Xenix => "xenix",
            StubKind::Xp => "xp",
            StubKind::Pef => "pef",
            StubKind::Unknown => "stub",
        }
    }
}

const RAW_SECTION_NAME: &str = ".raw";

/// A container this crate can read and re-emit but does not yet
/// understand structurally: no sections, symbols or relocations are
/// extracted, just the whole byte image.
#[derive(Debug, Clone)]
pub struct StubFormat {
    pub kind: StubKind,
    raw: Vec<u8>,
}

impl StubFormat {
    pub fn with_kind(mut self, kind: StubKind) -> Self {
        self.kind = kind;
        self
    }
}

impl<'data> InputFormat<'data> for StubFormat {
    type Data = &'data [u8];

    fn read_file(data: Self::Data) -> Result<Self> {
        Ok(StubFormat { kind: StubKind::Unknown, raw: data.to_vec() })
    }

    fn generate_module(&self, module: &mut Module) -> Result<()> {
        let section = Section::new(RAW_SECTION_NAME, SectionFlags::READABLE)
            .with_data(Buffer::from_bytes(self.raw.clone()));
        module.add_section(section);
        Ok(())
    }
}

impl SegmentSink for StubFormat {
    fn on_new_segment(&mut self, _module: &Module, _segment: &LinkSegment, _index: crate::common::SegmentIndex) {}
}

impl OutputFormat for StubFormat {
    fn set_options(&mut self, _options: &OptionMap) -> Result<()> {
        Ok(())
    }

    fn get_options(&self) -> OptionCollector {
        OptionCollector::new()
    }

    fn default_script(&self, _module: &Module) -> Script {
        script::parse("for any { all any; };").expect("built-in stub default script must parse")
    }

    fn supports_segmentation(&self) -> bool {
        false
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
        writer.seek(0);
        if let Some(section) = module.section_by_name(RAW_SECTION_NAME) {
            section.write_to(writer, 0, section.size());
        } else {
            // No input was read (a freshly-built Module being emitted in
            // this format): fall back to writing every section's bytes in
            // order, which is the best an identity-only plugin can offer.
            for segment in &module.segments {
                for &section_index in &segment.sections {
                    if let Some(section) = module.section(section_index) {
                        section.write_to(writer, 0, section.size());
                    }
                }
            }
        }
        Ok(())
    }

    fn dump(&self, module: &Module) -> Report {
        let size = module.section_by_name(RAW_SECTION_NAME).map(|s| s.size()).unwrap_or(0);
        let region = Region::new("raw", 0, size).block(
            Block::new(self.kind.tag(), 0, size).field("bytes", size),
        );
        Report::new("stub").region(region)
    }

    fn default_extension(&self) -> &'static str {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_raw_bytes_unchanged() {
        let input: &[u8] = &[0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02];
        let mut fmt = StubFormat::read_file(input).unwrap().with_kind(StubKind::O65);
        let mut module = Module::new();
        fmt.generate_module(&mut module).unwrap();

        let script = fmt.default_script(&module);
        let params = script::Parameters::new();
        crate::segment::apply_script(&mut module, &script, &params, &mut fmt).unwrap();

        let mut writer = crate::io::MemoryWriter::new();
        fmt.write_file(&module, &mut writer).unwrap();
        assert_eq!(writer.into_bytes(), input);
    }

    #[test]
    fn dump_names_the_tagged_kind() {
        let fmt = StubFormat::read_file(&[0u8; 4][..]).unwrap().with_kind(StubKind::Pef);
        let mut module = Module::new();
        fmt.generate_module(&mut module).unwrap();
        let report = fmt.dump(&module);
        assert_eq!(report.format_name, "stub");
    }
}
