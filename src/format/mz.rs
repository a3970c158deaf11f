//! The MS-DOS MZ `.exe` format (spec.md §6, §8 scenario 1), grounded in
//! `examples/original_source/src/format/mzexe.h`/`.cc`.
//!
//! MZ is the simplest container in scope: one segment holding the whole
//! image, a fixed-size header, and a table of real-mode paragraph fixups
//! the DOS loader applies at load time by adding the segment it actually
//! loaded at. Everything else in this crate's format family (NE, LE, the
//! stub-prepending convention in spec.md §6) builds on this shape.

use crate::common::SectionFlags;
use crate::diagnostics::diag_warn;
use crate::dump::{Bitfield, Block, Region, Report};
use crate::error::{Error, Result};
use crate::io::Writer;
use crate::module::Module;
use crate::relocation::RelocationKind;
use crate::script::{self, Script};
use crate::segment::{Segment, SegmentSink};
use crate::symbol::Location;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use super::options::{OptionCollector, OptionField, OptionMap};
use super::OutputFormat;

pub const HEADER_SIZE: u64 = 0x1C;
pub const BLOCK_SIZE: u64 = 0x200;

/// Which two-byte magic this file starts with (spec.md §6 "magic aliases
/// MZ/ZM/DL"; `mzexe.h`'s `magic_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MzSignature {
    Mz,
    Zm,
    /// HP 100LX/200LX System Manager module (`.exm`).
    Dl,
}

impl MzSignature {
    pub fn bytes(self) -> [u8; 2] {
        match self {
            MzSignature::Mz => *b"MZ",
            MzSignature::Zm => *b"ZM",
            MzSignature::Dl => *b"DL",
        }
    }
}

/// One entry of the load-time relocation table: a segment:offset pair
/// naming a linear address within the loaded image (`mzexe.h`'s
/// `Relocation`). Unlike a generic [`crate::relocation::Relocation`], the
/// *value* already baked into the image at this location by the
/// resolution engine is what gets patched; this table only tells the
/// loader *where* to add its chosen load segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MzTableRelocation {
    pub segment: u16,
    pub offset: u16,
}

impl MzTableRelocation {
    /// Split a linear image address into a segment:offset pair, preferring
    /// segment 0 with a plain offset whenever the address fits in 16 bits
    /// (`mzexe.h`'s `Relocation::FromLinear`).
    pub fn from_linear(address: u64) -> Self {
        if address <= 0xFFFF {
            return MzTableRelocation {
                segment: 0,
                offset: address as u16,
            };
        }
        let segment = ((address - 0xFFFF + 15) / 16) as u64;
        let offset = (address - segment * 16) as u16;
        MzTableRelocation {
            segment: segment as u16,
            offset,
        }
    }

    pub fn linear_offset(&self) -> u32 {
        (self.segment as u32) * 16 + self.offset as u32
    }
}

/// The MZ output plugin.
#[derive(Debug, Clone)]
pub struct MzFormat {
    pub signature: MzSignature,
    /// User-requested stack size in bytes, `stack` option in
    /// `MZOptionCollector`.
    stack_size: OptionField<u64>,
    /// Aligns the end of the header to a power of two (`header_align`).
    header_align: OptionField<u64>,
    /// Aligns the end of the file to a power of two (`file_align`).
    file_align: OptionField<u64>,

    // Resolved by `set_options`, since `calculate_values`'s trait signature
    // (spec.md §4.6 `CalculateValues`) takes no `OptionMap` of its own.
    stack_size_resolved: u64,
    header_align_resolved: u64,
    file_align_resolved: u64,

    // Computed by `calculate_values`; only meaningful after it has run.
    last_block_size: u16,
    file_size_blocks: u16,
    relocation_count: u16,
    header_size_paras: u16,
    min_extra_paras: u16,
    max_extra_paras: u16,
    ss: u16,
    sp: u16,
    ip: u16,
    cs: u16,
    relocations: Vec<MzTableRelocation>,
    image_size: u64,
}

impl Default for MzFormat {
    fn default() -> Self {
        MzFormat {
            signature: MzSignature::Mz,
            stack_size: OptionField::new("stack", "Specify the stack size", 0x1000),
            header_align: OptionField::new("header_align", "Aligns the end of the header to a boundary", 0x10),
            file_align: OptionField::new("file_align", "Aligns the end of the file to a boundary", 1),
            stack_size_resolved: 0x1000,
            header_align_resolved: 0x10,
            file_align_resolved: 1,
            last_block_size: 0,
            file_size_blocks: 0,
            relocation_count: 0,
            header_size_paras: 0,
            min_extra_paras: 0,
            max_extra_paras: 0,
            ss: 0,
            sp: 0,
            ip: 0,
            cs: 0,
            relocations: Vec::new(),
            image_size: 0,
        }
    }
}

impl MzFormat {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `.image` segment the default script lays every section into
    /// (MZ has exactly one address space: `mzexe.h`'s
    /// `CreateDefaultSegments` creates a single segment for a plain MZ
    /// file).
    fn image_segment<'m>(&self, module: &'m Module) -> Option<&'m Segment> {
        module.segments.first()
    }

    fn entry_location(&self, module: &Module) -> u64 {
        module
            .global_symbols
            .get("_start")
            .and_then(|loc| loc.get_position(module, false))
            .unwrap_or(0)
    }

    fn stack_location(&self, module: &Module) -> u64 {
        for (index, section) in module.sections() {
            if section.flags.contains(SectionFlags::STACK) {
                let loc = Location::new(index, section.footprint());
                if let Some(pos) = loc.get_position(module, false) {
                    return pos;
                }
            }
        }
        // No explicit `.stack` section: the stack lives past the end of
        // the image, sized by the `stack` option.
        let image_end = self
            .image_segment(module)
            .map(|s| s.base_address + s.footprint())
            .unwrap_or(0);
        image_end + self.stack_size_resolved
    }
}

impl SegmentSink for MzFormat {
    fn on_new_segment(&mut self, _module: &Module, _segment: &Segment, _index: crate::common::SegmentIndex) {
        // MZ has one address space; nothing plugin-specific needs to react
        // to a new segment the way a multi-segment format's entry table
        // would.
    }
}

impl OutputFormat for MzFormat {
    fn set_options(&mut self, options: &OptionMap) -> Result<()> {
        // Resolved eagerly so a bad `-S` value is a configuration error, not
        // a silent fallback to the default (spec.md §7 "Configuration"
        // errors are fatal before writing), and cached because
        // `calculate_values`'s trait signature carries no `OptionMap` of its
        // own.
        self.stack_size_resolved = self.stack_size.resolve(options)?;
        self.header_align_resolved = self.header_align.resolve(options)?.max(1);
        self.file_align_resolved = self.file_align.resolve(options)?.max(1);
        Ok(())
    }

    fn get_options(&self) -> OptionCollector {
        OptionCollector::new()
            .with_field(self.stack_size.name, self.stack_size.help)
            .with_field(self.header_align.name, self.header_align.help)
            .with_field(self.file_align.name, self.file_align.help)
    }

    fn default_script(&self, _module: &Module) -> Script {
        script::parse("\".image\" { at 0; all any; };").expect("built-in MZ default script must parse")
    }

    fn additional_section_flags(&self, name: &str) -> SectionFlags {
        match name {
            ".stack" => SectionFlags::STACK,
            _ => SectionFlags::NONE,
        }
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

    fn calculate_values(&mut self, module: &Module) -> Result<()> {
        self.calculate_values_impl(module)
    }

    fn write_file(&self, module: &Module, writer: &mut dyn Writer) -> Result<()> {
        writer.seek(0);
        let sig = self.signature.bytes();
        writer.write_data(&sig);
        writer.write_word(2, self.last_block_size as u64, Default::default());
        writer.write_word(2, self.file_size_blocks as u64, Default::default());
        writer.write_word(2, self.relocation_count as u64, Default::default());
        writer.write_word(2, self.header_size_paras as u64, Default::default());
        writer.write_word(2, self.min_extra_paras as u64, Default::default());
        writer.write_word(2, self.max_extra_paras as u64, Default::default());
        writer.write_word(2, self.ss as u64, Default::default());
        writer.write_word(2, self.sp as u64, Default::default());
        writer.write_word(2, 0, Default::default()); // checksum, never validated by DOS
        writer.write_word(2, self.ip as u64, Default::default());
        writer.write_word(2, self.cs as u64, Default::default());
        writer.write_word(2, HEADER_SIZE, Default::default()); // relocation table offset
        writer.write_word(2, 0, Default::default()); // overlay number

        for reloc in &self.relocations {
            writer.write_word(2, reloc.offset as u64, Default::default());
            writer.write_word(2, reloc.segment as u64, Default::default());
        }

        let image_start = self.header_size_paras as u64 * 16;
        writer.fill_to(image_start);

        if let Some(segment) = self.image_segment(module) {
            for &section_index in &segment.sections {
                if let Some(section) = module.section(section_index) {
                    use crate::image::Image;
                    // Pad out to this section's bias first: two sections
                    // with a stricter-than-default alignment between them
                    // leave a gap that `Segment::data_size` now counts as
                    // real bytes (segment.rs `place_section`), so it must
                    // actually be emitted here rather than assuming the
                    // previous section's bytes run straight into this one.
                    if let Some(bias) = section.bias {
                        writer.fill_to(image_start + bias);
                    }
                    section.write_to(writer, 0, section.footprint());
                }
            }
        }
        writer.align_to(self.file_align_resolved);
        Ok(())
    }

    fn dump(&self, module: &Module) -> Report {
        let sig = self.signature.bytes();
        let header = Block::new("MZ header", 0, HEADER_SIZE)
            .field("signature", String::from_utf8_lossy(&sig).into_owned())
            .field("last_block_size", self.last_block_size as u64)
            .field("file_size_blocks", self.file_size_blocks as u64)
            .field("relocation_count", self.relocation_count as u64)
            .field("header_size_paras", self.header_size_paras as u64)
            .field("ss", self.ss as u64)
            .field("sp", self.sp as u64)
            .field("cs", self.cs as u64)
            .field("ip", self.ip as u64)
            .bitfield(
                Bitfield::new("overlay", 0)
                    .bit("is_main_program", true),
            );
        let mut region = Region::new("header", 0, self.header_size_paras as u64 * 16).block(header);
        for (i, reloc) in self.relocations.iter().enumerate() {
            region = region.block(
                Block::new(format!("relocation[{i}]"), HEADER_SIZE + i as u64 * 4, 4)
                    .field("segment", reloc.segment as u64)
                    .field("offset", reloc.offset as u64),
            );
        }
        let image_len = self.image_segment(module).map(|s| s.footprint()).unwrap_or(0);
        Report::new("mz").region(region).region(Region::new(
            "image",
            self.header_size_paras as u64 * 16,
            image_len,
        ))
    }

    fn default_extension(&self) -> &'static str {
        "exe"
    }
}

impl MzFormat {
    /// The actual `CalculateValues` body, run via the `OutputFormat` trait
    /// method or directly by callers (e.g. tests) that drive `set_options`
    /// and this separately from the full `process_module` pipeline.
    pub fn calculate_values_impl(&mut self, module: &Module) -> Result<()> {
        let header_align = self.header_align_resolved;

        self.relocations = module
            .relocations
            .iter()
            .filter(|r| r.kind == RelocationKind::ParagraphAddress)
            .filter_map(|r| r.source.get_position(module, false))
            .map(MzTableRelocation::from_linear)
            .collect();
        self.relocation_count = self
            .relocations
            .len()
            .try_into()
            .map_err(|_| Error("too many MZ relocations for a u16 count"))?;

        let header_bytes = align_up(HEADER_SIZE + self.relocations.len() as u64 * 4, header_align);
        self.header_size_paras = (header_bytes / 16)
            .try_into()
            .map_err(|_| Error("MZ header too large to express in paragraphs"))?;

        self.image_size = self.image_segment(module).map(|s| s.footprint()).unwrap_or(0);

        let entry = self.entry_location(module);
        self.cs = (entry >> 4) as u16;
        self.ip = (entry & 0xF) as u16;

        let stack = self.stack_location(module);
        self.ss = (stack >> 4) as u16;
        self.sp = (stack & 0xF) as u16;

        let extra_paras: u16 = ((stack.saturating_sub(self.image_size) + 15) / 16)
            .try_into()
            .unwrap_or(u16::MAX);
        self.min_extra_paras = extra_paras;
        self.max_extra_paras = extra_paras;

        let total = header_bytes + self.image_size;
        self.file_size_blocks = (total.div_ceil(BLOCK_SIZE))
            .try_into()
            .map_err(|_| Error("MZ image too large for the file_size_blocks field"))?;
        self.last_block_size = (total % BLOCK_SIZE) as u16;

        if self.relocations.len() > 0x7FFF {
            diag_warn!("mz", "relocation table unusually large ({} entries)", self.relocations.len());
        }
        Ok(())
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
    use crate::relocation::{Relocation, RelocationKind};
    use crate::section::Section;
    use crate::symbol::{Location, Target};

    /// spec.md §8 scenario 1, adapted: one `.code` section of 0x2000 bytes
    /// of `0x90`, one 4-byte `ParagraphAddress` relocation at offset 0x10
    /// targeting `.code`+0x1000, entry at 0, stack at 0x3000.
    fn scenario_1_module() -> Module {
        let mut module = Module::new();
        let code = module.add_section(
            Section::new(".code", SectionFlags::EXECUTABLE).with_data(Buffer::from_bytes(alloc::vec![0x90u8; 0x2000])),
        );
        module.define_global("_start", Location::new(code, 0));
        let reloc = Relocation::new(
            Location::new(code, 0x10),
            Target::Location(Location::new(code, 0x1000)),
            RelocationKind::ParagraphAddress,
            4,
        );
        module.add_relocation(reloc);
        module
    }

    #[test]
    fn scenario_1_header_fields() {
        let mut module = scenario_1_module();
        let mut fmt = MzFormat::new();
        let script = fmt.default_script(&module);
        let params = script::Parameters::new();
        crate::segment::apply_script(&mut module, &script, &params, &mut fmt).unwrap();
        for reloc in module.relocations.clone() {
            if let crate::resolve::ResolveOutcome::Resolved(r) = reloc.resolve(&module) {
                reloc.apply(&mut module, &r);
            }
        }
        fmt.set_options(&OptionMap::new()).unwrap();
        fmt.calculate_values_impl(&module).unwrap();

        assert_eq!(fmt.relocation_count, 1);
        assert_eq!(fmt.relocations[0], MzTableRelocation { segment: 0, offset: 0x10 });
        assert_eq!(fmt.header_size_paras, 2);
        assert_eq!(fmt.cs, 0);
        assert_eq!(fmt.ip, 0);
        assert_eq!(fmt.ss, 0x300);
        assert_eq!(fmt.sp, 0);
        assert_eq!(fmt.image_size, 0x2000);

        let total = fmt.header_size_paras as u64 * 16 + fmt.image_size;
        assert_eq!(total, 0x2020);
    }

    #[test]
    fn writes_expected_image_bytes() {
        let mut module = scenario_1_module();
        let mut fmt = MzFormat::new();
        let script = fmt.default_script(&module);
        let params = script::Parameters::new();
        crate::segment::apply_script(&mut module, &script, &params, &mut fmt).unwrap();
        for reloc in module.relocations.clone() {
            if let crate::resolve::ResolveOutcome::Resolved(r) = reloc.resolve(&module) {
                reloc.apply(&mut module, &r);
            }
        }
        fmt.set_options(&OptionMap::new()).unwrap();
        fmt.calculate_values_impl(&module).unwrap();

        let mut writer = MemoryWriter::new();
        fmt.write_file(&module, &mut writer).unwrap();
        let bytes = writer.into_bytes();
        assert_eq!(&bytes[0..2], b"MZ");
        let image_start = fmt.header_size_paras as usize * 16;
        assert_eq!(bytes.len(), image_start + 0x2000);
        assert!(bytes[image_start..].iter().all(|&b| b == 0x90));
    }

    #[test]
    fn relocation_from_linear_splits_large_addresses() {
        let r = MzTableRelocation::from_linear(0x20_0000);
        assert_eq!(r.linear_offset() as u64, 0x20_0000);
    }
}
