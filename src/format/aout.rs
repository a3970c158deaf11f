//! UNIX a.out output (spec.md §6), grounded in
//! `examples/original_source/src/format/aout.h`'s `AOutFormat`: a 32-byte
//! fixed header (`a_info`/`a_text`/`a_data`/`a_bss`/`a_syms`/`a_entry`/
//! `a_trsize`/`a_drsize`), three images (code/data/bss), and an optional
//! simple relocation table the original notes is "only used by PDOS386
//! OMAGIC".
//!
//! The original itself marks UNIX v1 and PDP-11 a.out as `/* TODO:
//! unimplemented */` and `QMAGIC` as `TODO`; this plugin follows that same
//! scoping and implements only the 32-bit `OMAGIC`/`NMAGIC`/`ZMAGIC`
//! variants its `magic_type` enum lists as actually supported, with a
//! minimal address-only relocation table for the one system
//! (`PDOS386`) that needs one. Symbol-table emission is left out for the
//! same reason: the original's own `Symbol` class is read-side only
//! (`AttemptReadFile`), never built by `WriteFile`.

use crate::common::{Cpu, SectionFlags};
use crate::dump::{Block, Region, Report};
use crate::error::Result;
use crate::image::Image;
use crate::io::Writer;
use crate::module::Module;
use crate::relocation::RelocationKind;
use crate::script::{self, Script};
use crate::segment::{Segment as LinkSegment, SegmentSink};
use alloc::vec::Vec;

use super::options::{OptionCollector, OptionField, OptionMap};
use super::OutputFormat;

pub const HEADER_SIZE: u64 = 32;

/// `aout.h`'s `magic_type`, minus the `QMAGIC` the original marks `TODO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AoutMagic {
    /// Writable, unpaged text (`aout.h`: "the code segment is writable").
    OMagic,
    /// Read-only, shareable text, no page alignment requirement.
    NMagic,
    /// Demand-paged: the header occupies a full page so text can be
    /// mapped directly from the file.
    ZMagic,
}

impl AoutMagic {
    fn value(self) -> u32 {
        match self {
            AoutMagic::OMagic => 0x0107,
            AoutMagic::NMagic => 0x0108,
            AoutMagic::ZMagic => 0x010B,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "omagic" => Some(AoutMagic::OMagic),
            "nmagic" => Some(AoutMagic::NMagic),
            "zmagic" => Some(AoutMagic::ZMagic),
            _ => None,
        }
    }
}

/// `aout.h`'s `cpu_type`.
fn cpu_code(cpu: Option<Cpu>) -> u32 {
    match cpu {
        Some(Cpu::M68K) => 0x01,
        Some(Cpu::Sparc) => 0x03,
        Some(Cpu::I386) => 0x64,
        Some(Cpu::Arm) => 0x67,
        Some(Cpu::Mips) => 0x97,
        _ => 0x00,
    }
}

/// `aout.h`'s `system_type`: only `PDOS386` emits the simple relocation
/// table; `DJGPP1` and `UNIX` write zero-sized `a_trsize`/`a_drsize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AoutSystem {
    Unix,
    Djgpp1,
    Pdos386,
}

/// The a.out output plugin.
#[derive(Debug, Clone)]
pub struct AoutFormat {
    pub system: AoutSystem,
    magic: OptionField<alloc::string::String>,
    page_size: OptionField<u64>,
    magic_resolved: AoutMagic,
    page_size_resolved: u64,
}

impl AoutFormat {
    pub fn new(system: AoutSystem) -> Self {
        let default_magic = match system {
            // "PDOS/386 uses OMAGIC, whereas DJGPP uses ZMAGIC" (aout.h).
            AoutSystem::Pdos386 => "omagic",
            AoutSystem::Djgpp1 => "zmagic",
            AoutSystem::Unix => "zmagic",
        };
        AoutFormat {
            system,
            magic: OptionField::new("magic", "omagic, nmagic or zmagic", alloc::string::String::from(default_magic)),
            page_size: OptionField::new("page_size", "Page size for zmagic header padding", 0x1000),
            magic_resolved: AoutMagic::from_name(default_magic).unwrap(),
            page_size_resolved: 0x1000,
        }
    }
}

impl Default for AoutFormat {
    fn default() -> Self {
        Self::new(AoutSystem::Unix)
    }
}

impl SegmentSink for AoutFormat {
    fn on_new_segment(&mut self, _module: &Module, _segment: &LinkSegment, _index: crate::common::SegmentIndex) {}
}

impl OutputFormat for AoutFormat {
    fn set_options(&mut self, options: &OptionMap) -> Result<()> {
        let raw = self.magic.resolve(options)?;
        self.magic_resolved = AoutMagic::from_name(&raw).unwrap_or(self.magic_resolved);
        self.page_size_resolved = self.page_size.resolve(options)?.max(1);
        Ok(())
    }

    fn get_options(&self) -> OptionCollector {
        OptionCollector::new()
            .with_field(self.magic.name, self.magic.help)
            .with_field(self.page_size.name, self.page_size.help)
    }

    fn default_script(&self, _module: &Module) -> Script {
        script::parse(
            "\".text\" { at 0; all exec; }; \".data\" { align 4; all write and not zero; }; \".bss\" { all zero; };",
        )
        .expect("built-in a.out default script must parse")
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

    fn calculate_values(&mut self, _module: &Module) -> Result<()> {
        Ok(())
    }

    fn write_file(&self, module: &Module, writer: &mut dyn Writer) -> Result<()> {
        let text_segment = module.segments.iter().find(|s| {
            s.sections.iter().any(|&i| module.section(i).map(|sec| sec.is_executable()).unwrap_or(false))
        });
        let data_segment = module.segments.iter().find(|s| {
            !s.sections.iter().any(|&i| module.section(i).map(|sec| sec.is_executable() || sec.is_zero_filled()).unwrap_or(false))
                && s.data_size > 0
        });
        let bss_segment = module.segments.iter().find(|s| s.zero_fill > 0);

        let a_text = text_segment.map(|s| s.data_size).unwrap_or(0);
        let a_data = data_segment.map(|s| s.data_size).unwrap_or(0);
        let a_bss = bss_segment.map(|s| s.zero_fill).unwrap_or(0);

        let entry = module
            .global_symbols
            .get("_start")
            .and_then(|loc| loc.get_position(module, false))
            .unwrap_or(0);

        // PDOS386's simple relocation table: every absolute 32-bit fixup's
        // address, split by whether it falls in text or data, with no
        // symbol reference recorded (aout.h's own comment: "only used by
        // PDOS386 OMAGIC", a narrower need than a full relocation entry).
        let mut code_relocations: Vec<u32> = Vec::new();
        let mut data_relocations: Vec<u32> = Vec::new();
        if self.system == AoutSystem::Pdos386 {
            for reloc in &module.relocations {
                if reloc.reference.is_some() || reloc.kind != RelocationKind::Direct || reloc.size != 4 {
                    continue;
                }
                let Some(pos) = reloc.source.get_position(module, false) else { continue };
                if Some(reloc.source.section) == text_segment.and_then(|s| s.sections.first().copied()) {
                    code_relocations.push(pos as u32);
                } else {
                    data_relocations.push(pos as u32);
                }
            }
        }
        let a_trsize = code_relocations.len() as u32 * 4;
        let a_drsize = data_relocations.len() as u32 * 4;

        writer.seek(0);
        let a_info = (cpu_code(module.cpu) << 16) | self.magic_resolved.value();
        writer.write_word(4, a_info as u64, Default::default());
        writer.write_word(4, a_text, Default::default());
        writer.write_word(4, a_data, Default::default());
        writer.write_word(4, a_bss, Default::default());
        writer.write_word(4, 0, Default::default()); // a_syms: no symbol table emitted
        writer.write_word(4, entry, Default::default());
        writer.write_word(4, a_trsize as u64, Default::default());
        writer.write_word(4, a_drsize as u64, Default::default());

        if self.magic_resolved == AoutMagic::ZMagic {
            writer.fill_to(self.page_size_resolved);
        }

        if let Some(segment) = text_segment {
            for &section_index in &segment.sections {
                if let Some(section) = module.section(section_index) {
                    section.write_to(writer, 0, section.size());
                }
            }
        }
        if let Some(segment) = data_segment {
            for &section_index in &segment.sections {
                if let Some(section) = module.section(section_index) {
                    section.write_to(writer, 0, section.size());
                }
            }
        }
        for address in &code_relocations {
            writer.write_word(4, *address as u64, Default::default());
        }
        for address in &data_relocations {
            writer.write_word(4, *address as u64, Default::default());
        }

        Ok(())
    }

    fn dump(&self, module: &Module) -> Report {
        let region = Region::new("header", 0, HEADER_SIZE).block(
            Block::new("a.out header", 0, HEADER_SIZE)
                .field("magic", self.magic_resolved.value() as u64)
                .field("cpu", cpu_code(module.cpu) as u64),
        );
        Report::new("aout").region(region)
    }

    fn default_extension(&self) -> &'static str {
        ""
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
    fn omagic_header_has_no_page_padding() {
        let mut module = Module::new();
        module.cpu = Some(Cpu::I386);
        let code = module.add_section(
            Section::new(".text", SectionFlags::EXECUTABLE).with_data(Buffer::from_bytes(alloc::vec![0x90u8; 16])),
        );
        module.define_global("_start", Location::new(code, 0));

        let mut fmt = AoutFormat::new(AoutSystem::Pdos386);
        let mut options = OptionMap::new();
        options.insert("magic".into(), "omagic".into());
        fmt.set_options(&options).unwrap();
        let script = fmt.default_script(&module);
        let params = script::Parameters::new();
        crate::segment::apply_script(&mut module, &script, &params, &mut fmt).unwrap();
        fmt.calculate_values(&module).unwrap();

        let mut writer = MemoryWriter::new();
        fmt.write_file(&module, &mut writer).unwrap();
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE as usize + 16);
        let a_info = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(a_info & 0xFFFF, 0x0107);
    }

    #[test]
    fn zmagic_pads_header_to_page_size() {
        let mut module = Module::new();
        let code = module.add_section(
            Section::new(".text", SectionFlags::EXECUTABLE).with_data(Buffer::from_bytes(alloc::vec![0x90u8; 16])),
        );
        module.define_global("_start", Location::new(code, 0));
        let mut fmt = AoutFormat::new(AoutSystem::Djgpp1);
        fmt.set_options(&OptionMap::new()).unwrap();
        let script = fmt.default_script(&module);
        let params = script::Parameters::new();
        crate::segment::apply_script(&mut module, &script, &params, &mut fmt).unwrap();
        fmt.calculate_values(&module).unwrap();
        let mut writer = MemoryWriter::new();
        fmt.write_file(&module, &mut writer).unwrap();
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), 0x1000 + 16);
    }
}
