//! Intel OMF (relocatable object) input, grounded in the public Intel OMF
//! record grammar and the same "big flat record stream" shape used
//! throughout this corpus's 16-bit toolchains (the NE/LE readers in
//! sibling modules parse the MZ-family container this same object format
//! was usually linked into). OMF is exclusively an *input* format in the
//! original RetroLinker (`examples/original_source`) does not emit it
//! either — its own outputs are always a finished executable, never a
//! relinkable object — but `spec.md` §6 lists it as in-scope container, so
//! this module also implements a minimal compatible writer for round-trip
//! testing and for producing intermediate `.obj` files.
//!
//! Simplifications (spec.md §1 Non-goals: "byte-exact fidelity to any
//! specific vendor linker beyond what a *compatibility flag* selects"):
//! GRPDEF-relative and frame-number fixups collapse to an absolute
//! displacement with a diagnostic rather than tracking group base
//! addresses; THREAD subrecords (FIXUPP's own fixup-compression scheme)
//! are skipped, matching real linkers' tolerance for objects that don't
//! use them.

mod records;

use crate::common::{Cpu, SectionFlags};
use crate::diagnostics::diag_warn;
use crate::dump::{Block, Region, Report};
use crate::error::{Error, Result};
use crate::image::Buffer;
use crate::io::Writer;
use crate::module::Module;
use crate::relocation::{Relocation, RelocationKind};
use crate::script::{self, Script};
use crate::section::Section;
use crate::segment::{Segment, SegmentSink};
use crate::symbol::{Location, SymbolName, Target};
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use super::options::{OptionCollector, OptionMap};
use super::{InputFormat, OutputFormat};
use records::{read_index, read_name, Record, RecordCursor};

#[derive(Debug, Clone)]
struct SegDef {
    name: String,
    length: u64,
    is_32bit: bool,
    buffer: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Public {
    name: String,
    segment: u16,
    offset: u64,
}

#[derive(Debug, Clone)]
struct Fixup {
    segment: u16,
    offset: u64,
    size: u8,
    self_relative: bool,
    target: FixupTarget,
    displacement: i64,
}

#[derive(Debug, Clone)]
enum FixupTarget {
    Segment(u16),
    External(String),
    Absolute,
}

#[derive(Debug, Clone, Default)]
struct Common {
    name: String,
    size: u64,
    alignment: u64,
}

/// The parsed Intel OMF object, kept in a form close to the record stream
/// (spec.md §4.6 "populate the plugin's own in-memory representation")
/// before [`InputFormat::generate_module`] translates it.
#[derive(Debug)]
pub struct OmfFormat {
    module_name: Option<String>,
    lnames: Vec<String>,
    segments: Vec<SegDef>,
    externs: Vec<String>,
    publics: Vec<Public>,
    fixups: Vec<Fixup>,
    commons: Vec<Common>,
}

impl Default for OmfFormat {
    fn default() -> Self {
        OmfFormat {
            module_name: None,
            lnames: Vec::new(),
            segments: Vec::new(),
            externs: Vec::new(),
            publics: Vec::new(),
            fixups: Vec::new(),
            commons: Vec::new(),
        }
    }
}

impl OmfFormat {
    pub fn new() -> Self {
        Self::default()
    }

    fn segment_name(&self, name_index: u16) -> String {
        self.lnames
            .get(name_index.wrapping_sub(1) as usize)
            .cloned()
            .unwrap_or_default()
    }
}

/// Variable-length OMF "communal length" encoding used by COMDEF: a byte
/// below 0x80 is a literal value; 0x81/0x84 introduce a following 2- or
/// 4-byte little-endian count.
fn read_comdef_length(body: &[u8], pos: usize) -> Result<(u64, usize)> {
    let tag = *body.get(pos).ok_or(Error("truncated COMDEF length"))?;
    match tag {
        0x81 => {
            let bytes = body.get(pos + 1..pos + 3).ok_or(Error("truncated COMDEF length"))?;
            Ok((u16::from_le_bytes([bytes[0], bytes[1]]) as u64, pos + 3))
        }
        0x84 => {
            let bytes = body.get(pos + 1..pos + 4).ok_or(Error("truncated COMDEF length"))?;
            Ok((
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]) as u64,
                pos + 4,
            ))
        }
        0x88 => {
            let bytes = body.get(pos + 1..pos + 5).ok_or(Error("truncated COMDEF length"))?;
            Ok((
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64,
                pos + 5,
            ))
        }
        n if n < 0x80 => Ok((n as u64, pos + 1)),
        _ => Err(Error("unsupported COMDEF length encoding")),
    }
}

impl<'data> InputFormat<'data> for OmfFormat {
    type Data = &'data [u8];

    fn read_file(data: &'data [u8]) -> Result<Self> {
        let mut fmt = OmfFormat::new();
        let mut current_segment: Option<u16> = None;
        let mut current_base: u64 = 0;

        for record in RecordCursor::new(data) {
            let Record { kind, body } = record?;
            match kind {
                records::THEADR => {
                    let (name, _) = read_name(body, 0)?;
                    fmt.module_name = Some(name.to_string());
                }
                records::LNAMES => {
                    let mut pos = 0;
                    while pos < body.len() {
                        let (name, next) = read_name(body, pos)?;
                        fmt.lnames.push(name.to_string());
                        pos = next;
                    }
                }
                records::SEGDEF | records::SEGDEF32 => {
                    let is_32bit = kind == records::SEGDEF32;
                    let attr = *body.first().ok_or(Error("truncated SEGDEF"))?;
                    let align_code = (attr >> 5) & 0x7;
                    let big = attr & 0x02 != 0;
                    let mut pos = 1;
                    if align_code == 0 {
                        // Absolute segment: 2-byte frame + 1-byte offset
                        // precede the length, which this crate's flat
                        // section model has no use for beyond skipping
                        // correctly.
                        pos += 3;
                    }
                    let length = if is_32bit {
                        let bytes = body.get(pos..pos + 4).ok_or(Error("truncated SEGDEF length"))?;
                        pos += 4;
                        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64
                    } else {
                        let bytes = body.get(pos..pos + 2).ok_or(Error("truncated SEGDEF length"))?;
                        pos += 2;
                        u16::from_le_bytes([bytes[0], bytes[1]]) as u64
                    };
                    let length = if length == 0 && big {
                        if is_32bit {
                            0x1_0000_0000
                        } else {
                            0x1_0000
                        }
                    } else {
                        length
                    };
                    let (name_index, next) = read_index(body, pos)?;
                    pos = next;
                    let _ = read_index(body, pos); // class index, unused beyond the section name
                    let name = fmt.segment_name(name_index);
                    fmt.segments.push(SegDef {
                        name,
                        length,
                        is_32bit,
                        buffer: alloc::vec![0u8; length as usize],
                    });
                }
                records::LEDATA | records::LEDATA32 => {
                    let is_32bit = kind == records::LEDATA32;
                    let (seg_index, mut pos) = read_index(body, 0)?;
                    let offset = if is_32bit {
                        let bytes = body.get(pos..pos + 4).ok_or(Error("truncated LEDATA offset"))?;
                        pos += 4;
                        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64
                    } else {
                        let bytes = body.get(pos..pos + 2).ok_or(Error("truncated LEDATA offset"))?;
                        pos += 2;
                        u16::from_le_bytes([bytes[0], bytes[1]]) as u64
                    };
                    let data = &body[pos..];
                    current_segment = Some(seg_index);
                    current_base = offset;
                    if let Some(seg) = fmt.segments.get_mut(seg_index.wrapping_sub(1) as usize) {
                        let end = offset as usize + data.len();
                        if end > seg.buffer.len() {
                            seg.buffer.resize(end, 0);
                        }
                        seg.buffer[offset as usize..end].copy_from_slice(data);
                    }
                }
                records::PUBDEF | records::PUBDEF32 => {
                    let is_32bit = kind == records::PUBDEF32;
                    let (group_index, mut pos) = read_index(body, 0)?;
                    let _ = group_index;
                    let (seg_index, next) = read_index(body, pos)?;
                    pos = next;
                    if seg_index == 0 {
                        pos += 2; // frame number for absolute publics, unsupported beyond skipping
                    }
                    while pos < body.len() {
                        let (name, next) = read_name(body, pos)?;
                        pos = next;
                        let offset = if is_32bit {
                            let bytes = body.get(pos..pos + 4).ok_or(Error("truncated PUBDEF offset"))?;
                            pos += 4;
                            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64
                        } else {
                            let bytes = body.get(pos..pos + 2).ok_or(Error("truncated PUBDEF offset"))?;
                            pos += 2;
                            u16::from_le_bytes([bytes[0], bytes[1]]) as u64
                        };
                        let (_type_index, next) = read_index(body, pos)?;
                        pos = next;
                        fmt.publics.push(Public {
                            name: name.to_string(),
                            segment: seg_index,
                            offset,
                        });
                    }
                }
                records::EXTDEF => {
                    let mut pos = 0;
                    while pos < body.len() {
                        let (name, next) = read_name(body, pos)?;
                        pos = next;
                        let (_type_index, next) = read_index(body, pos)?;
                        pos = next;
                        fmt.externs.push(name.to_string());
                    }
                }
                records::COMDEF => {
                    let mut pos = 0;
                    while pos < body.len() {
                        let (name, next) = read_name(body, pos)?;
                        pos = next;
                        let (_type_index, next) = read_index(body, pos)?;
                        pos = next;
                        let data_type = *body.get(pos).ok_or(Error("truncated COMDEF"))?;
                        pos += 1;
                        let (count_or_size, next) = read_comdef_length(body, pos)?;
                        pos = next;
                        let (size, alignment) = if data_type == 0x61 {
                            // far data: element count followed by element size
                            let (elem_size, next) = read_comdef_length(body, pos)?;
                            pos = next;
                            (count_or_size * elem_size, elem_size.max(1))
                        } else {
                            (count_or_size, count_or_size.min(16).max(1))
                        };
                        fmt.commons.push(Common {
                            name: name.to_string(),
                            size,
                            alignment,
                        });
                    }
                }
                records::FIXUPP | records::FIXUPP32 => {
                    let is_32bit = kind == records::FIXUPP32;
                    let Some(segment) = current_segment else {
                        diag_warn!("omf", "FIXUPP record with no preceding LEDATA, skipped");
                        continue;
                    };
                    let mut pos = 0;
                    while pos < body.len() {
                        let first = body[pos];
                        if first & 0x80 == 0 {
                            // THREAD subrecord: not supported, skip its
                            // one datum byte/index and move on.
                            pos += 1;
                            if pos < body.len() {
                                let (_, next) = read_index(body, pos).unwrap_or((0, pos + 1));
                                pos = next;
                            }
                            continue;
                        }
                        let self_relative = first & 0x40 == 0;
                        let locat = (first >> 2) & 0xF;
                        let offset_hi = (first & 0x3) as u64;
                        let offset_lo = *body.get(pos + 1).ok_or(Error("truncated FIXUP"))? as u64;
                        let fixup_offset = (offset_hi << 8) | offset_lo;
                        pos += 2;
                        let fixdata = *body.get(pos).ok_or(Error("truncated FIXUP"))?;
                        pos += 1;
                        let frame_by_thread = fixdata & 0x80 != 0;
                        let frame_method = (fixdata >> 4) & 0x7;
                        let target_by_thread = fixdata & 0x08 != 0;
                        let target_method = fixdata & 0x7;

                        if !frame_by_thread {
                            match frame_method {
                                0 | 1 | 2 => {
                                    let (_, next) = read_index(body, pos)?;
                                    pos = next;
                                }
                                3 => pos += 2,
                                _ => {}
                            }
                        }

                        let target = if !target_by_thread {
                            match target_method & 0x3 {
                                0 => {
                                    let (seg, next) = read_index(body, pos)?;
                                    pos = next;
                                    FixupTarget::Segment(seg)
                                }
                                1 => {
                                    let (_grp, next) = read_index(body, pos)?;
                                    pos = next;
                                    FixupTarget::Absolute
                                }
                                2 => {
                                    let (ext, next) = read_index(body, pos)?;
                                    pos = next;
                                    fmt.externs
                                        .get(ext.wrapping_sub(1) as usize)
                                        .cloned()
                                        .map(FixupTarget::External)
                                        .unwrap_or(FixupTarget::Absolute)
                                }
                                _ => FixupTarget::Absolute,
                            }
                        } else {
                            FixupTarget::Absolute
                        };

                        let has_displacement = target_by_thread || target_method & 0x4 == 0;
                        let displacement = if has_displacement {
                            if is_32bit || matches!(locat, 5 | 9 | 13) {
                                let bytes = body.get(pos..pos + 4).ok_or(Error("truncated FIXUP displacement"))?;
                                pos += 4;
                                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64
                            } else {
                                let bytes = body.get(pos..pos + 2).ok_or(Error("truncated FIXUP displacement"))?;
                                pos += 2;
                                i16::from_le_bytes([bytes[0], bytes[1]]) as i64
                            }
                        } else {
                            0
                        };

                        let size = match locat {
                            0 | 4 => 1,
                            1 | 2 => 2,
                            3 | 6 => {
                                diag_warn!("omf", "far-pointer FIXUP location types are not supported, skipped");
                                continue;
                            }
                            5 | 9 | 13 => 4,
                            _ => {
                                diag_warn!("omf", "unsupported FIXUP location type {locat}, skipped");
                                continue;
                            }
                        };

                        fmt.fixups.push(Fixup {
                            segment,
                            offset: current_base + fixup_offset,
                            size,
                            self_relative,
                            target,
                            displacement,
                        });
                    }
                }
                records::MODEND | records::MODEND32 => break,
                records::COMENT | records::GRPDEF => {}
                _ => {
                    diag_warn!("omf", "unrecognized OMF record type {kind:#x}, skipped");
                }
            }
        }

        Ok(fmt)
    }

    fn generate_module(&self, module: &mut Module) -> Result<()> {
        module.cpu.get_or_insert(Cpu::I86);
        let mut section_for_segment: BTreeMap<u16, crate::common::SectionIndex> = BTreeMap::new();

        for (zero_based, seg) in self.segments.iter().enumerate() {
            let flags = if seg.name.to_ascii_uppercase().contains("CODE") {
                SectionFlags::EXECUTABLE | SectionFlags::READABLE
            } else if seg.name.to_ascii_uppercase().contains("BSS")
                || seg.name.to_ascii_uppercase().contains("STACK")
            {
                SectionFlags::WRITABLE | SectionFlags::ZERO_FILLED
            } else {
                SectionFlags::READABLE | SectionFlags::WRITABLE
            };
            let section = module.add_section(
                Section::new(seg.name.clone(), flags)
                    .with_alignment(if seg.is_32bit { 4 } else { 2 })
                    .with_data(Buffer::from_bytes(seg.buffer.clone())),
            );
            section_for_segment.insert((zero_based + 1) as u16, section);
        }

        for public in &self.publics {
            if let Some(&section) = section_for_segment.get(&public.segment) {
                module.define_global(public.name.clone(), Location::new(section, public.offset));
            }
        }

        for common in &self.commons {
            module.contribute_common(common.name.clone(), common.size, common.alignment);
        }

        for fixup in &self.fixups {
            let Some(&source_section) = section_for_segment.get(&fixup.segment) else {
                continue;
            };
            let source = Location::new(source_section, fixup.offset);
            let (target, addend) = match &fixup.target {
                FixupTarget::Segment(seg) => match section_for_segment.get(seg) {
                    Some(&section) => (Target::Location(Location::new(section, 0)), fixup.displacement),
                    None => (Target::Absolute(0), fixup.displacement),
                },
                FixupTarget::External(name) => (Target::Symbol(SymbolName::internal(name.clone())), fixup.displacement),
                FixupTarget::Absolute => (Target::Absolute(fixup.displacement as u64), 0),
            };
            let mut reloc = Relocation::new(source, target, RelocationKind::Direct, fixup.size).with_addend(addend);
            if fixup.self_relative {
                reloc = reloc.with_reference(Target::Location(source)).with_addend(addend - fixup.size as i64);
            }
            module.add_relocation(reloc);
        }

        Ok(())
    }
}

impl SegmentSink for OmfFormat {
    fn on_new_segment(&mut self, _module: &Module, _segment: &Segment, _index: crate::common::SegmentIndex) {}
}

impl OutputFormat for OmfFormat {
    fn set_options(&mut self, _options: &OptionMap) -> Result<()> {
        Ok(())
    }

    fn get_options(&self) -> OptionCollector {
        OptionCollector::new()
    }

    fn default_script(&self, _module: &Module) -> Script {
        // Every section becomes its own segment: OMF objects carry no
        // absolute addresses, only a sequence of independently relocatable
        // segments (spec.md §4.3's `for` template is exactly this case).
        script::parse("for any { all any; };").expect("built-in OMF default script must parse")
    }

    fn supports_segmentation(&self) -> bool {
        true
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
        write_record(writer, records::THEADR, |body| {
            write_name(body, "retrolink");
        });

        for (_, section) in module.sections() {
            write_record(writer, records::LNAMES, |body| {
                write_name(body, &section.name);
            });
        }

        for (index, section) in module.sections() {
            write_record(writer, records::SEGDEF, |body| {
                let align_code = 3u8; // paragraph
                let combine = 2u8; // public
                let attr = (align_code << 5) | (combine << 2);
                body.push(attr);
                body.extend_from_slice(&(section.footprint().min(0xFFFF) as u16).to_le_bytes());
                body.push((index.0 + 1) as u8); // name index (1-based, matches LNAMES emission order)
                body.push((index.0 + 1) as u8); // class index: reuse the same LNAMES slot
                body.push(0); // overlay index: none
            });
        }

        for (index, section) in module.sections() {
            let data = section.data.as_bytes();
            for chunk_start in (0..data.len()).step_by(1024) {
                let chunk_end = (chunk_start + 1024).min(data.len());
                write_record(writer, records::LEDATA, |body| {
                    body.push((index.0 + 1) as u8);
                    body.extend_from_slice(&(chunk_start as u16).to_le_bytes());
                    body.extend_from_slice(&data[chunk_start..chunk_end]);
                });
            }
        }

        let mut externs: Vec<String> = Vec::new();
        for reloc in &module.relocations {
            if let Target::Symbol(name) = &reloc.target {
                if module.global_symbols.get(name.load_name().unwrap_or("")).is_none() {
                    if let Some(n) = name.load_name() {
                        if !externs.iter().any(|e| e == n) {
                            externs.push(n.to_string());
                        }
                    }
                }
            }
        }
        if !externs.is_empty() {
            write_record(writer, records::EXTDEF, |body| {
                for name in &externs {
                    write_name(body, name);
                    body.push(0);
                }
            });
        }

        for reloc in &module.relocations {
            let seg_index = reloc.source.section.0 as u8 + 1;
            write_record(writer, records::FIXUPP, |body| {
                let locat: u8 = match reloc.size {
                    1 => 0,
                    2 => 1,
                    4 => 5,
                    _ => 1,
                };
                let first = 0x80 | (locat << 2) | (((reloc.source.offset >> 8) & 0x3) as u8);
                body.push(first);
                body.push((reloc.source.offset & 0xFF) as u8);
                match &reloc.target {
                    Target::Symbol(name) => {
                        let index = externs
                            .iter()
                            .position(|e| Some(e.as_str()) == name.load_name())
                            .map(|i| i as u16 + 1)
                            .unwrap_or(1);
                        body.push(0x80 | 0x02); // frame=target-determined, target method=EXTDEF
                        body.push((index & 0xFF) as u8);
                    }
                    _ => {
                        body.push(0x80 | 0x00); // frame=target-determined, target method=SEGDEF
                        body.push(seg_index);
                    }
                }
            });
        }

        for (name, loc) in &module.global_symbols {
            write_record(writer, records::PUBDEF, |body| {
                body.push(0); // group index: none
                body.push((loc.section.0 + 1) as u8);
                write_name(body, name);
                body.extend_from_slice(&(loc.offset as u16).to_le_bytes());
                body.push(0); // type index
            });
        }

        write_record(writer, records::MODEND, |body| {
            body.push(0);
        });
        Ok(())
    }

    fn dump(&self, module: &Module) -> Report {
        let mut region = Region::new("segments", 0, 0);
        for (index, section) in module.sections() {
            region = region.block(
                Block::new(format!("segment[{}]", index.0), 0, section.footprint())
                    .field("name", section.name.clone())
                    .field("size", section.footprint()),
            );
        }
        Report::new("omf").region(region)
    }

    fn default_extension(&self) -> &'static str {
        "obj"
    }
}

fn write_name(body: &mut Vec<u8>, name: &str) {
    body.push(name.len() as u8);
    body.extend_from_slice(name.as_bytes());
}

fn write_record(writer: &mut dyn Writer, kind: u8, build: impl FnOnce(&mut Vec<u8>)) {
    let mut body = Vec::new();
    build(&mut body);
    writer.write_data(&[kind]);
    // length field counts the body plus the trailing checksum byte.
    writer.write_data(&((body.len() as u16 + 1).to_le_bytes()));
    writer.write_data(&body);
    writer.write_data(&[0]); // checksum: unchecked by virtually every reader
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SectionIndex;
    use crate::io::MemoryWriter;

    fn build(kind: u8, body: &[u8]) -> Vec<u8> {
        let mut out = alloc::vec![kind];
        out.extend_from_slice(&((body.len() as u16 + 1).to_le_bytes()));
        out.extend_from_slice(body);
        out.push(0);
        out
    }

    #[test]
    fn parses_theadr_lnames_segdef_ledata_pubdef() {
        // THEADR body: length-prefixed name "abcd"
        let mut data = build(records::THEADR, &[4, b'a', b'b', b'c', b'd']);
        data.extend(build(records::LNAMES, &[4, b'C', b'O', b'D', b'E']));
        // SEGDEF: attr (align=para<<5 | combine=public<<2), length=0x10, name_idx=1, class_idx=1, overlay=0
        data.extend(build(records::SEGDEF, &[(3 << 5) | (2 << 2), 0x10, 0x00, 1, 1, 0]));
        // LEDATA: seg=1, offset=0, data=[0x90;4]
        data.extend(build(records::LEDATA, &[1, 0, 0, 0x90, 0x90, 0x90, 0x90]));
        // PUBDEF: group=0, seg=1, name="foo", offset=2, type=0
        data.extend(build(records::PUBDEF, &[0, 1, 3, b'f', b'o', b'o', 2, 0, 0]));

        let parsed = OmfFormat::read_file(&data).unwrap();
        assert_eq!(parsed.module_name.as_deref(), Some("abcd"));
        assert_eq!(parsed.segments.len(), 1);
        assert_eq!(parsed.segments[0].name, "CODE");
        assert_eq!(&parsed.segments[0].buffer[0..4], &[0x90, 0x90, 0x90, 0x90]);
        assert_eq!(parsed.publics.len(), 1);
        assert_eq!(parsed.publics[0].name, "foo");
        assert_eq!(parsed.publics[0].offset, 2);

        let mut module = Module::new();
        parsed.generate_module(&mut module).unwrap();
        assert_eq!(module.section_count(), 1);
        assert_eq!(module.global_symbols.get("foo"), Some(&Location::new(SectionIndex(0), 2)));
    }

    #[test]
    fn writer_round_trips_a_public_symbol() {
        let mut module = Module::new();
        let code = module.add_section(Section::new(".code", SectionFlags::EXECUTABLE).with_data(Buffer::from_bytes(alloc::vec![0x90; 4])));
        module.define_global("entry", Location::new(code, 0));
        let mut fmt = OmfFormat::new();
        let mut writer = MemoryWriter::new();
        fmt.write_file(&module, &mut writer).unwrap();
        let bytes = writer.into_bytes();
        assert_eq!(bytes[0], records::THEADR);
        assert!(bytes.len() > 10);
    }
}
