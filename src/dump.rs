//! The dumper ingestion contract (spec.md §2 "dump mode"; §4.6 `Dump`):
//! every format plugin builds one of these trees instead of printing text
//! itself, so a single front end renders every container the same way.
//!
//! The shape is a region/block/field/bitfield tree: a [`Report`] is one or
//! more [`Region`]s (the file header, the relocation table, a segment's
//! image, …), each holding [`Entry`] values in the order the format wants
//! them shown — a scalar [`Field`], a named [`Bitfield`] breakdown, or a
//! nested [`Block`] (e.g. one block per SEGDEF, one per directory entry).

use alloc::borrow::ToOwned;
use alloc::string::String;
use alloc::vec::Vec;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    UInt(u64),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    Flag(bool),
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::UInt(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Flag(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_owned())
    }
}

/// One named scalar, with an optional human-readable gloss (e.g. a magic
/// number annotated with the format name it identifies).
#[derive(Debug, Clone)]
pub struct Field {
    pub name: &'static str,
    pub value: FieldValue,
    pub annotation: Option<String>,
}

impl Field {
    pub fn new(name: &'static str, value: impl Into<FieldValue>) -> Self {
        Field {
            name,
            value: value.into(),
            annotation: None,
        }
    }

    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }
}

/// A named flags word broken into individual named bits, each reported
/// set or clear (e.g. an OMF SEGDEF attribute byte's alignment/combine/big
/// bits).
#[derive(Debug, Clone)]
pub struct Bitfield {
    pub name: &'static str,
    pub raw: u64,
    pub bits: Vec<(&'static str, bool)>,
}

impl Bitfield {
    pub fn new(name: &'static str, raw: u64) -> Self {
        Bitfield {
            name,
            raw,
            bits: Vec::new(),
        }
    }

    pub fn bit(mut self, name: &'static str, set: bool) -> Self {
        self.bits.push((name, set));
        self
    }
}

#[derive(Debug, Clone)]
pub enum Entry {
    Field(Field),
    Bitfield(Bitfield),
    Block(Block),
}

/// A named, positioned group of entries: one SEGDEF, one directory entry,
/// one relocation table row.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub name: String,
    pub offset: u64,
    pub length: u64,
    pub entries: Vec<Entry>,
}

impl Block {
    pub fn new(name: impl Into<String>, offset: u64, length: u64) -> Self {
        Block {
            name: name.into(),
            offset,
            length,
            entries: Vec::new(),
        }
    }

    pub fn field(mut self, name: &'static str, value: impl Into<FieldValue>) -> Self {
        self.entries.push(Entry::Field(Field::new(name, value)));
        self
    }

    pub fn bitfield(mut self, bitfield: Bitfield) -> Self {
        self.entries.push(Entry::Bitfield(bitfield));
        self
    }

    pub fn block(mut self, block: Block) -> Self {
        self.entries.push(Entry::Block(block));
        self
    }
}

/// A top-level division of the file (header, relocations, one region per
/// segment's image, …).
#[derive(Debug, Clone, Default)]
pub struct Region {
    pub name: String,
    pub offset: u64,
    pub length: u64,
    pub blocks: Vec<Block>,
}

impl Region {
    pub fn new(name: impl Into<String>, offset: u64, length: u64) -> Self {
        Region {
            name: name.into(),
            offset,
            length,
            blocks: Vec::new(),
        }
    }

    pub fn block(mut self, block: Block) -> Self {
        self.blocks.push(block);
        self
    }
}

/// The complete tree one `Dump()` call produces.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub format_name: &'static str,
    pub regions: Vec<Region>,
}

impl Report {
    pub fn new(format_name: &'static str) -> Self {
        Report {
            format_name,
            regions: Vec::new(),
        }
    }

    pub fn region(mut self, region: Region) -> Self {
        self.regions.push(region);
        self
    }
}

/// Render a `Report` as indented plain text, the baseline the out-of-scope
/// CLI front end's `-f dump` mode would otherwise need to reimplement
/// per-format.
#[cfg(feature = "std")]
pub fn render(report: &Report) -> String {
    let mut out = String::new();
    use core::fmt::Write as _;
    let _ = writeln!(out, "{}", report.format_name);
    for region in &report.regions {
        let _ = writeln!(out, "  {} @ {:#x} ({} bytes)", region.name, region.offset, region.length);
        for block in &region.blocks {
            render_block(&mut out, block, 2);
        }
    }
    out
}

#[cfg(feature = "std")]
fn render_block(out: &mut String, block: &Block, indent: usize) {
    use core::fmt::Write as _;
    let pad = "  ".repeat(indent);
    let _ = writeln!(out, "{pad}{} @ {:#x} ({} bytes)", block.name, block.offset, block.length);
    for entry in &block.entries {
        match entry {
            Entry::Field(f) => {
                let _ = write!(out, "{pad}  {} = {:?}", f.name, f.value);
                if let Some(a) = &f.annotation {
                    let _ = write!(out, "  ; {a}");
                }
                let _ = writeln!(out);
            }
            Entry::Bitfield(b) => {
                let _ = writeln!(out, "{pad}  {} = {:#x}", b.name, b.raw);
                for (name, set) in &b.bits {
                    let _ = writeln!(out, "{pad}    {name}: {set}");
                }
            }
            Entry::Block(nested) => render_block(out, nested, indent + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_nested_report() {
        let report = Report::new("mz").region(
            Region::new("header", 0, 0x20).block(
                Block::new("MZ header", 0, 0x20)
                    .field("signature", FieldValue::Str("MZ".to_owned()))
                    .field("last_block_size", 0x220u64)
                    .bitfield(Bitfield::new("flags", 0x3).bit("relocatable", true)),
            ),
        );
        assert_eq!(report.regions.len(), 1);
        assert_eq!(report.regions[0].blocks[0].entries.len(), 2);
    }

    #[cfg(feature = "std")]
    #[test]
    fn renders_plain_text() {
        let report = Report::new("mz")
            .region(Region::new("header", 0, 2).block(Block::new("MZ header", 0, 2).field("signature", 0x5A4Du64)));
        let text = render(&report);
        assert!(text.contains("mz"));
        assert!(text.contains("signature"));
    }
}
