//! Format detection and tag-alias resolution (spec.md §4.6 "Format
//! detection (registry)", §6 `-f format-tag`).
//!
//! A flat list of `(magic, offset, tag, description, verifier)` entries is
//! matched linearly against a file's head, the same way `formats.cc` in
//! the original walks its own table top to bottom and stops at the first
//! match whose optional verifier (if any) also accepts the bytes.

/// One entry in the magic-sniffing table.
pub struct MagicEntry {
    pub magic: &'static [u8],
    pub offset: u64,
    pub tag: &'static str,
    pub description: &'static str,
    /// Disambiguates colliding magics (spec.md §4.6: "CP/M-86 cmd vs
    /// little-endian a.out with magic `01 01`"). Returns `true` to accept.
    pub verify: Option<fn(&[u8]) -> bool>,
}

fn verify_mz_not_ne_stub(data: &[u8]) -> bool {
    // A plain MZ .exe has either no new-header pointer or one that points
    // past the end of the file / at non-"NE"/"LE"/"PE" bytes; those cases
    // are claimed by their own higher-priority entries earlier in the
    // table, so this entry only needs to reject when one of those also
    // matches, which the linear-scan "first match wins" rule already does.
    data.len() >= 2
}

fn verify_new_header(data: &[u8], tag: &[u8]) -> bool {
    if data.len() < 0x40 {
        return false;
    }
    let lfanew = u32::from_le_bytes([data[0x3C], data[0x3D], data[0x3E], data[0x3F]]) as usize;
    data.get(lfanew..lfanew + tag.len()) == Some(tag)
}

fn verify_ne(data: &[u8]) -> bool {
    verify_new_header(data, b"NE")
}

fn verify_le(data: &[u8]) -> bool {
    verify_new_header(data, b"LE") || verify_new_header(data, b"LX")
}

fn verify_pe(data: &[u8]) -> bool {
    verify_new_header(data, b"PE\0\0")
}

/// a.out little-endian `OMAGIC` (`01 01`) collides with CP/M-86 `.cmd`'s
/// first group-descriptor byte; a.out additionally requires the file to be
/// at least as long as its fixed header.
fn verify_aout_magic(data: &[u8]) -> bool {
    data.len() >= 32
}

pub const REGISTRY: &[MagicEntry] = &[
    MagicEntry {
        magic: &[0x7F, b'E', b'L', b'F'],
        offset: 0,
        tag: "elf",
        description: "Executable and Linkable Format",
        verify: None,
    },
    MagicEntry {
        magic: b"MZ",
        offset: 0,
        tag: "mz",
        description: "MS-DOS MZ executable",
        verify: Some(verify_mz_not_ne_stub),
    },
    MagicEntry {
        magic: b"ZM",
        offset: 0,
        tag: "mz",
        description: "MS-DOS MZ executable (ZM variant)",
        verify: None,
    },
    MagicEntry {
        magic: b"DL",
        offset: 0,
        tag: "mz",
        description: "HP 100LX/200LX System Manager module",
        verify: None,
    },
    MagicEntry {
        magic: &[0x03, 0xF3],
        offset: 0,
        tag: "hunk",
        description: "Amiga Hunk executable",
        verify: None,
    },
    MagicEntry {
        magic: &[0x4C, 0x01],
        offset: 0,
        tag: "coff",
        description: "COFF (i386 COFF)",
        verify: None,
    },
    // a.out's magic collides with CP/M-86's first group-descriptor byte
    // pair; listed last so any of the above take priority, matching the
    // "verifiers resolve collisions" rule (spec.md §4.6).
    MagicEntry {
        magic: &[0x01, 0x01],
        offset: 0,
        tag: "aout",
        description: "UNIX a.out (little-endian OMAGIC)",
        verify: Some(verify_aout_magic),
    },
    MagicEntry {
        magic: &[0x80],
        offset: 0,
        tag: "omf",
        description: "Intel OMF object (THEADR record)",
        verify: None,
    },
];

/// Detect `data`'s format, honoring the MZ-stub nesting rule (spec.md
/// §4.6: "an MZ container is inspected at its `e_lfanew` ... for
/// piggybacked new-style headers"): an outer MZ match is reclassified as
/// NE/LE/LX/PE if a recognizable new header sits at offset `0x3C`.
pub fn detect(data: &[u8]) -> Option<&'static MagicEntry> {
    let outer = REGISTRY.iter().find(|entry| {
        let start = entry.offset as usize;
        let end = start + entry.magic.len();
        data.get(start..end) == Some(entry.magic) && entry.verify.map_or(true, |v| v(data))
    })?;
    if outer.tag == "mz" {
        if verify_pe(data) {
            return Some(&PE_ENTRY_AT_LFANEW);
        }
        if verify_ne(data) {
            return Some(&NE_ENTRY_AT_LFANEW);
        }
        if verify_le(data) {
            return Some(&LE_ENTRY_AT_LFANEW);
        }
    }
    Some(outer)
}

const NE_ENTRY_AT_LFANEW: MagicEntry = MagicEntry {
    magic: b"NE",
    offset: 0,
    tag: "ne",
    description: "Windows/OS2 16-bit New Executable",
    verify: None,
};

const LE_ENTRY_AT_LFANEW: MagicEntry = MagicEntry {
    magic: b"LE",
    offset: 0,
    tag: "le",
    description: "Linear Executable",
    verify: None,
};

const PE_ENTRY_AT_LFANEW: MagicEntry = MagicEntry {
    magic: b"PE\0\0",
    offset: 0,
    tag: "pe",
    description: "Portable Executable",
    verify: None,
};

/// Resolve a `-f` alias to the canonical registry tag it builds
/// (spec.md §6: "the registry maps many spellings to one producer, e.g.
/// `win`, `win16`, `ne` all build an NE writer").
pub fn alias_to_tag(alias: &str) -> Option<&'static str> {
    Some(match alias {
        "mz" | "exe" | "dos" => "mz",
        "pif" | "exm" => "mz",
        "cpm86" | "cmd_small" | "cmd_compact" | "cmd_large" => "cpm86",
        "ne" | "win" | "win16" | "os2v1" => "ne",
        "le" | "le32" => "le",
        "lx" | "os2v2" => "le",
        "pe" | "win32" | "pe32" | "pe32+" => "pe",
        "coff" | "coff_i386" | "coff_m68k" => "coff",
        "elf" | "elf32" | "elf64" => "elf",
        "aout" | "a.out" | "zmagic" | "qmagic" | "omagic" | "nmagic" => "aout",
        "hunk" | "amigahunk" => "hunk",
        "omf" | "obj" => "omf",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_plain_mz() {
        let mut data = alloc::vec![0u8; 0x40];
        data[0] = b'M';
        data[1] = b'Z';
        assert_eq!(detect(&data).unwrap().tag, "mz");
    }

    #[test]
    fn detects_ne_over_its_mz_stub() {
        let mut data = alloc::vec![0u8; 0x42];
        data[0] = b'M';
        data[1] = b'Z';
        data[0x3C..0x40].copy_from_slice(&0x40u32.to_le_bytes());
        data[0x40] = b'N';
        data[0x41] = b'E';
        assert_eq!(detect(&data).unwrap().tag, "ne");
    }

    #[test]
    fn aliases_resolve_to_canonical_tags() {
        assert_eq!(alias_to_tag("win16"), Some("ne"));
        assert_eq!(alias_to_tag("os2v2"), Some("le"));
        assert_eq!(alias_to_tag("nonsense"), None);
    }
}
