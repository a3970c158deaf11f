//! The reflective `string -> string` option map every output plugin's
//! `SetOptions`/`GetOptions` round-trips through (spec.md §9: "Dynamically
//! typed option maps... a per-plugin typed struct built by a small
//! reflective helper that calls `ParseValue<T>(name)` per field").
//!
//! Grounded in `examples/original_source/src/linker/options.h`'s
//! `ParseValue<T>`/`Option<T>`/`OptionCollector` templates: a value knows
//! how to parse itself from one string, a named field pairs a default with
//! a name and help text, and a collector is just the list of such fields a
//! plugin exposes for `-S key=value` to populate.

use crate::error::{Error, Result};
use alloc::borrow::ToOwned;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

pub type OptionMap = BTreeMap<String, String>;

/// A type that can be parsed out of one raw `-S key=value` string.
pub trait ParseValue: Sized {
    fn parse_value(raw: &str) -> Result<Self>;
}

impl ParseValue for String {
    fn parse_value(raw: &str) -> Result<Self> {
        Ok(raw.to_owned())
    }
}

impl ParseValue for bool {
    fn parse_value(raw: &str) -> Result<Self> {
        Ok(!matches!(raw, "0" | "false" | "no" | "off"))
    }
}

/// Parses the same way `std::stoll(value, nullptr, 0)` does: a `0x`/`0`
/// prefix selects the base, same as the original's base-0 `strtoll`.
impl ParseValue for u64 {
    fn parse_value(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (digits, radix) = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            (hex, 16)
        } else if raw.len() > 1 && raw.starts_with('0') {
            (&raw[1..], 8)
        } else {
            (raw, 10)
        };
        u64::from_str_radix(digits, radix).map_err(|_| Error("could not parse option value as an integer"))
    }
}

impl<T: ParseValue> ParseValue for Option<T> {
    fn parse_value(raw: &str) -> Result<Self> {
        Ok(Some(T::parse_value(raw)?))
    }
}

impl<T: ParseValue> ParseValue for Vec<T> {
    fn parse_value(raw: &str) -> Result<Self> {
        raw.split(',').map(T::parse_value).collect()
    }
}

/// One named, typed, defaulted option. A plugin declares one of these per
/// configurable knob (`stub_path`, `stack`, `memory_model`, `header_align`,
/// …) and reads it back with [`OptionField::resolve`] once `SetOptions` has
/// handed it the shared map.
#[derive(Debug, Clone)]
pub struct OptionField<T> {
    pub name: &'static str,
    pub help: &'static str,
    pub default: T,
}

impl<T: ParseValue + Clone> OptionField<T> {
    pub const fn new(name: &'static str, help: &'static str, default: T) -> Self {
        OptionField { name, help, default }
    }

    /// Look `self.name` up in `options`, parse it if present, else fall
    /// back to `self.default` — exactly `Option<T>::operator()` in the
    /// original.
    pub fn resolve(&self, options: &OptionMap) -> Result<T> {
        match options.get(self.name) {
            Some(raw) => T::parse_value(raw),
            None => Ok(self.default.clone()),
        }
    }
}

/// A bare presence flag (`Option<bool>`'s specialization in the original:
/// "is the key present at all", not "parse its value as a bool").
#[derive(Debug, Clone, Copy)]
pub struct PresenceFlag {
    pub name: &'static str,
    pub help: &'static str,
}

impl PresenceFlag {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        PresenceFlag { name, help }
    }

    pub fn resolve(&self, options: &OptionMap) -> bool {
        options.contains_key(self.name)
    }
}

/// The self-describing metadata a plugin's option set exposes for `--help`
/// style introspection, without needing every field's concrete type
/// visible to the caller.
#[derive(Debug, Clone)]
pub struct OptionDescription {
    pub name: &'static str,
    pub help: &'static str,
}

/// A plugin's published option set: just the describable surface
/// (`GetOptions()` in the original returns this; the typed fields
/// themselves live on the plugin struct and are populated from the same
/// `OptionMap` independently).
#[derive(Debug, Clone, Default)]
pub struct OptionCollector {
    pub descriptions: Vec<OptionDescription>,
}

impl OptionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: &'static str, help: &'static str) -> Self {
        self.descriptions.push(OptionDescription { name, help });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_default_when_absent() {
        let field = OptionField::new("stack", "stack size", 0x1000u64);
        let options = OptionMap::new();
        assert_eq!(field.resolve(&options).unwrap(), 0x1000);
    }

    #[test]
    fn parses_hex_override() {
        let field = OptionField::new("stack", "stack size", 0x1000u64);
        let mut options = OptionMap::new();
        options.insert("stack".into(), "0x4000".into());
        assert_eq!(field.resolve(&options).unwrap(), 0x4000);
    }

    #[test]
    fn presence_flag_ignores_value() {
        let flag = PresenceFlag::new("verbose", "verbose dump");
        let mut options = OptionMap::new();
        options.insert("verbose".into(), "false".into());
        assert!(flag.resolve(&options));
        assert!(!flag.resolve(&OptionMap::new()));
    }
}
