//! The format framework (spec.md §4.6): the `InputFormat`/`OutputFormat`
//! capability traits every concrete container plugs into, the option/
//! registry machinery they share, and the per-format plugins themselves.
//!
//! Per spec.md §9 ("Polymorphism over inheritance hierarchies"): the
//! sources mix `Format`, `SegmentManager` and per-writer behavior through
//! multiple inheritance. Here that is one capability trait per direction,
//! each *containing* a `segment::SegmentSink` obligation rather than
//! inheriting one, plus the tagged-variant [`registry`] for plugin
//! selection instead of a class hierarchy.

pub mod options;
pub mod registry;

#[cfg(feature = "mz")]
pub mod mz;

#[cfg(feature = "omf")]
pub mod omf;

#[cfg(feature = "ne")]
pub mod ne;

#[cfg(feature = "le")]
pub mod le;

#[cfg(feature = "coff")]
pub mod coff;

#[cfg(feature = "pe")]
pub mod pe;

#[cfg(feature = "elf")]
pub mod elf;

#[cfg(feature = "aout")]
pub mod aout;

#[cfg(feature = "hunk")]
pub mod hunk;

#[cfg(feature = "cpm86")]
pub mod cpm86;

#[cfg(feature = "stubs")]
pub mod stubs;

use crate::diagnostics::{diag_error, DiagnosticCounts};
use crate::dump::Report;
use crate::error::{Result, Severity};
use crate::io::{ReadRef, Writer};
use crate::module::Module;
use crate::resolve::ResolveOutcome;
use crate::script::{Parameters, Script};
use crate::segment::SegmentSink;
use alloc::string::String;
use options::{OptionCollector, OptionMap};

/// Read-side capability: parse bytes into the plugin's own representation
/// and translate that into a [`Module`].
pub trait InputFormat<'data> {
    type Data: ReadRef<'data>;

    /// Parse `data`, populating the plugin's internal representation
    /// (spec.md §4.6 `ReadFile`).
    fn read_file(data: Self::Data) -> Result<Self>
    where
        Self: Sized;

    /// Translate the already-parsed representation into the common
    /// [`Module`] (spec.md §4.6 `GenerateModule`): sections, symbols and
    /// relocations, with format-specific relocation encodings turned into
    /// generic [`crate::relocation::Relocation`]s.
    fn generate_module(&self, module: &mut Module) -> Result<()>;
}

/// Write-side capability: lay a [`Module`] out and emit it in this
/// format's wire shape.
///
/// A default [`OutputFormat::process_module`] wires together script
/// parsing, the segment manager and the resolution engine exactly in the
/// order spec.md §4.6 lists; individual plugins only need to implement the
/// format-specific hooks (`calculate_values`, `write_file`, …).
pub trait OutputFormat: SegmentSink {
    /// Merge `options` into this plugin's configuration (spec.md §4.6
    /// `SetOptions`).
    fn set_options(&mut self, options: &OptionMap) -> Result<()>;

    /// This plugin's published, named option set (spec.md §4.6
    /// `GetOptions`).
    fn get_options(&self) -> OptionCollector {
        OptionCollector::new()
    }

    /// `?name?` parameters this plugin advertises to the script DSL
    /// (spec.md §4.6 `GetLinkerScriptParameterNames`).
    fn script_parameter_names(&self) -> &'static [&'static str] {
        &[]
    }

    /// Values for this plugin's advertised script parameters, given the
    /// module about to be linked.
    fn script_parameters(&self, _module: &Module) -> Parameters {
        Parameters::new()
    }

    /// The user-supplied script if one was given, else this plugin's
    /// built-in default (spec.md §4.6 `GetScript`).
    fn default_script(&self, module: &Module) -> Script;

    /// `.stack` -> Stack, `.heap` -> Heap, `.opt` -> Optional, and any
    /// other format-specific section-name convention (spec.md §4.6
    /// `FormatAdditionalSectionFlags`).
    fn additional_section_flags(&self, _name: &str) -> crate::common::SectionFlags {
        crate::common::SectionFlags::NONE
    }

    fn supports_segmentation(&self) -> bool {
        true
    }

    fn is_16bit(&self) -> bool {
        false
    }

    fn is_protected_mode(&self) -> bool {
        true
    }

    fn supports_libraries(&self) -> bool {
        false
    }

    /// Name and flags of the section common symbols are folded into ahead
    /// of linking (spec.md §4.5: "resolution is deferred until after
    /// common-merging"). Most formats fold into `.bss`; a format with no
    /// concept of zero-filled sections can override this to something it
    /// can still address.
    fn common_symbol_section(&self) -> (&'static str, crate::common::SectionFlags) {
        (".bss", crate::common::SectionFlags::NONE)
    }

    /// Second pass, run after linking and resolution: fill in offsets,
    /// sizes and checksums now that every Section has a final position
    /// (spec.md §4.6 `CalculateValues`).
    fn calculate_values(&mut self, module: &Module) -> Result<()>;

    /// Emit bytes (spec.md §4.6 `WriteFile`).
    fn write_file(&self, module: &Module, writer: &mut dyn Writer) -> Result<()>;

    /// Produce the inspector tree (spec.md §4.6 `Dump`).
    fn dump(&self, module: &Module) -> Report;

    /// The filename extension this plugin's `GenerateFile` appends when
    /// the caller didn't specify one.
    fn default_extension(&self) -> &'static str;

    /// The full pipeline (spec.md §4.6 `ProcessModule`): link via the
    /// script, then walk every `Relocation` through the resolution engine,
    /// applying each resolved value in place. Plugins needing a different
    /// order (e.g. a format that must defer linking until an external stub
    /// is read) override this; all current plugins use the default.
    fn process_module(&mut self, module: &mut Module, options: &OptionMap) -> Result<DiagnosticCounts>
    where
        Self: Sized,
    {
        self.set_options(options)?;
        let (bss_name, bss_flags) = self.common_symbol_section();
        module.fold_common_symbols(bss_name, bss_flags);
        let script = self.default_script(module);
        let params = self.script_parameters(module);
        crate::segment::apply_script(module, &script, &params, self)?;

        let mut counts = DiagnosticCounts::new();
        for index in 0..module.relocations.len() {
            let relocation = module.relocations[index].clone();
            match relocation.resolve(module) {
                ResolveOutcome::Resolved(resolution) => {
                    relocation.apply(module, &resolution);
                }
                ResolveOutcome::Truncated(resolution) => {
                    relocation.apply(module, &resolution);
                    counts.record(Severity::Warning);
                }
                ResolveOutcome::DeferToImport(name) => {
                    // The plugin's own import-table encoding takes over for
                    // this relocation; nothing to patch in `write_file`'s
                    // generic path (spec.md §4.5 step 3).
                    let _ = name;
                }
                ResolveOutcome::Unresolved(name) => {
                    diag_error!(
                        "link",
                        "unresolved symbol {} referenced by relocation at section {} offset {:#x}",
                        name.load_name().unwrap_or("<unnamed>"),
                        relocation.source.section.0,
                        relocation.source.offset
                    );
                    counts.record(Severity::Error);
                }
            }
        }

        self.calculate_values(module)?;
        Ok(counts)
    }

    /// The public entry point wrapping `process_module`/`write_file` in
    /// order, with this plugin's default extension appended if `name`
    /// doesn't already carry one (spec.md §4.6 `GenerateFile`).
    fn generate_file(
        &mut self,
        module: &mut Module,
        options: &OptionMap,
        writer: &mut dyn Writer,
    ) -> Result<DiagnosticCounts>
    where
        Self: Sized,
    {
        let counts = self.process_module(module, options)?;
        self.write_file(module, writer)?;
        Ok(counts)
    }
}

/// Append `ext` to `name` unless it already carries a `.`-prefixed
/// extension, matching every plugin's `GetDefaultExtension` convention.
pub fn with_default_extension(name: &str, ext: &str) -> String {
    if name.contains('.') {
        String::from(name)
    } else {
        let mut owned = String::from(name);
        owned.push('.');
        owned.push_str(ext);
        owned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_added_when_missing() {
        assert_eq!(with_default_extension("prog", "exe"), "prog.exe");
    }

    #[test]
    fn extension_kept_when_present() {
        assert_eq!(with_default_extension("prog.com", "exe"), "prog.com");
    }
}
