//! Segments and the segment manager (spec.md §3 Segment, §4.4).

use crate::common::{SectionFlags, SectionIndex, SegmentIndex};
use crate::diagnostics::diag_warn;
use crate::error::{Error, Result};
use crate::module::Module;
use crate::script::{self, AllModifier, Clause, Script, Stmt};
use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::vec::Vec;

/// A laid-out group of sections sharing an address space and base address.
///
/// Produced solely by the segment manager (`apply_script`); nothing else in
/// this crate constructs one directly, matching spec.md §3's "A Segment is
/// produced solely by the Segment manager."
#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub base_address: u64,
    pub sections: Vec<SectionIndex>,
    pub data_size: u64,
    pub zero_fill: u64,
    pub optional_extra: u64,
}

impl Segment {
    pub fn new(name: impl Into<String>) -> Self {
        Segment {
            name: name.into(),
            base_address: 0,
            sections: Vec::new(),
            data_size: 0,
            zero_fill: 0,
            optional_extra: 0,
        }
    }

    pub fn footprint(&self) -> u64 {
        self.data_size + self.zero_fill
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

/// Callback invoked once per populated segment, in script-declaration order
/// (spec.md §4.4, §5). Implemented by output format plugins.
pub trait SegmentSink {
    fn on_new_segment(&mut self, module: &Module, segment: &Segment, index: SegmentIndex);
}

/// Apply a parsed script to `module`, producing laid-out segments.
///
/// This is the segment manager of spec.md §4.4: for each declared or
/// `for`-materialized segment, places every section an `all` clause
/// selects, in module order, honoring section alignment (the stricter of
/// the section's own alignment and any `align` clause always wins),
/// `Fixed` sections' pre-chosen base, and the stack/heap-placed-last rule.
/// Calls `sink.on_new_segment` once per non-empty segment, in script order.
pub fn apply_script(
    module: &mut Module,
    script: &Script,
    params: &script::Parameters,
    sink: &mut dyn SegmentSink,
) -> Result<()> {
    let mut placed: BTreeSet<usize> = BTreeSet::new();
    let mut cursor: u64 = 0;

    for stmt in &script.statements {
        match stmt {
            Stmt::Segment(name, clauses) => {
                let segment = build_segment(
                    module,
                    name.clone(),
                    clauses,
                    params,
                    &mut cursor,
                    &mut placed,
                )?;
                emit_segment(module, segment, sink)?;
            }
            Stmt::For(pattern, clauses) => {
                // Materialize one segment per not-yet-placed section
                // matching `pattern`, in module order (spec.md §4.3: "a
                // template that materializes a fresh segment per section
                // matching the pattern").
                let matches: Vec<SectionIndex> = module
                    .sections()
                    .filter(|(idx, s)| !placed.contains(&idx.0) && script::pattern_matches(pattern, s))
                    .map(|(idx, _)| idx)
                    .collect();
                for section_index in matches {
                    if placed.contains(&section_index.0) {
                        continue; // claimed by an earlier clause in this same for-loop
                    }
                    let name = module.section(section_index).unwrap().name.clone();
                    let segment = build_segment_for_template(
                        module,
                        name,
                        section_index,
                        clauses,
                        params,
                        &mut cursor,
                        &mut placed,
                    )?;
                    emit_segment(module, segment, sink)?;
                }
            }
        }
    }

    let unmatched: Vec<&str> = module
        .sections()
        .filter(|(idx, s)| !placed.contains(&idx.0) && !s.flags.contains(SectionFlags::FIXED) && s.footprint() > 0)
        .map(|(_, s)| s.name.as_str())
        .collect();
    for name in unmatched {
        diag_warn!("segment", "section {name} matched no `all` pattern and was left unplaced");
    }

    Ok(())
}

fn emit_segment(module: &mut Module, segment: Segment, sink: &mut dyn SegmentSink) -> Result<()> {
    // Empty segments are suppressed (spec.md §4.4); a sink wanting them
    // anyway can inspect `module.segments` itself after linking.
    if segment.is_empty() {
        return Ok(());
    }
    let index = SegmentIndex(module.segments.len());
    for &section in &segment.sections {
        if let Some(s) = module.section_mut(section) {
            s.segment = Some(index);
        }
    }
    module.segments.push(segment);
    sink.on_new_segment(module, &module.segments[index.0], index);
    Ok(())
}

fn build_segment(
    module: &mut Module,
    name: String,
    clauses: &[Clause],
    params: &script::Parameters,
    cursor: &mut u64,
    placed: &mut BTreeSet<usize>,
) -> Result<Segment> {
    let mut segment = Segment::new(name);
    segment.base_address = *cursor;
    run_clauses(module, &mut segment, clauses, params, cursor, placed)?;
    Ok(segment)
}

fn build_segment_for_template(
    module: &mut Module,
    name: String,
    trigger: SectionIndex,
    clauses: &[Clause],
    params: &script::Parameters,
    cursor: &mut u64,
    placed: &mut BTreeSet<usize>,
) -> Result<Segment> {
    let mut segment = Segment::new(name);
    segment.base_address = *cursor;
    place_section(module, &mut segment, trigger, cursor, placed)?;
    run_clauses(module, &mut segment, clauses, params, cursor, placed)?;
    Ok(segment)
}

fn run_clauses(
    module: &mut Module,
    segment: &mut Segment,
    clauses: &[Clause],
    params: &script::Parameters,
    cursor: &mut u64,
    placed: &mut BTreeSet<usize>,
) -> Result<()> {
    for clause in clauses {
        match clause {
            Clause::At(expr) => {
                let v = script::eval_expr(expr, params, *cursor)?;
                *cursor = v;
                segment.base_address = v;
            }
            Clause::Base(expr) => {
                let v = script::eval_expr(expr, params, *cursor)?;
                segment.base_address = v;
            }
            Clause::Align(expr) => {
                let a = script::eval_expr(expr, params, *cursor)?;
                *cursor = align_up(*cursor, a);
            }
            Clause::All(pattern, modifiers) => {
                for modifier in modifiers {
                    match modifier {
                        AllModifier::Align(expr) => {
                            let a = script::eval_expr(expr, params, *cursor)?;
                            *cursor = align_up(*cursor, a);
                        }
                        AllModifier::Base(expr) => {
                            segment.base_address = script::eval_expr(expr, params, *cursor)?;
                        }
                        AllModifier::At(expr) => {
                            let v = script::eval_expr(expr, params, *cursor)?;
                            *cursor = v;
                            segment.base_address = v;
                        }
                    }
                }
                let mut matches: Vec<SectionIndex> = module
                    .sections()
                    .filter(|(idx, s)| !placed.contains(&idx.0) && script::pattern_matches(pattern, s))
                    .map(|(idx, _)| idx)
                    .collect();
                // Stack/heap sections sort last within this batch unless
                // the pattern singled them out on its own (spec.md §4.4).
                matches.sort_by_key(|idx| {
                    let flags = module.section(*idx).unwrap().flags;
                    flags.intersects(SectionFlags::STACK | SectionFlags::HEAP) as u8
                });
                for section_index in matches {
                    place_section(module, segment, section_index, cursor, placed)?;
                }
            }
        }
    }
    Ok(())
}

fn place_section(
    module: &mut Module,
    segment: &mut Segment,
    section_index: SectionIndex,
    cursor: &mut u64,
    placed: &mut BTreeSet<usize>,
) -> Result<()> {
    let (alignment, footprint, data_size, zero_fill, optional_extra, fixed) = {
        let section = module
            .section(section_index)
            .ok_or(Error("script referenced an unknown section"))?;
        (
            section.alignment.max(1),
            section.footprint(),
            section.size(),
            section.zero_fill,
            section.optional_extra,
            section.fixed_address,
        )
    };

    let bias = if let Some(fixed_address) = fixed {
        // A `Fixed` section disables script-driven placement: verify the
        // scripted position agrees, or reject the link (spec.md §4.4).
        if fixed_address < segment.base_address {
            return Err(Error("fixed section address precedes its segment base"));
        }
        let candidate = fixed_address - segment.base_address;
        if segment.base_address + candidate < *cursor {
            return Err(Error("fixed section address conflicts with prior placement"));
        }
        *cursor = fixed_address + footprint;
        candidate
    } else {
        // Section alignment always wins over a weaker `align` clause value
        // (spec.md §4.4: "whichever is stricter wins"); `*cursor` already
        // reflects any `align` clause that ran before this `all`.
        *cursor = align_up(*cursor, alignment);
        let bias = *cursor - segment.base_address;
        *cursor += footprint;
        bias
    };

    if let Some(section) = module.section_mut(section_index) {
        // `segment` is filled in once the containing `Segment` is pushed to
        // `module.segments` and gets a stable index (see `emit_segment`).
        section.bias = Some(bias);
    }
    // `bias` already accounts for any alignment padding ahead of this
    // section (the `align_up` above); fold that gap into `data_size` so
    // `Segment::footprint()` — and thus the bytes a format writer actually
    // emits — matches the addresses `bias` promises instead of undercounting
    // by the padding between sections.
    let gap = bias.saturating_sub(segment.footprint());
    segment.sections.push(section_index);
    segment.data_size += gap + data_size;
    segment.zero_fill += zero_fill;
    segment.optional_extra += optional_extra;
    placed.insert(section_index.0);
    Ok(())
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
    use crate::section::Section;

    struct NoopSink;
    impl SegmentSink for NoopSink {
        fn on_new_segment(&mut self, _module: &Module, _segment: &Segment, _index: SegmentIndex) {}
    }

    /// A section whose alignment forces a gap after the previous one must
    /// have that gap counted in `Segment::data_size` — not just in its own
    /// `bias` — so a format writer emitting `data_size` bytes actually
    /// produces an image as long as the biases it assigned promise.
    #[test]
    fn data_size_includes_inter_section_alignment_padding() {
        let script = script::parse("\".seg\" { all any; };").unwrap();
        let mut module = Module::new();
        module.add_section(Section::new("a", SectionFlags::NONE).with_data(crate::image::Buffer::from_bytes(alloc::vec![0u8; 3])));
        module.add_section(
            Section::new("b", SectionFlags::NONE)
                .with_data(crate::image::Buffer::from_bytes(alloc::vec![0u8; 4]))
                .with_alignment(8),
        );

        let params = script::Parameters::new();
        let mut sink = NoopSink;
        apply_script(&mut module, &script, &params, &mut sink).unwrap();

        assert_eq!(module.segments.len(), 1);
        let segment = &module.segments[0];
        // "a" occupies bytes 0 through 2; "b" needs 8-byte alignment, so it
        // starts at 8, not 3 — a 5-byte gap that must show up in `data_size`.
        assert_eq!(module.section(SectionIndex(0)).unwrap().bias, Some(0));
        assert_eq!(module.section(SectionIndex(1)).unwrap().bias, Some(8));
        assert_eq!(segment.data_size, 3 + 5 + 4);
        assert_eq!(segment.footprint(), 12);
    }
}
