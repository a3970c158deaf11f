//! Expression and pattern evaluation for the layout DSL (spec.md §4.3
//! Semantics).

use super::ast::{Expr, Pattern};
use crate::common::SectionFlags;
use crate::error::{Error, Result};
use crate::section::Section;
use alloc::collections::BTreeMap;
use alloc::string::String;

/// Parameters a format plugin advertises via `GetLinkerScriptParameterNames`
/// (spec.md §4.6), substituted into `?name?` expressions.
pub type Parameters = BTreeMap<String, u64>;

pub fn eval_expr(expr: &Expr, params: &Parameters, here: u64) -> Result<u64> {
    match expr {
        Expr::Integer(n) => Ok(*n),
        Expr::Param(name) => params
            .get(name.as_str())
            .copied()
            .ok_or(Error("undefined script parameter")),
        Expr::Here => Ok(here),
        Expr::Align(value, align) => {
            let v = eval_expr(value, params, here)?;
            let a = eval_expr(align, params, here)?;
            Ok(if a <= 1 { v } else { (v + a - 1) & !(a - 1) })
        }
        Expr::Add(a, b) => {
            let a = eval_expr(a, params, here)?;
            let b = eval_expr(b, params, here)?;
            Ok(a + b)
        }
    }
}

/// Does `section` match `pattern`? (spec.md §4.3: "`exec` matches
/// executable sections; `zero` matches zero-filled; `write` matches
/// writable; bare STRING matches by section name.")
pub fn pattern_matches(pattern: &Pattern, section: &Section) -> bool {
    match pattern {
        Pattern::Any => true,
        Pattern::Exec => section.is_executable(),
        Pattern::Write => section.is_writable(),
        Pattern::Zero => section.is_zero_filled(),
        Pattern::Name(name) => section.name == *name,
        Pattern::Not(p) => !pattern_matches(p, section),
        Pattern::Or(a, b) => pattern_matches(a, section) || pattern_matches(b, section),
        Pattern::And(a, b) => pattern_matches(a, section) && pattern_matches(b, section),
    }
}

/// `SectionFlags` equivalent check used when a format wants to test a
/// pattern without a concrete `Section` (e.g. validating a script against
/// declared format constraints ahead of linking).
pub fn pattern_matches_flags(pattern: &Pattern, name: &str, flags: SectionFlags) -> bool {
    match pattern {
        Pattern::Any => true,
        Pattern::Exec => flags.contains(SectionFlags::EXECUTABLE),
        Pattern::Write => flags.contains(SectionFlags::WRITABLE),
        Pattern::Zero => flags.contains(SectionFlags::ZERO_FILLED),
        Pattern::Name(n) => n == name,
        Pattern::Not(p) => !pattern_matches_flags(p, name, flags),
        Pattern::Or(a, b) => {
            pattern_matches_flags(a, name, flags) || pattern_matches_flags(b, name, flags)
        }
        Pattern::And(a, b) => {
            pattern_matches_flags(a, name, flags) && pattern_matches_flags(b, name, flags)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_rounds_up() {
        let params = Parameters::new();
        let expr = Expr::Align(Box::new(Expr::Integer(0x1001)), Box::new(Expr::Integer(0x100)));
        assert_eq!(eval_expr(&expr, &params, 0).unwrap(), 0x1100);
    }

    #[test]
    fn param_substitution() {
        let mut params = Parameters::new();
        params.insert("base_address".into(), 0x10000);
        let expr = Expr::Param("base_address".into());
        assert_eq!(eval_expr(&expr, &params, 0).unwrap(), 0x10000);
    }
}
