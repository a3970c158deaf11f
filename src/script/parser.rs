//! Recursive-descent parser for the layout DSL (spec.md §4.3 grammar).

use super::ast::{AllModifier, Clause, Expr, Pattern, Script, Stmt};
use super::lexer::{lex, Token};
use crate::error::{Error, Result};
use alloc::boxed::Box;
use alloc::vec::Vec;

pub fn parse(input: &str) -> Result<Script> {
    let tokens = lex(input)?;
    let mut p = Parser { tokens, pos: 0 };
    p.parse_script()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: &Token) -> Result<()> {
        match self.next() {
            Some(ref t) if t == want => Ok(()),
            _ => Err(Error("unexpected token in script")),
        }
    }

    fn ident_is(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(word))
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        if self.ident_is(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_script(&mut self) -> Result<Script> {
        let mut statements = Vec::new();
        while self.peek().is_some() {
            statements.push(self.parse_stmt()?);
            while matches!(self.peek(), Some(Token::Semicolon)) {
                self.pos += 1;
            }
        }
        Ok(Script { statements })
    }

    fn parse_stmt(&mut self) -> Result<Stmt> {
        if self.eat_ident("for") {
            let pattern = self.parse_pattern(0)?;
            self.expect(&Token::LBrace)?;
            let clauses = self.parse_clauses()?;
            self.expect(&Token::RBrace)?;
            return Ok(Stmt::For(pattern, clauses));
        }
        let name = match self.next() {
            Some(Token::String(s)) => s,
            Some(Token::Ident(s)) => s,
            _ => return Err(Error("expected segment name")),
        };
        self.expect(&Token::LBrace)?;
        let clauses = self.parse_clauses()?;
        self.expect(&Token::RBrace)?;
        Ok(Stmt::Segment(name, clauses))
    }

    fn parse_clauses(&mut self) -> Result<Vec<Clause>> {
        let mut clauses = Vec::new();
        loop {
            while matches!(self.peek(), Some(Token::Semicolon)) {
                self.pos += 1;
            }
            if matches!(self.peek(), Some(Token::RBrace)) || self.peek().is_none() {
                break;
            }
            clauses.push(self.parse_clause()?);
            while matches!(self.peek(), Some(Token::Semicolon)) {
                self.pos += 1;
            }
        }
        Ok(clauses)
    }

    fn parse_clause(&mut self) -> Result<Clause> {
        if self.eat_ident("at") {
            return Ok(Clause::At(self.parse_expr()?));
        }
        if self.eat_ident("base") {
            return Ok(Clause::Base(self.parse_expr()?));
        }
        if self.eat_ident("align") {
            return Ok(Clause::Align(self.parse_expr()?));
        }
        if self.eat_ident("all") {
            let pattern = self.parse_pattern(0)?;
            let mut modifiers = Vec::new();
            loop {
                if self.eat_ident("align") {
                    modifiers.push(AllModifier::Align(self.parse_expr()?));
                } else if self.eat_ident("base") {
                    modifiers.push(AllModifier::Base(self.parse_expr()?));
                } else if self.eat_ident("at") {
                    modifiers.push(AllModifier::At(self.parse_expr()?));
                } else {
                    break;
                }
            }
            return Ok(Clause::All(pattern, modifiers));
        }
        Err(Error("unknown clause keyword in script"))
    }

    /// `pattern ::= ... | pattern 'or' pattern | pattern 'and' pattern`,
    /// parsed with `or`/`and` left-associative and equal precedence (the
    /// grammar doesn't distinguish them, so neither do we).
    fn parse_pattern(&mut self, _min_bp: u8) -> Result<Pattern> {
        let mut lhs = self.parse_pattern_atom()?;
        loop {
            if self.eat_ident("or") {
                let rhs = self.parse_pattern_atom()?;
                lhs = Pattern::Or(Box::new(lhs), Box::new(rhs));
            } else if self.eat_ident("and") {
                let rhs = self.parse_pattern_atom()?;
                lhs = Pattern::And(Box::new(lhs), Box::new(rhs));
            } else {
                break;
            }
        }
        Ok(lhs)
    }

    fn parse_pattern_atom(&mut self) -> Result<Pattern> {
        if self.eat_ident("not") {
            return Ok(Pattern::Not(Box::new(self.parse_pattern_atom()?)));
        }
        if self.eat_ident("any") {
            return Ok(Pattern::Any);
        }
        if self.eat_ident("exec") {
            return Ok(Pattern::Exec);
        }
        if self.eat_ident("write") {
            return Ok(Pattern::Write);
        }
        if self.eat_ident("zero") {
            return Ok(Pattern::Zero);
        }
        match self.next() {
            Some(Token::String(s)) => Ok(Pattern::Name(s)),
            Some(Token::Ident(s)) => Ok(Pattern::Name(s)),
            _ => Err(Error("expected pattern")),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_expr_atom()?;
        while matches!(self.peek(), Some(Token::Plus)) {
            self.pos += 1;
            let rhs = self.parse_expr_atom()?;
            lhs = Expr::Add(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_expr_atom(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Int(n)) => Ok(Expr::Integer(n)),
            Some(Token::Param(name)) => Ok(Expr::Param(name)),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("here") => Ok(Expr::Here),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("align") => {
                self.expect(&Token::LParen)?;
                let a = self.parse_expr()?;
                self.expect(&Token::Comma)?;
                let b = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(Expr::Align(Box::new(a), Box::new(b)))
            }
            _ => Err(Error("expected expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scenario_6_script() {
        let script = parse(
            r#".code { at 0x1000; all exec; }; .data { at align(here,0x100); all not zero; }; .bss { all zero; };"#,
        )
        .unwrap();
        assert_eq!(script.statements.len(), 3);
        match &script.statements[0] {
            Stmt::Segment(name, clauses) => {
                assert_eq!(name, ".code");
                assert_eq!(clauses.len(), 2);
            }
            _ => panic!("expected segment"),
        }
    }

    #[test]
    fn parses_for_template_with_pattern_combinators() {
        let script = parse(r#"for exec and not zero { all any; };"#).unwrap();
        assert_eq!(script.statements.len(), 1);
        assert!(matches!(script.statements[0], Stmt::For(..)));
    }
}
