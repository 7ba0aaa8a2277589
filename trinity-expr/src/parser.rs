//! ABOUTME: Tokenizer and recursive-descent parser for template expressions
//! ABOUTME: Produces Template/Expr ASTs; all syntax errors carry byte offsets

use crate::ast::{CompareOp, Expr, Segment, Template, TemplatePart};
use crate::{ExpressionError, Result};

/// Parse a whole template string: literal text with embedded `{{ expr }}`.
pub fn parse_template(source: &str) -> Result<Template> {
    let mut parts = Vec::new();
    let mut rest = source;
    let mut consumed = 0usize;

    while let Some(open) = rest.find("{{") {
        if open > 0 {
            parts.push(TemplatePart::Text(rest[..open].to_string()));
        }
        let after_open = &rest[open + 2..];
        let close = after_open.find("}}").ok_or_else(|| {
            ExpressionError::new(consumed + open, "unterminated '{{' in template")
        })?;
        let inner = &after_open[..close];
        let expr = parse_expr_at(inner, consumed + open + 2)?;
        parts.push(TemplatePart::Expr(expr));
        consumed += open + 2 + close + 2;
        rest = &after_open[close + 2..];
    }
    if !rest.is_empty() {
        parts.push(TemplatePart::Text(rest.to_string()));
    }
    Ok(Template { parts })
}

/// Parse a bare expression (the inside of `{{ ... }}`), as used for step
/// conditions and gateway expressions.
pub fn parse_expr(source: &str) -> Result<Expr> {
    parse_expr_at(source, 0)
}

fn parse_expr_at(source: &str, base_offset: usize) -> Result<Expr> {
    let tokens = tokenize(source, base_offset)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        base_offset,
        source_len: source.len(),
    };
    let expr = parser.comparison()?;
    parser.expect_end()?;
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Num(f64),
    Str(String),
    Dot,
    LBracket,
    RBracket,
    Pipe,
    Colon,
    Op(CompareOp),
}

struct Spanned {
    tok: Tok,
    offset: usize,
}

fn tokenize(source: &str, base_offset: usize) -> Result<Vec<Spanned>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0usize;

    while i < bytes.len() {
        let c = bytes[i] as char;
        let offset = base_offset + i;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '.' => {
                tokens.push(Spanned { tok: Tok::Dot, offset });
                i += 1;
            }
            '[' => {
                tokens.push(Spanned { tok: Tok::LBracket, offset });
                i += 1;
            }
            ']' => {
                tokens.push(Spanned { tok: Tok::RBracket, offset });
                i += 1;
            }
            '|' => {
                tokens.push(Spanned { tok: Tok::Pipe, offset });
                i += 1;
            }
            ':' => {
                tokens.push(Spanned { tok: Tok::Colon, offset });
                i += 1;
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Spanned { tok: Tok::Op(CompareOp::Eq), offset });
                    i += 2;
                } else {
                    return Err(ExpressionError::new(offset, "expected '=='"));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Spanned { tok: Tok::Op(CompareOp::Ne), offset });
                    i += 2;
                } else {
                    return Err(ExpressionError::new(offset, "expected '!='"));
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Spanned { tok: Tok::Op(CompareOp::Ge), offset });
                    i += 2;
                } else {
                    tokens.push(Spanned { tok: Tok::Op(CompareOp::Gt), offset });
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Spanned { tok: Tok::Op(CompareOp::Le), offset });
                    i += 2;
                } else {
                    tokens.push(Spanned { tok: Tok::Op(CompareOp::Lt), offset });
                    i += 1;
                }
            }
            '\'' => {
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] != b'\'' {
                    j += 1;
                }
                if j >= bytes.len() {
                    return Err(ExpressionError::new(offset, "unterminated string literal"));
                }
                tokens.push(Spanned {
                    tok: Tok::Str(source[start..j].to_string()),
                    offset,
                });
                i = j + 1;
            }
            '-' | '0'..='9' => {
                let start = i;
                if c == '-' {
                    i += 1;
                    if i >= bytes.len() || !bytes[i].is_ascii_digit() {
                        return Err(ExpressionError::new(offset, "expected digit after '-'"));
                    }
                }
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if i < bytes.len() && bytes[i] == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit) {
                    i += 1;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text = &source[start..i];
                let value: f64 = text
                    .parse()
                    .map_err(|_| ExpressionError::new(offset, format!("bad number '{text}'")))?;
                tokens.push(Spanned { tok: Tok::Num(value), offset });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let b = bytes[i] as char;
                    if b.is_ascii_alphanumeric() || b == '_' || b == '-' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Spanned {
                    tok: Tok::Ident(source[start..i].to_string()),
                    offset,
                });
            }
            other => {
                return Err(ExpressionError::new(
                    offset,
                    format!("unexpected character '{other}'"),
                ));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    base_offset: usize,
    source_len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|s| &s.tok)
    }

    fn next(&mut self) -> Option<&Spanned> {
        let spanned = self.tokens.get(self.pos);
        if spanned.is_some() {
            self.pos += 1;
        }
        spanned
    }

    fn here(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map_or(self.base_offset + self.source_len, |s| s.offset)
    }

    fn expect_end(&self) -> Result<()> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(ExpressionError::new(self.here(), "trailing tokens"))
        }
    }

    fn comparison(&mut self) -> Result<Expr> {
        let lhs = self.pipe()?;
        let op = match self.peek() {
            Some(Tok::Op(op)) => *op,
            Some(Tok::Ident(word)) if word == "contains" => CompareOp::Contains,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.pipe()?;
        Ok(Expr::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn pipe(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        while matches!(self.peek(), Some(Tok::Pipe)) {
            self.pos += 1;
            let offset = self.here();
            match self.next().map(|s| s.tok.clone()) {
                Some(Tok::Ident(name)) if name == "default" => {}
                _ => return Err(ExpressionError::new(offset, "expected 'default' after '|'")),
            }
            let offset = self.here();
            if !matches!(self.next().map(|s| s.tok.clone()), Some(Tok::Colon)) {
                return Err(ExpressionError::new(offset, "expected ':' after 'default'"));
            }
            let fallback = self.primary()?;
            expr = Expr::Default {
                value: Box::new(expr),
                fallback: Box::new(fallback),
            };
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr> {
        let offset = self.here();
        match self.next().map(|s| s.tok.clone()) {
            Some(Tok::Num(n)) => Ok(Expr::Num(n)),
            Some(Tok::Str(s)) => Ok(Expr::Str(s)),
            Some(Tok::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                _ => self.path_tail(word),
            },
            _ => Err(ExpressionError::new(offset, "expected value or path")),
        }
    }

    fn path_tail(&mut self, root: String) -> Result<Expr> {
        let mut segments = vec![Segment::Key(root)];
        loop {
            match self.peek() {
                Some(Tok::Dot) => {
                    self.pos += 1;
                    let offset = self.here();
                    match self.next().map(|s| s.tok.clone()) {
                        Some(Tok::Ident(name)) => segments.push(Segment::Key(name)),
                        _ => return Err(ExpressionError::new(offset, "expected name after '.'")),
                    }
                }
                Some(Tok::LBracket) => {
                    self.pos += 1;
                    let offset = self.here();
                    let index = match self.next().map(|s| s.tok.clone()) {
                        Some(Tok::Num(n)) if n >= 0.0 && n.fract() == 0.0 => {
                            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                            {
                                n as usize
                            }
                        }
                        _ => {
                            return Err(ExpressionError::new(offset, "expected integer index"));
                        }
                    };
                    let offset = self.here();
                    if !matches!(self.next().map(|s| s.tok.clone()), Some(Tok::RBracket)) {
                        return Err(ExpressionError::new(offset, "expected ']'"));
                    }
                    segments.push(Segment::Index(index));
                }
                _ => break,
            }
        }
        Ok(Expr::Path(segments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_text() {
        let template = parse_template("no expressions here").unwrap();
        assert_eq!(template.parts.len(), 1);
        assert!(!template.is_single_expr());
    }

    #[test]
    fn parses_single_expression_template() {
        let template = parse_template("{{steps.review.output}}").unwrap();
        assert!(template.is_single_expr());
    }

    #[test]
    fn parses_mixed_template() {
        let template = parse_template("Hello {{input.name}}, welcome").unwrap();
        assert_eq!(template.parts.len(), 3);
    }

    #[test]
    fn parses_path_with_index() {
        let expr = parse_expr("input.items[2].name").unwrap();
        assert_eq!(
            expr,
            Expr::Path(vec![
                Segment::Key("input".into()),
                Segment::Key("items".into()),
                Segment::Index(2),
                Segment::Key("name".into()),
            ])
        );
    }

    #[test]
    fn parses_default_filter() {
        let expr = parse_expr("input.topic | default:'general'").unwrap();
        match expr {
            Expr::Default { fallback, .. } => assert_eq!(*fallback, Expr::Str("general".into())),
            other => panic!("expected default filter, got {other:?}"),
        }
    }

    #[test]
    fn parses_comparison() {
        let expr = parse_expr("input.score >= 70").unwrap();
        match expr {
            Expr::Compare { op, rhs, .. } => {
                assert_eq!(op, CompareOp::Ge);
                assert_eq!(*rhs, Expr::Num(70.0));
            }
            other => panic!("expected comparison, got {other:?}"),
        }
    }

    #[test]
    fn parses_contains() {
        let expr = parse_expr("steps.scan.output.tags contains 'urgent'").unwrap();
        assert!(matches!(
            expr,
            Expr::Compare {
                op: CompareOp::Contains,
                ..
            }
        ));
    }

    #[test]
    fn rejects_unterminated_braces() {
        let err = parse_template("before {{input.x").unwrap_err();
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn rejects_trailing_tokens() {
        assert!(parse_expr("input.x input.y").is_err());
    }

    #[test]
    fn rejects_lone_equals() {
        assert!(parse_expr("input.x = 3").is_err());
    }

    #[test]
    fn step_ids_with_dashes_tokenize_as_one_name() {
        let expr = parse_expr("steps.fetch-data.output").unwrap();
        assert_eq!(
            expr,
            Expr::Path(vec![
                Segment::Key("steps".into()),
                Segment::Key("fetch-data".into()),
                Segment::Key("output".into()),
            ])
        );
    }
}
