//! Boolean search queries: parsing and the combining optimizer.
//!
//! A query is either plain text, handed to the scanner as is, or a tree of
//! simple comparisons joined with `AND`, `OR` and `XOR`:
//!
//! ```text
//! (RAW_TEXT CONTAINS "hello") AND (RECORD.name CONTAINS FHS("jon", DIST=1))
//! ```
//!
//! Each comparison may carry its own search function and options. The
//! optimizer merges neighbouring structured comparisons with equal options
//! back into one scanner expression; whatever stays split is evaluated
//! step by step by the decoder.

use super::SearchConfig;
use crate::{Error, Result};
use std::fmt;

/// Options a search function sets on its comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub mode: Option<String>,
    pub dist: Option<u32>,
    pub width: Option<i32>,
    pub case: Option<bool>,
}

/// One scanner expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleQuery {
    pub expression: String,
    /// Compares `RECORD` fields instead of raw text.
    pub structured: bool,
    pub options: QueryOptions,
    /// Boolean operators already folded into `expression`.
    booleans: usize,
}

impl SimpleQuery {
    fn plain(text: &str) -> Self {
        Self {
            expression: text.to_string(),
            structured: false,
            options: QueryOptions::default(),
            booleans: 0,
        }
    }

    /// Point `cfg` at this expression.
    pub fn apply(&self, cfg: &mut SearchConfig) {
        cfg.query = self.expression.clone();
        if let Some(mode) = &self.options.mode {
            cfg.mode = mode.clone();
        }
        if let Some(dist) = self.options.dist {
            cfg.dist = dist;
        }
        if let Some(width) = self.options.width {
            cfg.width = width;
        }
        if let Some(case) = self.options.case {
            cfg.case = case;
        }
    }

    fn wrapped(&self) -> String {
        if self.booleans > 0 {
            format!("({})", self.expression)
        } else {
            self.expression.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BooleanOp {
    And,
    Or,
    Xor,
}

impl BooleanOp {
    fn keyword(&self) -> &'static str {
        match self {
            BooleanOp::And => "AND",
            BooleanOp::Or => "OR",
            BooleanOp::Xor => "XOR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Search(SimpleQuery),
    Boolean(BooleanOp, Box<Query>, Box<Query>),
}

impl Query {
    pub fn as_simple(&self) -> Option<&SimpleQuery> {
        match self {
            Query::Search(s) => Some(s),
            Query::Boolean(..) => None,
        }
    }

    /// Merge neighbouring structured comparisons with equal options.
    ///
    /// `limit` caps the boolean operators per merged expression, `None`
    /// merges without limit and `Some(0)` disables merging.
    pub fn optimize(self, limit: Option<usize>) -> Query {
        let Query::Boolean(op, a, b) = self else {
            return self;
        };
        let a = a.optimize(limit);
        let b = b.optimize(limit);
        if let (Query::Search(sa), Query::Search(sb)) = (&a, &b) {
            let fits = limit.map_or(true, |l| sa.booleans + sb.booleans < l);
            if sa.structured && sb.structured && sa.options == sb.options && fits {
                return Query::Search(SimpleQuery {
                    expression: format!("{} {} {}", sa.wrapped(), op.keyword(), sb.wrapped()),
                    structured: true,
                    options: sa.options.clone(),
                    booleans: sa.booleans + sb.booleans + 1,
                });
            }
        }
        Query::Boolean(op, Box::new(a), Box::new(b))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::Search(s) => write!(f, "{}", s.expression),
            Query::Boolean(op, a, b) => write!(f, "{{{} {} {}}}", a, op.keyword(), b),
        }
    }
}

/// Parse a query. Text that does not look structured becomes a single
/// plain search.
pub fn parse(query: &str) -> Result<Query> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(Error::BadRequest("empty query".to_string()));
    }
    let tokens = match tokenize(trimmed) {
        Ok(tokens) => tokens,
        Err(_) if !trimmed.starts_with(['(', '"']) => {
            return Ok(Query::Search(SimpleQuery::plain(trimmed)));
        }
        Err(e) => return Err(e),
    };
    if !looks_structured(&tokens) {
        return Ok(Query::Search(SimpleQuery::plain(trimmed)));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let q = parser.expr()?;
    if let Some(tok) = parser.peek() {
        return Err(bad_query(format!("unexpected {tok} at the end")));
    }
    Ok(q)
}

fn bad_query(msg: String) -> Error {
    Error::BadRequest(format!("failed to parse query: {msg}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Comma,
    Eq,
    Str(String),
    Word(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Comma => f.write_str("','"),
            Token::Eq => f.write_str("'='"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::Word(w) => write!(f, "{w:?}"),
        }
    }
}

fn tokenize(s: &str) -> Result<Vec<Token>> {
    let mut out = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | ',' | '=' => {
                chars.next();
                out.push(match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    _ => Token::Eq,
                });
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some(esc) => text.push(esc),
                            None => break,
                        },
                        '"' => {
                            closed = true;
                            break;
                        }
                        c => text.push(c),
                    }
                }
                if !closed {
                    return Err(bad_query("unterminated string".to_string()));
                }
                out.push(Token::Str(text));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '(' | ')' | ',' | '=' | '"') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                out.push(Token::Word(word));
            }
        }
    }
    Ok(out)
}

fn looks_structured(tokens: &[Token]) -> bool {
    match tokens {
        [Token::LParen, ..] | [Token::Str(_), ..] => true,
        [Token::Word(w), Token::LParen, ..] => search_mode(w).is_some(),
        _ => false,
    }
}

/// Scanner mode of a search function name.
fn search_mode(name: &str) -> Option<&'static str> {
    match name.to_ascii_uppercase().as_str() {
        "ES" | "EXACT" => Some("es"),
        "FHS" | "HAMMING" => Some("fhs"),
        "FEDS" | "EDIT_DISTANCE" => Some("feds"),
        _ => None,
    }
}

fn is_relation(word: &str) -> bool {
    matches!(
        word.to_ascii_uppercase().as_str(),
        "CONTAINS" | "NOT_CONTAINS" | "EQUALS" | "NOT_EQUALS"
    )
}

fn is_input(word: &str) -> bool {
    word == "RAW_TEXT" || word == "RECORD" || word.starts_with("RECORD.")
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, want: Token) -> Result<()> {
        match self.next() {
            Some(tok) if tok == want => Ok(()),
            Some(tok) => Err(bad_query(format!("expected {want}, found {tok}"))),
            None => Err(bad_query(format!("expected {want}, found end of query"))),
        }
    }

    fn operator(&self) -> Option<BooleanOp> {
        match self.peek() {
            Some(Token::Word(w)) => match w.to_ascii_uppercase().as_str() {
                "AND" => Some(BooleanOp::And),
                "OR" => Some(BooleanOp::Or),
                "XOR" => Some(BooleanOp::Xor),
                _ => None,
            },
            _ => None,
        }
    }

    /// `OR` and `XOR` bind weaker than `AND`.
    fn expr(&mut self) -> Result<Query> {
        let mut q = self.and_expr()?;
        while let Some(op @ (BooleanOp::Or | BooleanOp::Xor)) = self.operator() {
            self.pos += 1;
            let rhs = self.and_expr()?;
            q = Query::Boolean(op, Box::new(q), Box::new(rhs));
        }
        Ok(q)
    }

    fn and_expr(&mut self) -> Result<Query> {
        let mut q = self.primary()?;
        while self.operator() == Some(BooleanOp::And) {
            self.pos += 1;
            let rhs = self.primary()?;
            q = Query::Boolean(BooleanOp::And, Box::new(q), Box::new(rhs));
        }
        Ok(q)
    }

    fn primary(&mut self) -> Result<Query> {
        match self.peek().cloned() {
            Some(Token::LParen) => {
                let comparison = matches!(
                    (self.peek_at(1), self.peek_at(2)),
                    (Some(Token::Word(input)), Some(Token::Word(rel))) if is_input(input) && is_relation(rel)
                );
                if comparison {
                    return self.comparison().map(Query::Search);
                }
                self.pos += 1;
                let q = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(q)
            }
            Some(Token::Str(text)) => {
                self.pos += 1;
                Ok(Query::Search(simple("RAW_TEXT", "CONTAINS", &text, QueryOptions::default())))
            }
            Some(Token::Word(name)) if search_mode(&name).is_some() => {
                let (text, options) = self.function()?;
                Ok(Query::Search(simple("RAW_TEXT", "CONTAINS", &text, options)))
            }
            Some(tok) => Err(bad_query(format!("unexpected {tok}"))),
            None => Err(bad_query("unexpected end of query".to_string())),
        }
    }

    /// `(INPUT RELATION VALUE)`
    fn comparison(&mut self) -> Result<SimpleQuery> {
        self.expect(Token::LParen)?;
        let (Some(Token::Word(input)), Some(Token::Word(relation))) = (self.next(), self.next()) else {
            return Err(bad_query("bad comparison".to_string()));
        };
        let (text, options) = match self.peek().cloned() {
            Some(Token::Str(text)) => {
                self.pos += 1;
                (text, QueryOptions::default())
            }
            Some(Token::Word(name)) if search_mode(&name).is_some() => self.function()?,
            Some(tok) => return Err(bad_query(format!("unexpected {tok} in comparison"))),
            None => return Err(bad_query("unexpected end of query".to_string())),
        };
        self.expect(Token::RParen)?;
        Ok(simple(&input, &relation.to_ascii_uppercase(), &text, options))
    }

    /// `NAME("text", KEY=VALUE, ...)`
    fn function(&mut self) -> Result<(String, QueryOptions)> {
        let Some(Token::Word(name)) = self.next() else {
            return Err(bad_query("search function expected".to_string()));
        };
        let mut options = QueryOptions {
            mode: search_mode(&name).map(str::to_string),
            ..Default::default()
        };
        self.expect(Token::LParen)?;
        let text = match self.next() {
            Some(Token::Str(text)) => text,
            Some(tok) => return Err(bad_query(format!("{name}: expected text, found {tok}"))),
            None => return Err(bad_query("unexpected end of query".to_string())),
        };
        while self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            let key = match self.next() {
                Some(Token::Word(key)) => key.to_ascii_uppercase(),
                Some(tok) => return Err(bad_query(format!("{name}: expected option, found {tok}"))),
                None => return Err(bad_query("unexpected end of query".to_string())),
            };
            self.expect(Token::Eq)?;
            let value = match self.next() {
                Some(Token::Word(v)) | Some(Token::Str(v)) => v,
                Some(tok) => return Err(bad_query(format!("{key}: bad value {tok}"))),
                None => return Err(bad_query("unexpected end of query".to_string())),
            };
            let bad = |e: String| bad_query(format!("{key}: bad value {value:?}: {e}"));
            match key.as_str() {
                "DIST" | "D" => options.dist = Some(value.parse().map_err(|e| bad(format!("{e}")))?),
                "WIDTH" | "W" => options.width = Some(value.parse().map_err(|e| bad(format!("{e}")))?),
                "LINE" | "L" => {
                    if value.parse::<bool>().map_err(|e| bad(format!("{e}")))? {
                        options.width = Some(-1);
                    }
                }
                "CS" | "CASE" => options.case = Some(value.parse().map_err(|e| bad(format!("{e}")))?),
                _ => return Err(bad_query(format!("{name}: unknown option {key}"))),
            }
        }
        self.expect(Token::RParen)?;
        Ok((text, options))
    }
}

fn simple(input: &str, relation: &str, text: &str, options: QueryOptions) -> SimpleQuery {
    let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
    SimpleQuery {
        expression: format!("({input} {relation} \"{escaped}\")"),
        structured: input.starts_with("RECORD"),
        options,
        booleans: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search(q: &Query) -> &SimpleQuery {
        q.as_simple().expect("simple query")
    }

    #[test]
    fn plain_text_is_left_alone() {
        let q = parse("  hello world ").unwrap();
        assert_eq!(search(&q).expression, "hello world");
        assert!(!search(&q).structured);
        assert!(parse("   ").is_err());
    }

    #[test]
    fn comparisons_and_functions() {
        let q = parse(r#"(RECORD.name CONTAINS FHS("jo\"n", DIST=2, CS=false))"#).unwrap();
        let s = search(&q);
        assert_eq!(s.expression, r#"(RECORD.name CONTAINS "jo\"n")"#);
        assert!(s.structured);
        assert_eq!(s.options.mode.as_deref(), Some("fhs"));
        assert_eq!(s.options.dist, Some(2));
        assert_eq!(s.options.case, Some(false));

        let q = parse(r#"EXACT("x", LINE=true)"#).unwrap();
        assert_eq!(search(&q).expression, r#"(RAW_TEXT CONTAINS "x")"#);
        assert_eq!(search(&q).options.width, Some(-1));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let q = parse(r#""a" OR "b" AND ("c" XOR "d")"#).unwrap();
        assert_eq!(
            q.to_string(),
            r#"{(RAW_TEXT CONTAINS "a") OR {(RAW_TEXT CONTAINS "b") AND {(RAW_TEXT CONTAINS "c") XOR (RAW_TEXT CONTAINS "d")}}}"#
        );
    }

    #[test]
    fn syntax_errors_are_bad_requests() {
        for bad in [
            r#"("a" AND"#,
            r#"(RAW_TEXT CONTAINS "a""#,
            r#"FHS("a", DIST=x)"#,
            r#"FHS("a", SPEED=1)"#,
            r#""a" "b""#,
        ] {
            let err = parse(bad).unwrap_err();
            assert_eq!(err.status_code(), 400, "{bad}");
        }
    }

    #[test]
    fn optimizer_merges_structured_neighbours() {
        let q = parse(
            r#"(RECORD.a CONTAINS "x") AND (RECORD.b CONTAINS "y") OR (RECORD.c CONTAINS "z")"#,
        )
        .unwrap();
        let merged = q.clone().optimize(None);
        assert_eq!(
            search(&merged).expression,
            r#"((RECORD.a CONTAINS "x") AND (RECORD.b CONTAINS "y")) OR (RECORD.c CONTAINS "z")"#
        );

        // one boolean per expression
        let limited = q.clone().optimize(Some(1));
        assert!(matches!(limited, Query::Boolean(BooleanOp::Or, ref a, _) if a.as_simple().is_some()));
        assert_eq!(q.clone().optimize(Some(0)), q);
    }

    #[test]
    fn raw_text_and_mixed_options_stay_split() {
        let q = parse(r#"(RAW_TEXT CONTAINS "x") AND (RAW_TEXT CONTAINS "y")"#).unwrap();
        assert!(q.clone().optimize(None).as_simple().is_none());

        let q = parse(r#"(RECORD.a CONTAINS "x") AND (RECORD.a CONTAINS FHS("y", DIST=1))"#).unwrap();
        assert!(q.optimize(None).as_simple().is_none());
    }

    #[test]
    fn options_land_in_the_config() {
        let q = parse(r#"(RAW_TEXT CONTAINS FEDS("abc", DIST=1, WIDTH=5))"#).unwrap();
        let mut cfg = SearchConfig::new("ignored", vec![]);
        search(&q).apply(&mut cfg);
        assert_eq!(cfg.query, r#"(RAW_TEXT CONTAINS "abc")"#);
        assert_eq!((cfg.mode.as_str(), cfg.dist, cfg.width), ("feds", 1, 5));
    }
}
