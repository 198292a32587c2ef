//! The largefiles predicate deciding whether a file is annexed or committed
//! to git directly.
//!
//! Grammar (`and` binds tighter than `or`; juxtaposition means `and`):
//!
//! ```text
//! expr    := and_expr ("or" and_expr)*
//! and_expr:= unary ("and"? unary)*
//! unary   := "not" unary | "(" expr ")" | term
//! term    := include=GLOB | exclude=GLOB | largerthan=SIZE
//!          | smallerthan=SIZE | anything | nothing
//! ```

use std::fmt;
use std::str::FromStr;

use regex::Regex;

use harvester_shared::{HarvesterError, Result};

/// A compiled path glob.
///
/// Globs without a `/` are matched against the basename, others against
/// the full repository-relative path. `*` stays within one path component,
/// `**` crosses components.
#[derive(Debug, Clone)]
pub struct Glob {
    source: String,
    regex: Regex,
    basename_only: bool,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = glob_to_regex(pattern)
            .ok_or_else(|| HarvesterError::parse(format!("invalid glob {pattern:?}")))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
            basename_only: !pattern.contains('/'),
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        let subject = if self.basename_only {
            path.rsplit('/').next().unwrap_or(path)
        } else {
            path
        };
        self.regex.is_match(subject)
    }
}

/// Convert a simple glob pattern to a regex.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*\*", ".*")
        .replace(r"\*", "[^/]*")
        .replace(r"\?", "[^/]");
    Regex::new(&format!("^{escaped}$")).ok()
}

#[derive(Debug, Clone)]
enum Expr {
    Include(Glob),
    Exclude(Glob),
    LargerThan(u64),
    SmallerThan(u64),
    Anything,
    Nothing,
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, path: &str, size: u64) -> bool {
        match self {
            Self::Include(glob) => glob.matches(path),
            Self::Exclude(glob) => !glob.matches(path),
            Self::LargerThan(n) => size > *n,
            Self::SmallerThan(n) => size < *n,
            Self::Anything => true,
            Self::Nothing => false,
            Self::Not(inner) => !inner.eval(path, size),
            Self::And(a, b) => a.eval(path, size) && b.eval(path, size),
            Self::Or(a, b) => a.eval(path, size) || b.eval(path, size),
        }
    }
}

/// Renders without whitespace so the result fits a `.gitattributes` value.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Include(glob) => write!(f, "include={}", glob.source),
            Self::Exclude(glob) => write!(f, "exclude={}", glob.source),
            Self::LargerThan(n) => write!(f, "largerthan={n}b"),
            Self::SmallerThan(n) => write!(f, "smallerthan={n}b"),
            Self::Anything => f.write_str("anything"),
            Self::Nothing => f.write_str("nothing"),
            Self::Not(inner) => write!(f, "not({inner})"),
            Self::And(a, b) => write!(f, "({a})and({b})"),
            Self::Or(a, b) => write!(f, "({a})or({b})"),
        }
    }
}

/// A parsed largefiles expression.
#[derive(Debug, Clone)]
pub struct LargeFiles {
    source: String,
    expr: Expr,
}

impl LargeFiles {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source);
        if tokens.is_empty() {
            return Err(HarvesterError::parse("empty largefiles expression"));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or_expr()?;
        if let Some(extra) = parser.peek() {
            return Err(HarvesterError::parse(format!(
                "largefiles: unexpected {extra:?} in {source:?}"
            )));
        }
        Ok(Self {
            source: source.trim().to_string(),
            expr,
        })
    }

    /// Annex everything.
    pub fn anything() -> Self {
        Self {
            source: "anything".into(),
            expr: Expr::Anything,
        }
    }

    /// Whether a file at `path` of `size` bytes goes to the annex.
    pub fn matches(&self, path: &str, size: u64) -> bool {
        self.expr.eval(path, size)
    }

    /// The expression as written.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The `.gitattributes` line recording this expression.
    pub fn gitattributes_line(&self) -> String {
        format!("* annex.largefiles={}\n", self.expr)
    }

    /// Pull the expression back out of `.gitattributes` content.
    pub fn from_gitattributes(content: &str) -> Option<Result<Self>> {
        content.lines().find_map(|line| {
            let mut words = line.split_whitespace();
            if words.next() != Some("*") {
                return None;
            }
            words
                .find_map(|w| w.strip_prefix("annex.largefiles="))
                .map(Self::parse)
        })
    }
}

impl Default for LargeFiles {
    fn default() -> Self {
        Self::anything()
    }
}

impl FromStr for LargeFiles {
    type Err = HarvesterError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for LargeFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn tokenize(source: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for c in source.chars() {
        match c {
            '(' | ')' => {
                if !word.is_empty() {
                    tokens.push(std::mem::take(&mut word));
                }
                tokens.push(c.to_string());
            }
            c if c.is_whitespace() => {
                if !word.is_empty() {
                    tokens.push(std::mem::take(&mut word));
                }
            }
            c => word.push(c),
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }
    tokens
}

struct Parser {
    tokens: Vec<String>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn next(&mut self) -> Option<String> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some("or") {
            self.pos += 1;
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        loop {
            match self.peek() {
                Some("and") => self.pos += 1,
                // implicit conjunction
                Some(t) if t != "or" && t != ")" => {}
                _ => break,
            }
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.next().as_deref() {
            Some("not") => Ok(Expr::Not(Box::new(self.unary()?))),
            Some("(") => {
                let inner = self.or_expr()?;
                match self.next().as_deref() {
                    Some(")") => Ok(inner),
                    _ => Err(HarvesterError::parse("largefiles: missing ')'")),
                }
            }
            Some(token) => term(token),
            None => Err(HarvesterError::parse("largefiles: expression ends early")),
        }
    }
}

fn term(token: &str) -> Result<Expr> {
    match token {
        "anything" => return Ok(Expr::Anything),
        "nothing" => return Ok(Expr::Nothing),
        _ => {}
    }
    let (name, value) = token
        .split_once('=')
        .ok_or_else(|| HarvesterError::parse(format!("largefiles: unknown term {token:?}")))?;
    match name {
        "include" => Ok(Expr::Include(Glob::new(value)?)),
        "exclude" => Ok(Expr::Exclude(Glob::new(value)?)),
        "largerthan" => Ok(Expr::LargerThan(parse_size(value)?)),
        "smallerthan" => Ok(Expr::SmallerThan(parse_size(value)?)),
        other => Err(HarvesterError::parse(format!(
            "largefiles: unsupported term {other:?}"
        ))),
    }
}

/// Parse sizes like `100`, `10kb`, `1.5MiB`.
pub fn parse_size(raw: &str) -> Result<u64> {
    let lower = raw.trim().to_ascii_lowercase();
    let split = lower
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(lower.len());
    let (number, unit) = lower.split_at(split);

    let number: f64 = number
        .parse()
        .map_err(|_| HarvesterError::parse(format!("invalid size {raw:?}")))?;
    let multiplier: u64 = match unit {
        "" | "b" => 1,
        "kb" => 1_000,
        "kib" => 1 << 10,
        "mb" => 1_000_000,
        "mib" => 1 << 20,
        "gb" => 1_000_000_000,
        "gib" => 1 << 30,
        "tb" => 1_000_000_000_000,
        "tib" => 1 << 40,
        other => {
            return Err(HarvesterError::parse(format!(
                "invalid size unit {other:?} in {raw:?}"
            )));
        }
    };
    Ok((number * multiplier as f64).round() as u64)
}
