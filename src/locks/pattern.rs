//! Path glob patterns and the conflict test used for path locks.
//!
//! Two patterns conflict when some path could be matched by both, or when
//! one names a directory that contains something the other matches. The
//! test compares segment by segment and is sound: it never reports two
//! overlapping patterns as disjoint. It is conservative around `**`, which
//! conflicts with anything whose preceding segments overlap.
//!
//! Supported syntax: `*` and `?` within a segment, `[abc]` / `[a-z]` /
//! `[!x]` classes, `**` for any depth, and `{a,b}` alternation.

use std::fmt;

const MAX_ALTERNATIVES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("lock path is empty")]
    Empty,

    #[error("lock path {0:?} must not contain '..'")]
    ParentTraversal(String),

    #[error("lock path {0:?} has an unbalanced brace")]
    UnbalancedBrace(String),

    #[error("lock path {0:?} has an unclosed character class")]
    UnclosedClass(String),

    #[error("lock path {0:?} expands to too many alternatives")]
    TooManyAlternatives(String),
}

/// One token of a single-segment glob.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Char(char),
    Star,
    Any,
    Class { ranges: Vec<(char, char)>, negated: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Glob(Vec<Token>),
    /// `**`
    AnyDepth,
}

/// A validated, normalized lock path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    normalized: String,
    alternatives: Vec<Vec<Segment>>,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        let normalized = normalize(raw);
        if normalized.is_empty() {
            return Err(PatternError::Empty);
        }

        let expanded = expand_braces(&normalized)
            .map_err(|()| PatternError::UnbalancedBrace(raw.to_string()))?;
        if expanded.len() > MAX_ALTERNATIVES {
            return Err(PatternError::TooManyAlternatives(raw.to_string()));
        }

        let mut alternatives = Vec::with_capacity(expanded.len());
        for alt in expanded {
            let mut segments = Vec::new();
            if alt.starts_with('/') {
                segments.push(Segment::Literal("/".into()));
            }
            for part in alt.split('/').filter(|p| !p.is_empty()) {
                if part == ".." {
                    return Err(PatternError::ParentTraversal(raw.to_string()));
                }
                segments.push(parse_segment(part).ok_or_else(|| PatternError::UnclosedClass(raw.to_string()))?);
            }
            alternatives.push(segments);
        }

        Ok(Self {
            normalized,
            alternatives,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    /// Whether a lock on `self` and a lock on `other` may cover the same path.
    pub fn conflicts_with(&self, other: &PathPattern) -> bool {
        self.alternatives
            .iter()
            .any(|a| other.alternatives.iter().any(|b| sequences_overlap(a, b)))
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized)
    }
}

/// Trim, drop `./` components, collapse repeated slashes, drop trailing slash.
fn normalize(raw: &str) -> String {
    let raw = raw.trim();
    let absolute = raw.starts_with('/');
    let joined = raw
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect::<Vec<_>>()
        .join("/");
    if absolute { format!("/{joined}") } else { joined }
}

/// Expand `{a,b}` groups into every alternative.
fn expand_braces(s: &str) -> Result<Vec<String>, ()> {
    let Some(open) = s.find('{') else {
        if s.contains('}') {
            return Err(());
        }
        return Ok(vec![s.to_string()]);
    };

    let mut depth = 0usize;
    let mut close = None;
    let mut splits = Vec::new();
    for (i, c) in s[open..].char_indices() {
        let at = open + i;
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(at);
                    break;
                }
            }
            ',' if depth == 1 => splits.push(at),
            _ => {}
        }
    }
    let close = close.ok_or(())?;

    let head = &s[..open];
    let tail = &s[close + 1..];
    let mut bounds = vec![open];
    bounds.extend(splits);
    bounds.push(close);

    let mut out = Vec::new();
    for w in bounds.windows(2) {
        let choice = &s[w[0] + 1..w[1]];
        for expanded in expand_braces(&format!("{head}{choice}{tail}"))? {
            out.push(expanded);
            if out.len() > MAX_ALTERNATIVES {
                return Ok(out);
            }
        }
    }
    Ok(out)
}

fn parse_segment(part: &str) -> Option<Segment> {
    if part == "**" {
        return Some(Segment::AnyDepth);
    }
    if !part.contains(['*', '?', '[']) {
        return Some(Segment::Literal(part.to_string()));
    }

    let chars: Vec<char> = part.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                // `**` inside a segment behaves like `*`
                if tokens.last() != Some(&Token::Star) {
                    tokens.push(Token::Star);
                }
            }
            '?' => tokens.push(Token::Any),
            '[' => {
                let mut j = i + 1;
                let negated = matches!(chars.get(j), Some('!') | Some('^'));
                if negated {
                    j += 1;
                }
                let mut ranges = Vec::new();
                let mut first = true;
                loop {
                    let c = *chars.get(j)?;
                    if c == ']' && !first {
                        break;
                    }
                    first = false;
                    if chars.get(j + 1) == Some(&'-') && chars.get(j + 2).is_some_and(|&e| e != ']') {
                        ranges.push((c, chars[j + 2]));
                        j += 3;
                    } else {
                        ranges.push((c, c));
                        j += 1;
                    }
                }
                tokens.push(Token::Class { ranges, negated });
                i = j;
            }
            c => tokens.push(Token::Char(c)),
        }
        i += 1;
    }
    Some(Segment::Glob(tokens))
}

fn token_matches(token: &Token, c: char) -> bool {
    match token {
        Token::Char(t) => *t == c,
        Token::Any => true,
        Token::Class { ranges, negated } => {
            ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&c)) != *negated
        }
        Token::Star => true,
    }
}

/// Single-pass matcher that backtracks only to the most recent `*`, so
/// the cost stays at `tokens * text` however many stars a segment has.
fn glob_match(tokens: &[Token], text: &[char]) -> bool {
    let (mut t, mut i) = (0, 0);
    let mut resume: Option<(usize, usize)> = None;
    while i < text.len() {
        match tokens.get(t) {
            Some(Token::Star) => {
                resume = Some((t + 1, i));
                t += 1;
            }
            Some(token) if token_matches(token, text[i]) => {
                t += 1;
                i += 1;
            }
            _ => match resume {
                Some((after_star, from)) => {
                    t = after_star;
                    i = from + 1;
                    resume = Some((after_star, from + 1));
                }
                None => return false,
            },
        }
    }
    tokens[t..].iter().all(|token| *token == Token::Star)
}

/// Literal characters before the first wildcard.
fn literal_prefix(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map_while(|t| match t {
            Token::Char(c) => Some(*c),
            _ => None,
        })
        .collect()
}

/// Literal characters after the last wildcard.
fn literal_suffix(tokens: &[Token]) -> String {
    let mut rev: Vec<char> = tokens
        .iter()
        .rev()
        .map_while(|t| match t {
            Token::Char(c) => Some(*c),
            _ => None,
        })
        .collect();
    rev.reverse();
    rev.into_iter().collect()
}

fn segments_overlap(a: &Segment, b: &Segment) -> bool {
    match (a, b) {
        (Segment::AnyDepth, _) | (_, Segment::AnyDepth) => true,
        (Segment::Literal(x), Segment::Literal(y)) => x == y,
        (Segment::Literal(lit), Segment::Glob(tokens)) | (Segment::Glob(tokens), Segment::Literal(lit)) => {
            let chars: Vec<char> = lit.chars().collect();
            glob_match(tokens, &chars)
        }
        (Segment::Glob(x), Segment::Glob(y)) => {
            // Every match of a glob starts with its literal prefix and ends
            // with its literal suffix; if either pair diverges they are disjoint.
            let (px, py) = (literal_prefix(x), literal_prefix(y));
            let (sx, sy) = (literal_suffix(x), literal_suffix(y));
            (px.starts_with(&py) || py.starts_with(&px)) && (sx.ends_with(&sy) || sy.ends_with(&sx))
        }
    }
}

fn sequences_overlap(a: &[Segment], b: &[Segment]) -> bool {
    match (a.split_first(), b.split_first()) {
        // One side names an ancestor directory of (or the same path as) the other.
        (None, _) | (_, None) => true,
        (Some((Segment::AnyDepth, _)), _) | (_, Some((Segment::AnyDepth, _))) => true,
        (Some((x, rest_a)), Some((y, rest_b))) => {
            segments_overlap(x, y) && sequences_overlap(rest_a, rest_b)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> PathPattern {
        PathPattern::parse(s).unwrap()
    }

    fn conflict(a: &str, b: &str) -> bool {
        let (a, b) = (p(a), p(b));
        let forward = a.conflicts_with(&b);
        assert_eq!(forward, b.conflicts_with(&a), "conflict test must be symmetric");
        forward
    }

    #[test]
    fn identical_patterns_conflict() {
        assert!(conflict("src/**", "src/**"));
        assert!(conflict("./src//lib.rs", "src/lib.rs"));
    }

    #[test]
    fn subset_patterns_conflict() {
        assert!(conflict("src/**", "src/lib/mod.rs"));
        assert!(conflict("src/*.rs", "src/main.rs"));
        assert!(conflict("src", "src/main.rs"));
        assert!(conflict("*.rs", "main.*"));
        assert!(conflict("docs/**", "docs"));
    }

    #[test]
    fn disjoint_patterns_do_not_conflict() {
        assert!(!conflict("src/**", "docs/**"));
        assert!(!conflict("src/*.rs", "src/*.md"));
        assert!(!conflict("src/*.rs", "src/lib/mod.rs"));
        assert!(!conflict("api/v1/*", "api/v2/*"));
        assert!(!conflict("src/a?.rs", "src/b1.rs"));
    }

    #[test]
    fn leading_any_depth_is_conservative() {
        assert!(conflict("**/*.rs", "docs/readme.md"));
    }

    #[test]
    fn brace_alternation() {
        assert!(conflict("{src,tests}/**", "tests/it.rs"));
        assert!(!conflict("{src,tests}/**", "docs/x.md"));
    }

    #[test]
    fn character_classes() {
        assert!(conflict("log[0-9].txt", "log7.txt"));
        assert!(!conflict("log[0-9].txt", "logx.txt"));
        assert!(conflict("log[!0-9].txt", "logx.txt"));
    }

    #[test]
    fn star_heavy_segment_is_not_exponential() {
        let many_stars = format!("{}b", "a*".repeat(30));
        let long_name = "a".repeat(200);
        assert!(!conflict(&many_stars, &long_name));
        assert!(conflict(&many_stars, &format!("{long_name}b")));
        assert!(conflict("*.rs", "lib.rs"));
        assert!(!conflict("*.rs", "lib.rs.bak"));
    }

    #[test]
    fn rejects_bad_patterns() {
        assert_eq!(PathPattern::parse("  "), Err(PatternError::Empty));
        assert!(matches!(PathPattern::parse("../etc"), Err(PatternError::ParentTraversal(_))));
        assert!(matches!(PathPattern::parse("src/{a,b"), Err(PatternError::UnbalancedBrace(_))));
        assert!(matches!(PathPattern::parse("src/[ab"), Err(PatternError::UnclosedClass(_))));
    }
}
