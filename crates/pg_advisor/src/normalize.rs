//! Comment and literal stripping for keyword matching.
//!
//! Rules never look at the raw SQL. They match against a lowercased copy in
//! which comments are blanked and quoted bodies are collapsed, so that
//! `WHERE note = 'select * from x'` cannot trigger anything.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static WHERE_KW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bwhere\b").unwrap());
static ORDER_BY_KW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\border\s+by\b").unwrap());
static CLAUSE_STOP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:group\s+by|order\s+by|limit|offset|having|union)\b").unwrap()
});
/// Where a JOIN fragment ends: the next JOIN or any clause keyword.
pub(crate) static JOIN_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:join|where|group\s+by|order\s+by|limit|offset|having|union)\b").unwrap()
});

/// A quoted literal that was collapsed to `''` in the normalized text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiteralSpan {
    /// Byte offset of the `''` placeholder in the normalized text.
    pub offset: usize,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryText {
    raw: String,
    normalized: String,
    literals: Vec<LiteralSpan>,
}

impl QueryText {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let (normalized, literals) = normalize(&raw);
        Self {
            raw,
            normalized,
            literals,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    pub fn literals(&self) -> &[LiteralSpan] {
        &self.literals
    }

    /// Returns the literal whose placeholder starts at `offset`.
    pub fn literal_at(&self, offset: usize) -> Option<&LiteralSpan> {
        self.literals
            .binary_search_by_key(&offset, |literal| literal.offset)
            .ok()
            .map(|idx| &self.literals[idx])
    }

    pub fn is_blank(&self) -> bool {
        self.normalized.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clause {
    Where,
    OrderBy,
}

/// Text of `clause` up to the nearest clause boundary at the same nesting
/// level, trimmed.
///
/// WHERE is the first one outside parentheses and ORDER BY the last, so a
/// CTE filter or a window `OVER (ORDER BY ..)` does not shadow the statement's
/// own clause. A clause found only inside parentheses is used as a fallback.
/// The boundary set is `group by`, `order by`, `limit`, `offset`, `having`
/// and `union`. Returns an empty string when the clause is absent.
pub fn clause_body(text: &str, clause: Clause) -> &str {
    let start = match clause {
        Clause::Where => &*WHERE_KW,
        Clause::OrderBy => &*ORDER_BY_KW,
    };

    let mut depth = 0i32;
    let mut cursor = 0;
    let mut nested = None;
    let mut top_level = None;
    for found in start.find_iter(text) {
        depth += paren_delta(&text[cursor..found.start()]);
        cursor = found.start();
        if depth != 0 {
            nested = nested.or(Some(found));
            continue;
        }
        top_level = Some(found);
        if clause == Clause::Where {
            break;
        }
    }
    let Some(found) = top_level.or(nested) else {
        return "";
    };
    let end = scan_to_boundary(text, found.end(), &CLAUSE_STOP);
    text[found.end()..end].trim()
}

fn paren_delta(text: &str) -> i32 {
    text.bytes().fold(0, |depth, byte| match byte {
        b'(' => depth + 1,
        b')' => depth - 1,
        _ => depth,
    })
}

/// Position of the first `stop` match outside nested parentheses, or of the
/// `)` closing the enclosing group, or end of text.
pub(crate) fn scan_to_boundary(text: &str, from: usize, stop: &Regex) -> usize {
    let mut stops = stop
        .find_iter(&text[from..])
        .map(|m| from + m.start())
        .peekable();
    let mut depth = 0i32;
    for (idx, byte) in text.bytes().enumerate().skip(from) {
        while stops.next_if(|&at| at < idx).is_some() {}
        if depth == 0 && stops.peek() == Some(&idx) {
            return idx;
        }
        match byte {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth < 0 {
                    return idx;
                }
            }
            _ => {}
        }
    }
    text.len()
}

fn normalize(raw: &str) -> (String, Vec<LiteralSpan>) {
    let mut out = String::with_capacity(raw.len());
    let mut literals = Vec::new();
    let mut i = 0;

    while i < raw.len() {
        let rest = &raw[i..];

        if rest.starts_with("--") {
            out.push(' ');
            i = rest.find('\n').map_or(raw.len(), |newline| i + newline);
            continue;
        }
        if rest.starts_with("/*") {
            out.push(' ');
            i = skip_block_comment(raw, i);
            continue;
        }

        let Some(ch) = rest.chars().next() else {
            break;
        };
        match ch {
            '\'' => {
                let backslash_escapes = ends_with_escape_prefix(&out);
                let (body, next) = read_quoted(raw, i + 1, '\'', backslash_escapes);
                literals.push(LiteralSpan {
                    offset: out.len(),
                    body,
                });
                out.push_str("''");
                i = next;
            }
            '"' => {
                let (_, next) = read_quoted(raw, i + 1, '"', false);
                out.push_str("\"\"");
                i = next;
            }
            '$' => match dollar_tag_len(rest).filter(|_| !continues_identifier(&out)) {
                Some(tag_len) => {
                    let tag = &rest[..tag_len];
                    let body_start = i + tag_len;
                    let (body, next) = match raw[body_start..].find(tag) {
                        Some(len) => (&raw[body_start..body_start + len], body_start + len + tag_len),
                        None => (&raw[body_start..], raw.len()),
                    };
                    literals.push(LiteralSpan {
                        offset: out.len(),
                        body: body.to_string(),
                    });
                    out.push_str("''");
                    i = next;
                }
                None => {
                    out.push('$');
                    i += 1;
                }
            },
            _ => {
                out.extend(ch.to_lowercase());
                i += ch.len_utf8();
            }
        }
    }

    (out, literals)
}

/// Postgres block comments nest.
fn skip_block_comment(raw: &str, start: usize) -> usize {
    let bytes = raw.as_bytes();
    let mut depth = 0usize;
    let mut i = start;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    raw.len()
}

fn read_quoted(raw: &str, start: usize, quote: char, backslash_escapes: bool) -> (String, usize) {
    let mut body = String::new();
    let mut chars = raw[start..].char_indices().peekable();
    while let Some((offset, ch)) = chars.next() {
        if backslash_escapes && ch == '\\' {
            if let Some((_, escaped)) = chars.next() {
                body.push(escaped);
            }
            continue;
        }
        if ch == quote {
            if matches!(chars.peek(), Some((_, next)) if *next == quote) {
                chars.next();
                body.push(quote);
                continue;
            }
            return (body, start + offset + ch.len_utf8());
        }
        body.push(ch);
    }
    (body, raw.len())
}

// E'...' strings honour backslash escapes.
fn ends_with_escape_prefix(out: &str) -> bool {
    let mut tail = out.chars().rev();
    tail.next() == Some('e') && !tail.next().is_some_and(is_word_char)
}

/// Length of an opening `$tag$` delimiter, or `None` for `$1`-style parameters.
fn dollar_tag_len(rest: &str) -> Option<usize> {
    let close = rest[1..].find('$')? + 1;
    let tag = &rest[1..close];
    let valid = match tag.chars().next() {
        None => true,
        Some(first) => {
            (first.is_alphabetic() || first == '_') && tag.chars().all(is_word_char)
        }
    };
    valid.then_some(close + 1)
}

// `$` is legal inside identifiers (`a$b`), where it never opens a dollar quote.
fn continues_identifier(out: &str) -> bool {
    out.chars()
        .next_back()
        .is_some_and(|ch| ch == '$' || is_word_char(ch))
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}
