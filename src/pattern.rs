// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Single-pass matcher for URI-style globs with capture groups.
//!
//! The grammar is a conventional glob (`*`, `?`, `[...]`, `\c`) extended
//! with `{ident}` capture groups. Wildcards never cross `/`. Multi-character
//! wildcards bind the *shortest* run that lets the remainder of the pattern
//! match; a capture in terminal position instead greedily consumes up to the
//! next `/` or the end of the input, and wildcards before it stretch so the
//! capture keeps the shortest possible tail (`{x}-*-{y}` over `a-b-c-d`
//! binds `x = "a"`, `y = "d"`).

use crate::{Error, Result};

/// Maximum number of capture groups per pattern.
pub const MAX_CAPTURES: usize = 8;

/// Capture groups bound during a successful match.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Captures(Vec<(String, String)>);

impl Captures {
    /// Returns the value bound to `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Iterates over `(name, value)` pairs in binding order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Returns the number of bound groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no groups are bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Tok<'p> {
    Lit(char),
    AnyChar,
    Star,
    Class { negated: bool, ranges: Vec<(char, char)> },
    Capture(&'p str),
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn parse(pattern: &str) -> Result<Vec<Tok<'_>>> {
    let mut toks = vec![];
    let mut names: Vec<&str> = vec![];
    let mut chars = pattern.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        let tok = match c {
            '\\' => {
                let Some((_, lit)) = chars.next() else {
                    return Err(Error::BadPattern("trailing backslash"));
                };
                Tok::Lit(lit)
            }
            '*' => {
                if matches!(toks.last(), Some(Tok::Capture(_))) {
                    return Err(Error::BadPattern("wildcard adjacent to capture"));
                }
                Tok::Star
            }
            '?' => Tok::AnyChar,
            '[' => parse_class(&mut chars)?,
            '{' => {
                let mut end = None;

                for (i, c) in chars.by_ref() {
                    if c == '}' {
                        end = Some(i);
                        break;
                    }
                    if !is_ident_char(c) {
                        return Err(Error::BadPattern("invalid capture identifier"));
                    }
                }

                let Some(end) = end else {
                    return Err(Error::BadPattern("unclosed capture group"));
                };

                let name = pattern.get(pos + 1..end).unwrap_or_default();

                if name.is_empty() {
                    return Err(Error::BadPattern("empty capture identifier"));
                }
                if names.contains(&name) {
                    return Err(Error::BadPattern("duplicate capture identifier"));
                }
                if names.len() == MAX_CAPTURES {
                    return Err(Error::BadPattern("too many capture groups"));
                }
                if matches!(toks.last(), Some(Tok::Star | Tok::Capture(_))) {
                    return Err(Error::BadPattern("capture adjacent to wildcard"));
                }

                names.push(name);
                Tok::Capture(name)
            }
            _ => Tok::Lit(c),
        };

        toks.push(tok);
    }

    Ok(toks)
}

fn parse_class(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
) -> Result<Tok<'static>> {
    let negated = matches!(chars.peek(), Some((_, '^')));
    if negated {
        chars.next();
    }

    let mut ranges = vec![];
    let mut closed = false;

    while let Some((_, c)) = chars.next() {
        let lo = match c {
            ']' => {
                closed = true;
                break;
            }
            '\\' => {
                let Some((_, esc)) = chars.next() else {
                    return Err(Error::BadPattern("trailing backslash"));
                };
                esc
            }
            _ => c,
        };

        // Range if a `-` follows that is not the closing position
        let hi = if matches!(chars.peek(), Some((_, '-'))) {
            chars.next();
            match chars.next() {
                Some((_, ']')) | None => return Err(Error::BadPattern("unclosed class range")),
                Some((_, '\\')) => {
                    let Some((_, esc)) = chars.next() else {
                        return Err(Error::BadPattern("trailing backslash"));
                    };
                    esc
                }
                Some((_, hi)) => hi,
            }
        } else {
            lo
        };

        if hi < lo {
            return Err(Error::BadPattern("inverted class range"));
        }

        ranges.push((lo, hi));
    }

    if !closed {
        return Err(Error::BadPattern("unclosed character class"));
    }
    if ranges.is_empty() {
        return Err(Error::BadPattern("empty character class"));
    }

    Ok(Tok::Class { negated, ranges })
}

fn class_matches(negated: bool, ranges: &[(char, char)], c: char) -> bool {
    if c == '/' {
        return false;
    }
    let hit = ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi);
    hit != negated
}

fn match_here(toks: &[Tok<'_>], name: &str, caps: &mut Vec<(String, String)>) -> bool {
    let Some((tok, rest)) = toks.split_first() else {
        return name.is_empty();
    };

    match tok {
        Tok::Lit(lit) => {
            let mut it = name.chars();
            it.next() == Some(*lit) && match_here(rest, it.as_str(), caps)
        }

        Tok::AnyChar => {
            let mut it = name.chars();
            matches!(it.next(), Some(c) if c != '/') && match_here(rest, it.as_str(), caps)
        }

        Tok::Class { negated, ranges } => {
            let mut it = name.chars();
            matches!(it.next(), Some(c) if class_matches(*negated, ranges, c))
                && match_here(rest, it.as_str(), caps)
        }

        Tok::Star => {
            // A trailing capture owns the shortest tail of the segment,
            // so a wildcard ahead of it stretches as far as it can;
            // everywhere else the shortest extent wins
            if matches!(rest.last(), Some(Tok::Capture(_))) {
                let seg_len = name.find('/').unwrap_or(name.len());
                let mut i = seg_len;

                loop {
                    if match_here(rest, name.get(i..).unwrap_or_default(), caps) {
                        return true;
                    }
                    if i == 0 {
                        return false;
                    }
                    i -= 1;
                    while i > 0 && !name.is_char_boundary(i) {
                        i -= 1;
                    }
                }
            }

            let mut tail = name;
            loop {
                if match_here(rest, tail, caps) {
                    return true;
                }
                let mut it = tail.chars();
                match it.next() {
                    Some(c) if c != '/' => tail = it.as_str(),
                    _ => return false,
                }
            }
        }

        Tok::Capture(ident) => {
            if rest.is_empty() {
                // Terminal capture greedily takes the rest of the segment
                if name.is_empty() || name.contains('/') {
                    return false;
                }
                caps.push(((*ident).to_owned(), name.to_owned()));
                return true;
            }

            // Non-empty shortest match within the segment
            let mut it = name.chars();
            let mut end = 0;

            while let Some(c) = it.next() {
                if c == '/' {
                    return false;
                }
                end += c.len_utf8();

                let Some(bound) = name.get(..end) else {
                    return false;
                };

                caps.push(((*ident).to_owned(), bound.to_owned()));
                if match_here(rest, it.as_str(), caps) {
                    return true;
                }
                caps.pop();
            }

            false
        }
    }
}

/// Matches `name` against `pattern`, returning the bound captures.
///
/// Returns `Ok(None)` if the pattern is valid but does not match, and
/// [`Error::BadPattern`] if the pattern itself is malformed.
pub fn match_pattern(pattern: &str, name: &str) -> Result<Option<Captures>> {
    let toks = parse(pattern)?;
    let mut caps = vec![];

    if match_here(&toks, name, &mut caps) {
        Ok(Some(Captures(caps)))
    } else {
        Ok(None)
    }
}

/// Matches `name` against `pattern`, discarding captures.
pub fn matches(pattern: &str, name: &str) -> Result<bool> {
    Ok(match_pattern(pattern, name)?.is_some())
}

/// Validates a pattern without matching anything.
pub fn verify(pattern: &str) -> Result<()> {
    parse(pattern).map(|_| ())
}

/// Returns `true` if the pattern contains at least one capture group.
#[must_use]
pub fn has_capture(pattern: &str) -> bool {
    parse(pattern)
        .map(|toks| toks.iter().any(|t| matches!(t, Tok::Capture(_))))
        .unwrap_or_default()
}

/// Rewrites capture groups as `*` so the result can be fed to a
/// conventional glob walker.
///
/// The walk result is a superset of the capture matches (a capture must
/// bind at least one character), so listing engines still post-filter
/// through [`match_pattern`].
pub fn to_glob(pattern: &str) -> Result<String> {
    let toks = parse(pattern)?;
    let mut out = String::with_capacity(pattern.len());

    for tok in &toks {
        match tok {
            Tok::Lit(c) => {
                if matches!(c, '*' | '?' | '[' | ']' | '{' | '}' | '\\') {
                    out.push('\\');
                }
                out.push(*c);
            }
            Tok::AnyChar => out.push('?'),
            Tok::Star | Tok::Capture(_) => out.push('*'),
            Tok::Class { negated, ranges } => {
                out.push('[');
                if *negated {
                    out.push('^');
                }
                for &(lo, hi) in ranges {
                    push_class_char(&mut out, lo);
                    if hi != lo {
                        out.push('-');
                        push_class_char(&mut out, hi);
                    }
                }
                out.push(']');
            }
        }
    }

    Ok(out)
}

fn push_class_char(out: &mut String, c: char) {
    if matches!(c, ']' | '-' | '^' | '\\') {
        out.push('\\');
    }
    out.push(c);
}

/// Expands a template against captures.
///
/// `$$` produces a literal `$`; `$ident` and `${ident}` expand the capture
/// group of that name. Referencing an undefined group is an error.
pub fn expand(template: &str, caps: &Captures) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek().copied() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
            }
            Some((start, '{')) => {
                chars.next();
                let mut end = None;
                for (i, c) in chars.by_ref() {
                    if c == '}' {
                        end = Some(i);
                        break;
                    }
                }
                let Some(end) = end else {
                    return Err(Error::BadTemplate("unclosed ${".into()));
                };
                let name = template.get(start + 1..end).unwrap_or_default();
                expand_one(&mut out, name, caps)?;
            }
            Some((start, c)) if is_ident_char(c) => {
                let mut end = start;
                while let Some(&(i, c)) = chars.peek() {
                    if !is_ident_char(c) {
                        break;
                    }
                    end = i + c.len_utf8();
                    chars.next();
                }
                let name = template.get(start..end).unwrap_or_default();
                expand_one(&mut out, name, caps)?;
            }
            _ => return Err(Error::BadTemplate("naked $".into())),
        }
    }

    Ok(out)
}

fn expand_one(out: &mut String, name: &str, caps: &Captures) -> Result<()> {
    if name.is_empty() || !name.chars().all(is_ident_char) {
        return Err(Error::BadTemplate(format!("invalid reference ${name:?}")));
    }
    match caps.get(name) {
        Some(v) => {
            out.push_str(v);
            Ok(())
        }
        None => Err(Error::BadTemplate(format!("undefined capture ${name}"))),
    }
}
