//! List helpers: splitting, joining, and the canonical shown form.
//!
//! Lists print as `{'a','b'}` and [`parse_shown`] is the inverse of that
//! form, so a list variable can round-trip through a report or a log line.

use crate::error::{CoreError, CoreResult};
use crate::rval::Rval;
use regex::Regex;

/// An ordered sequence of rvalues
pub type Rlist = Vec<Rval>;

/// Splits `input` on a separator character, honouring backslash escapes
/// (`a\,b` stays one node). Empty nodes are preserved.
pub fn split_on_char(input: &str, sep: char) -> Vec<String> {
    let mut out = Vec::new();
    let mut node = String::new();
    let mut escaped = false;
    for ch in input.chars() {
        if escaped {
            node.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == sep {
            out.push(std::mem::take(&mut node));
        } else {
            node.push(ch);
        }
    }
    if escaped {
        node.push('\\');
    }
    out.push(node);
    out
}

/// Splits `input` on every match of `pattern`, keeping at most `max`
/// separator-delimited nodes. Blank nodes are dropped unless `keep_blanks`
/// is set. The remainder after the final considered match becomes the last
/// node, mirroring the splitter the policy language exposes.
pub fn split_on_regex(
    input: &str,
    pattern: &str,
    max: usize,
    keep_blanks: bool,
) -> CoreResult<Vec<String>> {
    let re = Regex::new(pattern).map_err(|e| CoreError::InvalidRegex {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    let mut out = Vec::new();
    let mut rest = input;

    while out.len() < max {
        match re.find(rest) {
            Some(m) if m.end() > 0 => {
                let node = &rest[..m.start()];
                if keep_blanks || !node.is_empty() {
                    out.push(node.to_string());
                }
                rest = &rest[m.end()..];
            }
            _ => break,
        }
    }

    if out.len() < max && (keep_blanks || !rest.is_empty()) {
        out.push(rest.to_string());
    }

    Ok(out)
}

/// Renders a list in the canonical shown form `{'a','b'}`
pub fn show(list: &[Rval]) -> String {
    let mut out = String::from("{");
    for (i, item) in list.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('\'');
        out.push_str(&item.to_string());
        out.push('\'');
    }
    out.push('}');
    out
}

/// Parses the shown form back into a list of scalars. Inverse of [`show`]
/// for lists of scalars; nodes without quotes are taken verbatim after
/// brace stripping.
pub fn parse_shown(input: &str) -> Rlist {
    let mut out = Rlist::new();
    for node in split_on_char(input, ',') {
        let trimmed = node.trim_matches(|c: char| c.is_whitespace() || c == '{' || c == '}');
        if trimmed.is_empty() {
            continue;
        }
        let value = trimmed.trim_matches(|c| c == '\'' || c == '"');
        out.push(Rval::scalar(value));
    }
    out
}
