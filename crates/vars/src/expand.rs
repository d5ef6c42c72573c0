//! Textual variable expansion.
//!
//! Scalars may embed `$(name)` or `${name}` references; a reference whose
//! referent is currently a scalar is substituted, anything else (a list, an
//! undefined variable, too many nesting levels) stays verbatim and marks
//! the result as not fully resolved. Naked list references `@(name)` are
//! only legal as a full rvalue slot and are handled by
//! [`copy_rval_in_context`], never inside a string.

use crate::scopes::ScopeStore;
use converge_core::rval::{self, DataType, Rval};
use tracing::debug;

/// Expansion recursion limit; deeper nests are left verbatim
const MAX_EXPAND_DEPTH: usize = 20;

/// True when `s` contains a scalar reference token `$(...)` or `${...}`
pub fn is_expandable(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' {
            match bytes[i + 1] {
                b'(' if bytes[i + 2..].contains(&b')') => return true,
                b'{' if bytes[i + 2..].contains(&b'}') => return true,
                _ => {}
            }
        }
        i += 1;
    }
    false
}

/// Finds the matching close bracket for the reference opening at
/// `open_idx` (the bracket character itself), honouring nesting of the
/// same bracket kind
fn matching_close(bytes: &[u8], open_idx: usize) -> Option<usize> {
    let open = bytes[open_idx];
    let close = if open == b'(' { b')' } else { b'}' };
    let mut depth = 0usize;
    for (i, &b) in bytes.iter().enumerate().skip(open_idx) {
        if b == open {
            depth += 1;
        } else if b == close {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

/// Substitutes every scalar reference in `input` that currently resolves.
/// Returns the expanded string and whether every reference was resolved.
pub fn expand_scalar(store: &ScopeStore, scope: &str, input: &str) -> (String, bool) {
    expand_scalar_depth(store, scope, input, 0)
}

fn expand_scalar_depth(
    store: &ScopeStore,
    scope: &str,
    input: &str,
    depth: usize,
) -> (String, bool) {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut fully = true;
    let mut i = 0;

    while i < bytes.len() {
        let is_ref_open = bytes[i] == b'$'
            && i + 1 < bytes.len()
            && (bytes[i + 1] == b'(' || bytes[i + 1] == b'{');
        if !is_ref_open {
            // Multi-byte characters are copied through untouched
            let ch_len = utf8_len(bytes[i]);
            out.push_str(&input[i..i + ch_len]);
            i += ch_len;
            continue;
        }

        let Some(close) = matching_close(bytes, i + 1) else {
            // Unterminated reference; literal dollar
            out.push('$');
            i += 1;
            continue;
        };
        let token = &input[i..close + 1];
        let inner = &input[i + 2..close];

        let name = if is_expandable(inner) {
            if depth >= MAX_EXPAND_DEPTH {
                debug!(token, "expansion depth limit hit");
                out.push_str(token);
                fully = false;
                i = close + 1;
                continue;
            }
            let (expanded, ok) = expand_scalar_depth(store, scope, inner, depth + 1);
            if !ok {
                out.push_str(token);
                fully = false;
                i = close + 1;
                continue;
            }
            expanded
        } else {
            inner.to_string()
        };

        match store.get_variable(scope, &name) {
            (Rval::Scalar(value), dtype) if dtype != DataType::None => {
                if is_expandable(&value) {
                    fully = false;
                }
                out.push_str(&value);
            }
            _ => {
                // Undefined or list-typed: token stays verbatim
                out.push_str(token);
                fully = false;
            }
        }
        i = close + 1;
    }

    (out, fully)
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        b if b < 0x80 => 1,
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}

/// Deep-copies an rvalue in the context of a scope, splicing naked list
/// references: a list element `@(x)` whose referent is a typed list is
/// replaced by the referent's elements. Anything else copies literally.
pub fn copy_rval_in_context(store: &ScopeStore, scope: &str, rval: &Rval) -> Rval {
    match rval {
        Rval::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let naked = item
                    .as_scalar()
                    .filter(|s| rval::is_naked_var(s, '@'))
                    .map(rval::get_naked);
                match naked {
                    Some(name) => match store.get_variable(scope, name) {
                        (Rval::List(referent), dtype) if dtype.is_list() => {
                            out.extend(referent.into_iter());
                        }
                        _ => out.push(item.clone()),
                    },
                    None => out.push(item.clone()),
                }
            }
            Rval::List(out)
        }
        other => other.clone(),
    }
}

/// Expands every scalar inside an rvalue once, in the given scope. Used
/// for the dangler pass after scope augmentation.
pub fn expand_private_rval(store: &ScopeStore, scope: &str, rval: &Rval) -> Rval {
    match rval {
        Rval::Scalar(s) => {
            if is_expandable(s) {
                let (expanded, _) = expand_scalar(store, scope, s);
                Rval::Scalar(expanded)
            } else {
                rval.clone()
            }
        }
        Rval::List(items) => Rval::List(
            items
                .iter()
                .map(|item| expand_private_rval(store, scope, item))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_core::rval::DataType;

    fn store_with(vars: &[(&str, &str)]) -> ScopeStore {
        let store = ScopeStore::new();
        store.new_scope("main");
        for (lval, value) in vars {
            store.put_scalar("main", lval, value, DataType::String);
        }
        store
    }

    #[test]
    fn test_simple_expansion() {
        let store = store_with(&[("name", "world")]);
        let (out, fully) = expand_scalar(&store, "main", "hello $(name)!");
        assert_eq!(out, "hello world!");
        assert!(fully);
    }

    #[test]
    fn test_brace_form() {
        let store = store_with(&[("name", "world")]);
        let (out, fully) = expand_scalar(&store, "main", "hello ${name}!");
        assert_eq!(out, "hello world!");
        assert!(fully);
    }

    #[test]
    fn test_undefined_stays_verbatim() {
        let store = store_with(&[]);
        let (out, fully) = expand_scalar(&store, "main", "a $(missing) b");
        assert_eq!(out, "a $(missing) b");
        assert!(!fully);
    }

    #[test]
    fn test_list_reference_stays_verbatim() {
        let store = ScopeStore::new();
        store.new_scope("main");
        store.put_list(
            "main",
            "l",
            vec![Rval::scalar("x")],
            DataType::StringList,
        );
        let (out, fully) = expand_scalar(&store, "main", "have $(l)");
        assert_eq!(out, "have $(l)");
        assert!(!fully);
    }

    #[test]
    fn test_qualified_expansion() {
        let store = ScopeStore::new();
        store.new_scope("g");
        store.put_scalar("g", "domain", "example.com", DataType::String);
        let (out, fully) = expand_scalar(&store, "main", "host.$(g.domain)");
        assert_eq!(out, "host.example.com");
        assert!(fully);
    }

    #[test]
    fn test_nested_reference() {
        let store = store_with(&[("which", "primary"), ("primary", "10.0.0.1")]);
        let (out, fully) = expand_scalar(&store, "main", "$($(which))");
        assert_eq!(out, "10.0.0.1");
        assert!(fully);
    }

    #[test]
    fn test_mangled_intermediate_names_round_trip() {
        let store = store_with(&[]);
        let (out, fully) = expand_scalar(&store, "main", "$(ns*bundle#list)");
        assert_eq!(out, "$(ns*bundle#list)");
        assert!(!fully);
    }

    #[test]
    fn test_literal_dollars_untouched() {
        let store = store_with(&[]);
        let (out, fully) = expand_scalar(&store, "main", "price $5 ok$");
        assert_eq!(out, "price $5 ok$");
        assert!(fully);
    }

    #[test]
    fn test_naked_list_splice() {
        let store = ScopeStore::new();
        store.new_scope("main");
        store.put_list(
            "main",
            "base",
            vec![Rval::scalar("a"), Rval::scalar("b")],
            DataType::StringList,
        );
        let source = Rval::List(vec![Rval::scalar("@(base)"), Rval::scalar("c")]);
        let copied = copy_rval_in_context(&store, "main", &source);
        assert_eq!(copied, Rval::list_of(vec!["a", "b", "c"]));
    }

    #[test]
    fn test_naked_splice_of_undefined_copies_literally() {
        let store = ScopeStore::new();
        store.new_scope("main");
        let source = Rval::List(vec![Rval::scalar("@(nothing)")]);
        let copied = copy_rval_in_context(&store, "main", &source);
        assert_eq!(copied, source);
    }
}
