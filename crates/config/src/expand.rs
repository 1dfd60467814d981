//! Environment placeholder expansion.
//!
//! Config string values may reference environment variables as `${VAR}` or
//! `$VAR`. Expansion happens eagerly at load time; unset variables expand to
//! the empty string with one warning per variable name per load.

use std::collections::HashSet;

/// Expands `${VAR}` and `$VAR` references in `input`.
///
/// `$VAR` consumes `[A-Za-z0-9_]+` after the dollar sign. A literal `$` not
/// followed by a name or `{` passes through unchanged. `warned` deduplicates
/// missing-variable warnings across one load pass.
pub fn expand_env(input: &str, warned: &mut HashSet<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }

        match chars.peek() {
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed && is_var_name(&name) {
                    out.push_str(&lookup(&name, warned));
                } else {
                    // Unterminated or malformed: keep the original text.
                    out.push_str(&input[idx..idx + 2 + name.len() + usize::from(closed)]);
                }
            }
            Some((_, c)) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&lookup(&name, warned));
            }
            _ => out.push('$'),
        }
    }

    out
}

/// Whether `input` is a single pure placeholder (`${VAR}` or `$VAR`) and
/// nothing else. Pure placeholders become env-sourced credentials so key
/// rotation is picked up at reload.
pub fn pure_placeholder(input: &str) -> Option<&str> {
    if let Some(inner) = input.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        return is_var_name(inner).then_some(inner);
    }
    if let Some(name) = input.strip_prefix('$') {
        return is_var_name(name).then_some(name);
    }
    None
}

fn is_var_name(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        && !s.as_bytes()[0].is_ascii_digit()
}

fn lookup(name: &str, warned: &mut HashSet<String>) -> String {
    match std::env::var(name) {
        Ok(v) => v,
        Err(_) => {
            if warned.insert(name.to_string()) {
                tracing::warn!(var = %name, "environment variable not set, expanding to empty");
            }
            String::new()
        }
    }
}
