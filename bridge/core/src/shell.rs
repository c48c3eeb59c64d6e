//! POSIX shell helpers for remote scripts
//!
//! Every transport talks to the sandbox through `sh -c <script>`, so anything
//! interpolated into a script goes through [`quote`] and every identity that
//! ends up in a path or process tag goes through [`sanitize_identity`].

/// Prefix marking protocol lines on a watcher's output stream
pub const SENTINEL: &str = "@@SANDBOX-BRIDGE@@";

/// Single-quote `value` for `sh`
///
/// `it's` becomes `'it'\''s'`.
#[must_use]
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Restrict an identity to `[A-Za-z0-9._-]`
///
/// Identities already inside that set (and not starting with `.`) pass
/// through unchanged. Anything else has each offending character mapped to
/// `_` and gets a `~` plus the CRC-32 of the original appended, so `a/b` and
/// `a_b` never share a pipe, inbox or watcher. `~` is outside the allowed set,
/// which keeps rewritten names apart from untouched ones.
#[must_use]
pub fn sanitize_identity(identity: &str) -> String {
    let is_safe = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-');
    if !identity.is_empty() && !identity.starts_with('.') && identity.chars().all(is_safe) {
        return identity.to_string();
    }

    let mut out: String = identity
        .chars()
        .map(|c| if is_safe(c) { c } else { '_' })
        .collect();
    if out.starts_with('.') {
        out.replace_range(0..1, "_");
    }
    format!("{out}~{:08x}", crc32fast::hash(identity.as_bytes()))
}

/// A `pkill -f` pattern matching `tag` that does not match itself
///
/// `bridge-x` becomes `[b]ridge-x`: the regex still matches the tagged
/// process, but the shell running `pkill` no longer contains the literal tag
/// in its own command line. Dots are escaped.
#[must_use]
pub fn self_excluding_pattern(tag: &str) -> String {
    let mut chars = tag.chars();
    match chars.next() {
        Some(first) => format!("[{first}]{}", chars.as_str().replace('.', "\\.")),
        None => String::new(),
    }
}

/// Strip the [`SENTINEL`] prefix from a watcher line
#[must_use]
pub fn strip_sentinel(line: &str) -> Option<&str> {
    line.strip_prefix(SENTINEL)
}
