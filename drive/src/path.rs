//! Path sanitization for drive-relative paths.
//!
//! Paths are `/`-delimited and stored relative to a storage-location root.
//! The `::` delimiter separating location from path is reserved, so colons
//! are rewritten before a path ever reaches the hashtables.

/// Sanitize a user-supplied drive path into canonical form.
///
/// Replaces `:` with `;` (the location delimiter is reserved), collapses
/// runs of `/` into one, and strips leading/trailing separators. Idempotent
/// and infallible; the result may be empty.
pub fn sanitize(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_was_slash = true; // drop leading separators
    for c in path.chars() {
        match c {
            '/' => {
                if !prev_was_slash {
                    out.push('/');
                    prev_was_slash = true;
                }
            }
            ':' => {
                out.push(';');
                prev_was_slash = false;
            }
            c => {
                out.push(c);
                prev_was_slash = false;
            }
        }
    }
    if out.ends_with('/') {
        out.pop();
    }
    out
}

/// Final segment of a sanitized path, e.g. `"a/b/c.txt"` -> `"c.txt"`.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

/// Extension of a file name: the substring after the last `.`, without the
/// dot. Empty for names with no dot or a trailing dot.
pub fn extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(pos) => &name[pos + 1..],
        None => "",
    }
}
