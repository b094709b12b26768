//! Mirror reference naming
//!
//! A source reference `name[:tag|@digest]` maps to
//! `<prefix>/<escaped name>[:tag|@digest]`. The name escape is prefix-free:
//!
//! | source | mirror |
//! |--------|--------|
//! | `/`    | `_`    |
//! | `_`    | `-u-`  |
//! | `-`    | `--`   |
//! | `:`    | `-p-`  |
//!
//! so two different source references never share a mirror reference, and
//! the escaped name contains neither `:` nor `@`, which keeps the tag or
//! digest boundary unambiguous. Every code is a legal separator between
//! alphanumerics (`_` or a run of `-`), so a well-formed source repository
//! escapes to a single well-formed path component.

/// Derives mirror references under a fixed repository prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorNaming {
    prefix: String,
}

impl MirrorNaming {
    /// Create naming rules for `prefix` (e.g. `imageclone` or `registry.local/mirror`)
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The configured prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether `image` already lives under the mirror prefix
    pub fn is_mirrored(&self, image: &str) -> bool {
        image
            .strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Mirror reference for `image`; already-mirrored references are returned unchanged
    pub fn mirror(&self, image: &str) -> String {
        if self.is_mirrored(image) {
            return image.to_string();
        }

        let (name, suffix) = split_suffix(image);
        format!("{}/{}{}", self.prefix, escape_name(name), suffix)
    }
}

/// Split a reference into its name and its `:tag` / `@digest` suffix
fn split_suffix(image: &str) -> (&str, &str) {
    if let Some(at) = image.find('@') {
        return image.split_at(at);
    }

    match image.rfind(':') {
        Some(colon) if image.rfind('/').map_or(true, |slash| colon > slash) => {
            image.split_at(colon)
        }
        _ => (image, ""),
    }
}

fn escape_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len() + 8);
    for c in name.chars() {
        match c {
            '/' => escaped.push('_'),
            '_' => escaped.push_str("-u-"),
            '-' => escaped.push_str("--"),
            ':' => escaped.push_str("-p-"),
            other => escaped.push(other),
        }
    }
    escaped
}
