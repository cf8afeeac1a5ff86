//! Lexical checks for repository-relative paths supplied by agents or config.

use std::fmt;

/// Why a path was rejected before touching the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRejection {
    Empty,
    NullByte,
    Absolute,
    Traversal,
}

impl fmt::Display for PathRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PathRejection::Empty => "empty path",
            PathRejection::NullByte => "path contains a null byte",
            PathRejection::Absolute => "absolute path",
            PathRejection::Traversal => "path contains a `..` segment",
        };
        f.write_str(text)
    }
}

/// Accept only non-empty relative paths without `..` segments or null bytes.
///
/// Symlinks and root escapes need the filesystem and are checked by callers.
pub fn validate_relative_path(path: &str) -> Result<(), PathRejection> {
    if path.contains('\0') {
        return Err(PathRejection::NullByte);
    }
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(PathRejection::Empty);
    }
    if trimmed.starts_with('/') || trimmed.starts_with('\\') || has_drive_prefix(trimmed) {
        return Err(PathRejection::Absolute);
    }
    if trimmed.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(PathRejection::Traversal);
    }
    Ok(())
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Normalise `./a//b/` style spellings to `a/b`.
pub fn normalize_relative(path: &str) -> String {
    path.trim()
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}
