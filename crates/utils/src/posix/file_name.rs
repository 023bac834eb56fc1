//! Predicates for names that end up in the file system namespace.

/// Longest name accepted for OS objects. Linux stores named semaphores as
/// `sem.<name>` in a directory limited to 255-byte names.
pub const MAX_FILE_NAME_LENGTH: usize = 251;

/// A single path component: `[A-Za-z0-9._-]+`, not `.` or `..`, and at most
/// [`MAX_FILE_NAME_LENGTH`] bytes.
pub fn is_valid_file_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_FILE_NAME_LENGTH {
        return false;
    }
    if name == "." || name == ".." {
        return false;
    }
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Relative or absolute path of valid file names separated by single `/`,
/// without a trailing separator.
pub fn is_valid_file_path(path: &str) -> bool {
    let relative = path.strip_prefix('/').unwrap_or(path);
    !relative.is_empty() && relative.split('/').all(is_valid_file_name)
}
