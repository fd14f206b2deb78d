use std::path::Path;

/// Writes an uploaded file under `dir`, which must already exist.
///
/// # Errors
/// Returns an error when the file cannot be created or written.
pub fn save_file(dir: &Path, filename: &str, bytes: &[u8]) -> Result<(), std::io::Error> {
    std::fs::write(dir.join(filename), bytes)
}
