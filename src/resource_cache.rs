use log::debug;
use std::path::PathBuf;
use std::sync::Arc;

pub const RESOURCE_CACHE_CAPACITY: usize = 100;
pub const MAX_FILENAME_LEN: usize = 100;

struct Entry {
    filename: String,
    data: Arc<[u8]>,
}

/// Load-on-demand cache of small static files, keyed by path relative to
/// `root`. Entries are created on first lookup and never evicted or
/// mutated. Lookups that cannot be satisfied terminate the process: the
/// set of template and error-page files is compile-time known, so a miss
/// is a packaging error, not a runtime condition.
pub struct ResourceCache {
    root: PathBuf,
    entries: Vec<Entry>,
}
impl ResourceCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: Vec::new(),
        }
    }

    /// Returns the cached bytes of `filename`, loading the file on first
    /// use.
    ///
    /// # Panics
    /// Panics when the filename is over-long, the cache is full, or the
    /// file cannot be read.
    pub fn get(&mut self, filename: &str) -> Arc<[u8]> {
        if let Some(entry) = self.entries.iter().find(|e| e.filename == filename) {
            return Arc::clone(&entry.data);
        }
        assert!(
            filename.len() < MAX_FILENAME_LEN,
            "resource filename too long: {filename:?}"
        );
        assert!(
            self.entries.len() < RESOURCE_CACHE_CAPACITY,
            "ran out of resource cache space"
        );
        let path = self.root.join(filename);
        let bytes = std::fs::read(&path)
            .unwrap_or_else(|e| panic!("failed to load resource {}: {e}", path.display()));
        debug!("cached resource {filename} ({} bytes)", bytes.len());
        let data: Arc<[u8]> = bytes.into();
        self.entries.push(Entry {
            filename: filename.to_string(),
            data: Arc::clone(&data),
        });
        data
    }
}
