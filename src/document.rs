use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::LoadError;

/// One source file exactly as read. Never modified after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDocument {
    source_path: String,
    raw_text: String,
}

impl RawDocument {
    pub fn new(source_path: impl Into<String>, raw_text: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            raw_text: raw_text.into(),
        }
    }

    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }
}

/// Documents read from disk plus the files that could not be read.
#[derive(Debug, Default)]
pub struct LoadedBatch {
    pub documents: Vec<RawDocument>,
    pub failures: Vec<(String, LoadError)>,
}

impl LoadedBatch {
    pub fn len(&self) -> usize {
        self.documents.len() + self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct DocumentLoader;

impl DocumentLoader {
    /// Reads one file. Invalid UTF-8 is replaced rather than rejected since
    /// OCR exports routinely contain stray bytes.
    pub fn load_file(path: &Path, source_path: &str) -> Result<RawDocument, LoadError> {
        let metadata = fs::metadata(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if !metadata.is_file() {
            return Err(LoadError::NotAFile(path.to_path_buf()));
        }

        let bytes = fs::read(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes);
        let text = String::from_utf8_lossy(bytes).into_owned();

        Ok(RawDocument::new(source_path, text))
    }

    /// Loads every `.txt` file directly inside each folder. Ids are
    /// `<folder name>/<file name>` so the two archive folders never collide.
    pub fn load_dirs<P: AsRef<Path>>(dirs: &[P]) -> LoadedBatch {
        let mut batch = LoadedBatch::default();

        for dir in dirs {
            let dir = dir.as_ref();
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Skipping folder {}: {}", dir.display(), e);
                    continue;
                }
            };

            let mut paths: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| {
                    path.extension()
                        .and_then(|ext| ext.to_str())
                        .map_or(false, |ext| ext.eq_ignore_ascii_case("txt"))
                })
                .collect();
            paths.sort();

            let prefix = dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            debug!("Found {} text files in {}", paths.len(), dir.display());

            for path in paths {
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let source_path = if prefix.is_empty() {
                    file_name
                } else {
                    format!("{prefix}/{file_name}")
                };

                match Self::load_file(&path, &source_path) {
                    Ok(document) => batch.documents.push(document),
                    Err(e) => {
                        warn!("Unreadable document {source_path}: {e}");
                        batch.failures.push((source_path, e));
                    }
                }
            }
        }

        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_file_strips_bom_and_replaces_bad_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"\xEF\xBB\xBFFrom: a@x.com\n\xFFok").unwrap();

        let doc = DocumentLoader::load_file(&path, "a.txt").unwrap();
        assert!(doc.raw_text().starts_with("From:"));
        assert!(doc.raw_text().contains('\u{FFFD}'));
        assert_eq!(doc.source_path(), "a.txt");
    }

    #[test]
    fn test_load_dirs_sorted_and_prefixed() {
        let root = tempfile::tempdir().unwrap();
        let folder = root.path().join("TEXT-001");
        fs::create_dir(&folder).unwrap();
        fs::write(folder.join("b.txt"), "second").unwrap();
        fs::write(folder.join("a.txt"), "first").unwrap();
        fs::write(folder.join("notes.md"), "ignored").unwrap();

        let batch = DocumentLoader::load_dirs(&[&folder]);
        let ids: Vec<&str> = batch.documents.iter().map(|d| d.source_path()).collect();
        assert_eq!(ids, vec!["TEXT-001/a.txt", "TEXT-001/b.txt"]);
        assert!(batch.failures.is_empty());
    }

    #[test]
    fn test_missing_folder_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        let batch = DocumentLoader::load_dirs(&[root.path().join("missing")]);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_directory_is_not_a_file() {
        let root = tempfile::tempdir().unwrap();
        let result = DocumentLoader::load_file(root.path(), "dir");
        assert!(matches!(result, Err(LoadError::NotAFile(_))));
    }
}
