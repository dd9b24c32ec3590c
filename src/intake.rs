//! Batch intake: turns uploads, manifests and directories into [`FileRef`]s.
//!
//! Any failure here is batch-level; the batch never starts.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use ignore::WalkBuilder;
use ignore::overrides::OverrideBuilder;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::IntakeError;
use crate::validator::FileRef;

/// A named byte blob received from a client
#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub data: Vec<u8>,
}

impl Upload {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_.\-]").expect("Invalid regex"))
}

/// Reduce a client-supplied name to a safe basename.
///
/// Path separators and whitespace become `_`, anything outside
/// `[A-Za-z0-9_.-]` is dropped, and leading/trailing `.`/`_` are stripped.
pub fn secure_filename(name: &str) -> String {
    let spaced = name.replace(['/', '\\'], " ");
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned = unsafe_chars().replace_all(&joined, "");
    cleaned.trim_matches(|c| c == '.' || c == '_').to_string()
}

/// Accepts files into a batch
#[derive(Debug, Clone)]
pub struct UploadIntake {
    upload_dir: PathBuf,
    /// Allowed extensions, lower-cased, without the dot
    extensions: Vec<String>,
    include_patterns: Vec<String>,
    exclude_patterns: Vec<String>,
    max_depth: Option<usize>,
    follow_symlinks: bool,
}

impl UploadIntake {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            extensions: vec!["xml".to_string()],
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            max_depth: None,
            follow_symlinks: false,
        }
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();
        self
    }

    pub fn with_include_patterns(mut self, patterns: Vec<String>) -> Self {
        self.include_patterns = patterns;
        self
    }

    pub fn with_exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }

    pub fn with_max_depth(mut self, depth: Option<usize>) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Whether `name` carries one of the allowed extensions
    pub fn is_allowed(&self, name: &str) -> bool {
        name.rsplit_once('.')
            .is_some_and(|(_, ext)| self.extensions.contains(&ext.to_lowercase()))
    }

    /// Store uploaded blobs in the upload directory.
    ///
    /// One disallowed file rejects the whole batch.
    pub async fn accept_uploads(&self, uploads: Vec<Upload>) -> Result<Vec<FileRef>, IntakeError> {
        let Some(first) = uploads.first() else {
            return Err(IntakeError::NoFiles);
        };
        if first.name.is_empty() {
            return Err(IntakeError::NoFilesSelected);
        }

        let mut names = Vec::with_capacity(uploads.len());
        let mut taken = HashSet::new();
        for upload in &uploads {
            let safe = secure_filename(&upload.name);
            if !self.is_allowed(&upload.name) || !self.is_allowed(&safe) {
                return Err(IntakeError::DisallowedFileType {
                    name: upload.name.clone(),
                });
            }
            names.push(unique_name(safe, &mut taken));
        }

        tokio::fs::create_dir_all(&self.upload_dir)
            .await
            .map_err(|e| IntakeError::Storage {
                path: self.upload_dir.clone(),
                details: e.to_string(),
            })?;

        let mut written: Vec<PathBuf> = Vec::with_capacity(uploads.len());
        for (upload, name) in uploads.into_iter().zip(names) {
            let path = self.upload_dir.join(&name);
            if let Err(e) = tokio::fs::write(&path, &upload.data).await {
                // A rejected batch leaves nothing behind
                for stored in &written {
                    if let Err(remove) = tokio::fs::remove_file(stored).await {
                        warn!(
                            path = %stored.display(),
                            error = %remove,
                            "could not remove upload"
                        );
                    }
                }
                return Err(IntakeError::Storage {
                    path,
                    details: e.to_string(),
                });
            }
            debug!(file = %name, bytes = upload.data.len(), "upload stored");
            written.push(path);
        }
        let files: Vec<FileRef> = written.into_iter().map(FileRef::Path).collect();

        info!(count = files.len(), dir = %self.upload_dir.display(), "uploads accepted");
        Ok(files)
    }

    /// Resolve file paths listed in a CSV manifest.
    ///
    /// The first column whose header contains `path` or `file` is used.
    /// Relative paths are resolved against the manifest's directory; paths
    /// that do not exist are skipped with a warning.
    pub async fn from_manifest(&self, manifest: &Path) -> Result<Vec<FileRef>, IntakeError> {
        let manifest_error = |details: String| IntakeError::Manifest {
            manifest: manifest.to_path_buf(),
            details,
        };

        let bytes = tokio::fs::read(manifest)
            .await
            .map_err(|e| manifest_error(e.to_string()))?;

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(bytes.as_slice());
        let headers = reader
            .headers()
            .map_err(|e| manifest_error(e.to_string()))?
            .clone();

        let column = headers
            .iter()
            .position(|h| {
                let h = h.to_lowercase();
                h.contains("path") || h.contains("file")
            })
            .ok_or_else(|| IntakeError::NoPathColumn {
                manifest: manifest.to_path_buf(),
            })?;
        debug!(column = &headers[column], "manifest path column");

        let base = manifest.parent().unwrap_or_else(|| Path::new("."));
        let mut files = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| manifest_error(e.to_string()))?;
            let Some(cell) = record.get(column).map(str::trim).filter(|c| !c.is_empty()) else {
                continue;
            };

            let listed = PathBuf::from(cell);
            let path = if listed.is_absolute() {
                listed
            } else {
                base.join(listed)
            };

            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => files.push(FileRef::Path(path)),
                _ => warn!(path = %path.display(), "manifest entry does not exist; skipping"),
            }
        }

        if files.is_empty() {
            return Err(IntakeError::NoFiles);
        }
        info!(count = files.len(), manifest = %manifest.display(), "manifest resolved");
        Ok(files)
    }

    /// Collect matching files under `path`, sorted by path.
    ///
    /// A single file is accepted as-is if its extension is allowed.
    pub async fn discover(&self, path: &Path) -> Result<Vec<FileRef>, IntakeError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| IntakeError::MissingPath {
                path: path.to_path_buf(),
            })?;

        if metadata.is_file() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !self.is_allowed(&name) {
                return Err(IntakeError::DisallowedFileType { name });
            }
            return Ok(vec![FileRef::Path(path.to_path_buf())]);
        }

        let intake = self.clone();
        let root = path.to_path_buf();
        let mut paths = tokio::task::spawn_blocking(move || intake.walk(&root))
            .await
            .map_err(|e| IntakeError::Storage {
                path: path.to_path_buf(),
                details: e.to_string(),
            })??;
        paths.sort();

        info!(count = paths.len(), root = %path.display(), "files discovered");
        Ok(paths.into_iter().map(FileRef::Path).collect())
    }

    fn walk(&self, root: &Path) -> Result<Vec<PathBuf>, IntakeError> {
        let builder = self.walker(root)?;
        Ok(walk_files(builder, &self.extensions))
    }

    fn walker(&self, root: &Path) -> Result<WalkBuilder, IntakeError> {
        let mut overrides = OverrideBuilder::new(root);
        for pattern in &self.include_patterns {
            add_pattern(&mut overrides, pattern, pattern)?;
        }
        for pattern in &self.exclude_patterns {
            add_pattern(&mut overrides, &format!("!{pattern}"), pattern)?;
        }
        let overrides = overrides.build().map_err(|e| IntakeError::Pattern {
            pattern: self.include_patterns.join(","),
            details: e.to_string(),
        })?;

        let mut builder = WalkBuilder::new(root);
        builder
            .standard_filters(false)
            .follow_links(self.follow_symlinks)
            .max_depth(self.max_depth)
            .overrides(overrides);
        Ok(builder)
    }
}

fn add_pattern(
    overrides: &mut OverrideBuilder,
    glob: &str,
    pattern: &str,
) -> Result<(), IntakeError> {
    overrides.add(glob).map_err(|e| IntakeError::Pattern {
        pattern: pattern.to_string(),
        details: e.to_string(),
    })?;
    Ok(())
}

fn walk_files(builder: WalkBuilder, extensions: &[String]) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for entry in builder.build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let matches = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| extensions.contains(&ext.to_lowercase()));
        if matches {
            paths.push(entry.into_path());
        }
    }
    paths
}

fn unique_name(name: String, taken: &mut HashSet<String>) -> String {
    if taken.insert(name.clone()) {
        return name;
    }
    let (stem, ext) = name.rsplit_once('.').unwrap_or((name.as_str(), ""));
    let mut n = 1;
    loop {
        let candidate = format!("{stem}-{n}.{ext}");
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::fs;

    #[test]
    fn test_secure_filename() {
        assert_eq!(secure_filename("My cool meter.xml"), "My_cool_meter.xml");
        assert_eq!(secure_filename("../../etc/passwd"), "etc_passwd");
        assert_eq!(secure_filename("  _hidden.xml"), "hidden.xml");
        assert_eq!(secure_filename("mète®.xml"), "mte.xml");
        assert_eq!(secure_filename("..."), "");
    }

    #[test]
    fn test_is_allowed() {
        let intake = UploadIntake::new("/tmp/unused");
        assert!(intake.is_allowed("meter.xml"));
        assert!(intake.is_allowed("METER.XML"));
        assert!(!intake.is_allowed("meter.csv"));
        assert!(!intake.is_allowed("xml"));

        let custom = intake.with_extensions(vec![".XSD".to_string()]);
        assert!(custom.is_allowed("schema.xsd"));
    }

    #[tokio::test]
    async fn test_accept_uploads_rejects_empty_batches() {
        let dir = TempDir::new().unwrap();
        let intake = UploadIntake::new(dir.path());

        assert!(matches!(
            intake.accept_uploads(Vec::new()).await,
            Err(IntakeError::NoFiles)
        ));
        assert!(matches!(
            intake.accept_uploads(vec![Upload::new("", "x")]).await,
            Err(IntakeError::NoFilesSelected)
        ));
    }

    #[tokio::test]
    async fn test_accept_uploads_rejects_whole_batch_on_bad_type() {
        let dir = TempDir::new().unwrap();
        let uploads_dir = dir.path().join("uploads");
        let intake = UploadIntake::new(&uploads_dir);

        let err = intake
            .accept_uploads(vec![
                Upload::new("a.xml", "<a/>"),
                Upload::new("notes.txt", "hi"),
            ])
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Invalid file type: notes.txt");
        assert!(!uploads_dir.exists());
    }

    #[tokio::test]
    async fn test_accept_uploads_removes_stored_files_on_write_failure() {
        let dir = TempDir::new().unwrap();
        let uploads_dir = dir.path().join("uploads");
        fs::create_dir_all(uploads_dir.join("b.xml")).await.unwrap();
        let intake = UploadIntake::new(&uploads_dir);

        let err = intake
            .accept_uploads(vec![
                Upload::new("a.xml", "<a/>"),
                Upload::new("b.xml", "<b/>"),
                Upload::new("c.xml", "<c/>"),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, IntakeError::Storage { ref path, .. } if path.ends_with("b.xml")));
        assert!(!uploads_dir.join("a.xml").exists());
        assert!(!uploads_dir.join("c.xml").exists());
        assert!(uploads_dir.join("b.xml").is_dir());
    }

    #[tokio::test]
    async fn test_accept_uploads_stores_files() {
        let dir = TempDir::new().unwrap();
        let intake = UploadIntake::new(dir.path().join("uploads"));

        let files = intake
            .accept_uploads(vec![
                Upload::new("sub/dir/meter one.xml", "<a/>"),
                Upload::new("meter_one.xml", "<b/>"),
            ])
            .await
            .unwrap();

        let names: Vec<_> = files.iter().map(|f| f.file_name()).collect();
        assert_eq!(names, ["sub_dir_meter_one.xml", "meter_one.xml"]);
        assert_eq!(&*files[1].read().unwrap(), b"<b/>");
    }

    #[tokio::test]
    async fn test_duplicate_upload_names_are_kept_apart() {
        let dir = TempDir::new().unwrap();
        let intake = UploadIntake::new(dir.path());

        let files = intake
            .accept_uploads(vec![Upload::new("m.xml", "<a/>"), Upload::new("m.xml", "<b/>")])
            .await
            .unwrap();

        assert_eq!(files[0].file_name(), "m.xml");
        assert_eq!(files[1].file_name(), "m-1.xml");
        assert_eq!(&*files[0].read().unwrap(), b"<a/>");
    }

    #[tokio::test]
    async fn test_manifest_resolves_path_column() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("one.xml"), "<a/>").await.unwrap();
        fs::write(dir.path().join("two.xml"), "<a/>").await.unwrap();
        let manifest = dir.path().join("manifest.csv");
        fs::write(
            &manifest,
            "id,File Path,notes\n1,one.xml,x\n2,missing.xml,y\n3,,z\n4,two.xml,w\n",
        )
        .await
        .unwrap();

        let intake = UploadIntake::new(dir.path());
        let files = intake.from_manifest(&manifest).await.unwrap();

        let names: Vec<_> = files.iter().map(|f| f.file_name()).collect();
        assert_eq!(names, ["one.xml", "two.xml"]);
    }

    #[tokio::test]
    async fn test_manifest_without_path_column() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("manifest.csv");
        fs::write(&manifest, "id,meter\n1,M1\n").await.unwrap();

        let err = UploadIntake::new(dir.path())
            .from_manifest(&manifest)
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::NoPathColumn { .. }));
    }

    #[tokio::test]
    async fn test_manifest_with_nothing_resolvable() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("manifest.csv");
        fs::write(&manifest, "filename\nghost.xml\n").await.unwrap();

        let err = UploadIntake::new(dir.path())
            .from_manifest(&manifest)
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::NoFiles));
    }

    #[tokio::test]
    async fn test_discover_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("b").join("archive");
        fs::create_dir_all(&nested).await.unwrap();
        fs::write(dir.path().join("c.xml"), "<a/>").await.unwrap();
        fs::write(dir.path().join("a.XML"), "<a/>").await.unwrap();
        fs::write(dir.path().join("readme.txt"), "x").await.unwrap();
        fs::write(dir.path().join("b").join("d.xml"), "<a/>").await.unwrap();
        fs::write(nested.join("old.xml"), "<a/>").await.unwrap();

        let intake = UploadIntake::new(dir.path());
        let all = intake.discover(dir.path()).await.unwrap();
        let names: Vec<_> = all.iter().map(|f| f.file_name()).collect();
        assert_eq!(names, ["a.XML", "old.xml", "d.xml", "c.xml"]);

        let filtered = intake
            .clone()
            .with_exclude_patterns(vec!["**/archive/**".to_string()])
            .discover(dir.path())
            .await
            .unwrap();
        assert_eq!(filtered.len(), 3);

        let shallow = intake.with_max_depth(Some(1)).discover(dir.path()).await.unwrap();
        assert_eq!(shallow.len(), 2);
    }

    #[tokio::test]
    async fn test_discover_single_file_and_missing_path() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("meter.xml");
        fs::write(&file, "<a/>").await.unwrap();

        let intake = UploadIntake::new(dir.path());
        assert_eq!(intake.discover(&file).await.unwrap().len(), 1);

        let err = intake
            .discover(&dir.path().join("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::MissingPath { .. }));
    }

    #[tokio::test]
    async fn test_invalid_pattern() {
        let dir = TempDir::new().unwrap();
        let intake = UploadIntake::new(dir.path()).with_include_patterns(vec!["a[".to_string()]);

        let err = intake.discover(dir.path()).await.unwrap_err();
        assert!(matches!(err, IntakeError::Pattern { .. }));
    }
}
