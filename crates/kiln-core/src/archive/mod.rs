//! Gzip-compressed tar archives.
//!
//! [`TarballCodec`] packs directory trees in sorted order, lists and checks
//! archives without extracting, and unpacks them while refusing links and
//! any entry that would land outside the destination directory.

pub mod packager;

use std::fs::{self, File};
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, EntryType, HeaderMode};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

pub use packager::{ArtifactPackager, ExcludeRules, PackageSummary};

/// Errors produced by archive operations.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt archive {label}: {reason}")]
    Corrupt { label: String, reason: String },

    #[error("unsafe archive entry: {0}")]
    UnsafeEntry(String),
}

pub type ArchiveResult<T> = std::result::Result<T, ArchiveError>;

fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn corrupt(label: &str) -> impl Fn(std::io::Error) -> ArchiveError + '_ {
    move |e| ArchiveError::Corrupt {
        label: label.to_string(),
        reason: e.to_string(),
    }
}

/// Gzip tar codec. All operations are blocking.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarballCodec;

impl TarballCodec {
    /// Pack every regular file under `source_dir` into `dest_path`.
    ///
    /// Returns the relative paths written, in archive order.
    pub fn create(source_dir: &Path, dest_path: &Path) -> ArchiveResult<Vec<String>> {
        let dest_abs = std::path::absolute(dest_path).map_err(io_at(dest_path))?;
        let mut entries = Vec::new();
        for entry in WalkDir::new(source_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(source_dir).to_path_buf();
                ArchiveError::Io {
                    path,
                    source: e.into(),
                }
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let abs = std::path::absolute(entry.path()).map_err(io_at(entry.path()))?;
            if abs == dest_abs {
                continue;
            }
            let rel = relative_name(source_dir, entry.path());
            entries.push((entry.into_path(), rel));
        }
        Self::create_from_entries(&entries, dest_path)?;
        Ok(entries.into_iter().map(|(_, rel)| rel).collect())
    }

    /// Pack explicit `(file on disk, name in archive)` pairs into `dest_path`.
    ///
    /// The archive is written to a temporary file beside `dest_path` and
    /// renamed into place once complete.
    pub fn create_from_entries(entries: &[(PathBuf, String)], dest_path: &Path) -> ArchiveResult<()> {
        let parent = match dest_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(io_at(&parent))?;

        let tmp = NamedTempFile::new_in(&parent).map_err(io_at(&parent))?;
        let encoder = GzEncoder::new(tmp, Compression::default());
        let mut builder = Builder::new(encoder);
        builder.mode(HeaderMode::Deterministic);

        for (path, name) in entries {
            builder
                .append_path_with_name(path, name)
                .map_err(io_at(path))?;
        }

        let encoder = builder.into_inner().map_err(io_at(dest_path))?;
        let tmp = encoder.finish().map_err(io_at(dest_path))?;
        tmp.persist(dest_path).map_err(|e| ArchiveError::Io {
            path: dest_path.to_path_buf(),
            source: e.error,
        })?;

        tracing::debug!(archive = %dest_path.display(), files = entries.len(), "archive created");
        Ok(())
    }

    /// Unpack `archive_path` into `dest_dir`, creating it if absent.
    pub fn extract(archive_path: &Path, dest_dir: &Path) -> ArchiveResult<Vec<String>> {
        let label = archive_path.display().to_string();
        let file = File::open(archive_path).map_err(corrupt(&label))?;
        extract_from(file, &label, dest_dir)
    }

    /// Unpack an in-memory archive into `dest_dir`, creating it if absent.
    pub fn extract_bytes(bytes: &[u8], dest_dir: &Path) -> ArchiveResult<Vec<String>> {
        extract_from(Cursor::new(bytes), "<memory>", dest_dir)
    }

    /// Member paths of an archive, without extracting.
    pub fn list(archive_path: &Path) -> ArchiveResult<Vec<String>> {
        let label = archive_path.display().to_string();
        let file = File::open(archive_path).map_err(corrupt(&label))?;
        list_from(file, &label)
    }

    /// Whether the file is a readable gzip tar archive.
    pub fn validate(archive_path: &Path) -> bool {
        Self::list(archive_path).is_ok()
    }

    /// Whether the bytes are a readable gzip tar archive.
    pub fn validate_bytes(bytes: &[u8]) -> bool {
        list_from(Cursor::new(bytes), "<memory>").is_ok()
    }
}

/// Archive name for `path` relative to `root`, always `/`-separated.
pub(crate) fn relative_name(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn list_from<R: Read>(reader: R, label: &str) -> ArchiveResult<Vec<String>> {
    let mut archive = Archive::new(GzDecoder::new(reader));
    let mut names = Vec::new();
    for entry in archive.entries().map_err(corrupt(label))? {
        let entry = entry.map_err(corrupt(label))?;
        let path = entry.path().map_err(corrupt(label))?;
        names.push(path.to_string_lossy().into_owned());
    }
    Ok(names)
}

fn extract_from<R: Read>(reader: R, label: &str, dest_dir: &Path) -> ArchiveResult<Vec<String>> {
    fs::create_dir_all(dest_dir).map_err(io_at(dest_dir))?;

    let mut archive = Archive::new(GzDecoder::new(reader));
    let mut names = Vec::new();
    for entry in archive.entries().map_err(corrupt(label))? {
        let mut entry = entry.map_err(corrupt(label))?;
        let path = entry.path().map_err(corrupt(label))?.into_owned();
        let name = path.to_string_lossy().into_owned();

        if !is_contained(&path) {
            return Err(ArchiveError::UnsafeEntry(name));
        }

        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Directory | EntryType::Continuous => {}
            EntryType::XGlobalHeader => continue,
            // Never written: a later entry could resolve through the link.
            EntryType::Symlink | EntryType::Link => {
                let target = entry
                    .link_name()
                    .map_err(corrupt(label))?
                    .map(|t| t.display().to_string())
                    .unwrap_or_default();
                return Err(ArchiveError::UnsafeEntry(format!("{name} (link to '{target}')")));
            }
            other => {
                return Err(ArchiveError::UnsafeEntry(format!(
                    "{name} (unsupported entry type {other:?})"
                )))
            }
        }

        let unpacked = entry.unpack_in(dest_dir).map_err(corrupt(label))?;
        if !unpacked {
            return Err(ArchiveError::UnsafeEntry(name));
        }
        names.push(name);
    }

    tracing::debug!(archive = %label, dest = %dest_dir.display(), entries = names.len(), "archive extracted");
    Ok(names)
}

/// True when `path` is relative and never climbs above its starting point.
fn is_contained(path: &Path) -> bool {
    let mut depth: usize = 0;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => return false,
            Component::ParentDir => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return false,
            },
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    /// Hand-build an archive whose entry names bypass the builder's own
    /// path checks.
    fn raw_archive(entries: &[(&str, EntryType, Option<&str>)]) -> Vec<u8> {
        let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let body = b"payload";
        for (name, entry_type, link) in entries {
            let mut header = tar::Header::new_gnu();
            {
                let raw = header.as_old_mut();
                raw.name[..name.len()].copy_from_slice(name.as_bytes());
            }
            header.set_entry_type(*entry_type);
            header.set_mode(0o644);
            if let Some(link) = link {
                header.set_link_name(link).unwrap();
            }
            let size = if *entry_type == EntryType::Regular { body.len() } else { 0 };
            header.set_size(size as u64);
            header.set_cksum();
            builder.append(&header, &body[..size]).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn archive_with_raw_entry(name: &str, entry_type: EntryType, link: Option<&str>) -> Vec<u8> {
        raw_archive(&[(name, entry_type, link)])
    }

    #[test]
    fn create_then_extract_preserves_tree() {
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "kiln.toml", "entrypoint = \"main:handler\"\n");
        write(src.path(), "lib/util.rhai", "fn helper(x) { x }\n");
        write(src.path(), "main.rhai", "fn handler(input) { 5 }\n");

        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("agent.tar.gz");
        let names = TarballCodec::create(src.path(), &archive).unwrap();
        assert_eq!(names, vec!["kiln.toml", "lib/util.rhai", "main.rhai"]);

        assert!(TarballCodec::validate(&archive));
        assert_eq!(TarballCodec::list(&archive).unwrap(), names);

        let dest = out.path().join("unpacked/nested");
        TarballCodec::extract(&archive, &dest).unwrap();
        assert_eq!(
            fs::read_to_string(dest.join("lib/util.rhai")).unwrap(),
            "fn helper(x) { x }\n"
        );
    }

    #[test]
    fn create_skips_archive_inside_source() {
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "main.rhai", "1");
        let archive = src.path().join("agent.tar.gz");
        TarballCodec::create(src.path(), &archive).unwrap();
        let names = TarballCodec::create(src.path(), &archive).unwrap();
        assert_eq!(names, vec!["main.rhai"]);
    }

    #[test]
    fn garbage_is_not_an_archive() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.tar.gz");
        let mut f = File::create(&bogus).unwrap();
        f.write_all(b"definitely not gzip").unwrap();

        assert!(!TarballCodec::validate(&bogus));
        assert!(!TarballCodec::validate_bytes(b"\x1f\x8bnope"));
        let err = TarballCodec::extract(&bogus, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, ArchiveError::Corrupt { .. }));
    }

    #[test]
    fn missing_archive_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let err = TarballCodec::extract(&dir.path().join("absent.tar.gz"), dir.path()).unwrap_err();
        assert!(matches!(err, ArchiveError::Corrupt { .. }));
    }

    #[test]
    fn parent_dir_entry_is_rejected() {
        let bytes = archive_with_raw_entry("../escape.rhai", EntryType::Regular, None);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dest");
        let err = TarballCodec::extract_bytes(&bytes, &dest).unwrap_err();
        assert!(matches!(err, ArchiveError::UnsafeEntry(_)));
        assert!(!dir.path().join("escape.rhai").exists());
    }

    #[test]
    fn escaping_symlink_is_rejected() {
        let bytes = archive_with_raw_entry("link", EntryType::Symlink, Some("../../etc/passwd"));
        let dir = tempfile::tempdir().unwrap();
        let err = TarballCodec::extract_bytes(&bytes, dir.path()).unwrap_err();
        assert!(matches!(err, ArchiveError::UnsafeEntry(_)));
    }

    #[test]
    fn chained_symlinks_cannot_escape() {
        let bytes = raw_archive(&[
            ("d", EntryType::Symlink, Some(".")),
            ("d/d/d/l", EntryType::Symlink, Some("../../..")),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("x/y/dest");
        let err = TarballCodec::extract_bytes(&bytes, &dest).unwrap_err();
        assert!(matches!(err, ArchiveError::UnsafeEntry(_)));
        assert!(fs::symlink_metadata(dest.join("d")).is_err());
        assert!(fs::symlink_metadata(dest.join("l")).is_err());
    }

    #[test]
    fn internal_links_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let symlink = archive_with_raw_entry("lib/alias.rhai", EntryType::Symlink, Some("../main.rhai"));
        let err = TarballCodec::extract_bytes(&symlink, dir.path()).unwrap_err();
        assert!(matches!(err, ArchiveError::UnsafeEntry(_)));

        let hardlink = raw_archive(&[
            ("main.rhai", EntryType::Regular, None),
            ("copy.rhai", EntryType::Link, Some("main.rhai")),
        ]);
        let err = TarballCodec::extract_bytes(&hardlink, &dir.path().join("h")).unwrap_err();
        assert!(matches!(err, ArchiveError::UnsafeEntry(_)));
    }

    #[test]
    fn containment_rules() {
        assert!(is_contained(Path::new("a/b/../c")));
        assert!(is_contained(Path::new("./a")));
        assert!(!is_contained(Path::new("a/../../b")));
        assert!(!is_contained(Path::new("/etc/passwd")));
    }
}
