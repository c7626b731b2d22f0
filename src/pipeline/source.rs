//! Archive sources: present a container as a lazy, ordered page sequence.
//!
//! ## Why pull-based?
//!
//! A 600-page omnibus can be several gigabytes. The scheduler asks for one
//! page at a time through [`ArchiveSource::next_page`] and only after it
//! holds budget for it, so at most one raw payload per worker is ever in
//! memory. Only the table of contents (entry names) is read up front.
//!
//! ## Format detection
//!
//! The container kind is chosen from the first bytes of the file, never
//! from its extension: plenty of `.cbr` files in the wild are really zips.
//! RAR, 7z and PDF are recognised so the error can name them.

use crate::error::{ConvertError, PageError};
use crate::page::{PageIndex, RawPage};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zip::ZipArchive;

/// Extensions treated as page images. Everything else (ComicInfo.xml,
/// thumbnails databases, text files) is ignored.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];

/// Upper bound on the buffer preallocated from an entry's declared size.
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

/// Kind of input container, identified by content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerKind {
    /// Zip archive (`.cbz`, `.zip`, mislabelled `.cbr`).
    Zip,
    /// Directory of image files.
    Directory,
}

/// An opened input container.
///
/// Enumeration is restartable only by opening the container again; there
/// is no rewind.
pub trait ArchiveSource: Send {
    fn kind(&self) -> ContainerKind;

    /// Total page count when the container knows it up front.
    fn len(&self) -> Option<usize>;

    /// Entry names of all pages, in the order they will be emitted.
    fn entry_names(&self) -> Vec<String>;

    /// Read the next page.
    ///
    /// Returns `Some(Err(PageError::EntryRead))` for an unreadable entry;
    /// enumeration continues with the next entry on the following call.
    fn next_page(&mut self) -> Option<Result<RawPage, PageError>>;
}

/// Identify the container at `path` by its content.
pub fn sniff(path: &Path) -> Result<ContainerKind, ConvertError> {
    let meta = std::fs::metadata(path).map_err(|e| open_error(path, e))?;
    if meta.is_dir() {
        return Ok(ContainerKind::Directory);
    }

    let mut magic = [0u8; 8];
    let mut file = File::open(path).map_err(|e| open_error(path, e))?;
    let n = read_prefix(&mut file, &mut magic).map_err(|e| open_error(path, e))?;
    let magic = &magic[..n];

    if magic.starts_with(b"PK\x03\x04")
        || magic.starts_with(b"PK\x05\x06")
        || magic.starts_with(b"PK\x07\x08")
    {
        return Ok(ContainerKind::Zip);
    }

    let format = if magic.starts_with(b"Rar!\x1a\x07") {
        "RAR archives are not supported; repack as CBZ".to_string()
    } else if magic.starts_with(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C]) {
        "7z archives are not supported; repack as CBZ".to_string()
    } else if magic.starts_with(b"%PDF") {
        "PDF is not a page-image container".to_string()
    } else {
        format!("unrecognised magic bytes {magic:02x?}")
    };
    Err(ConvertError::UnsupportedContainer {
        path: path.to_path_buf(),
        format,
    })
}

/// Open `path` with the source matching its content.
pub fn open_source(path: &Path) -> Result<Box<dyn ArchiveSource>, ConvertError> {
    match sniff(path)? {
        ContainerKind::Zip => Ok(Box::new(ZipSource::open(path)?)),
        ContainerKind::Directory => Ok(Box::new(DirSource::open(path)?)),
    }
}

// ── Zip ──────────────────────────────────────────────────────────────────

/// Zip-based comic archive.
pub struct ZipSource {
    archive: ZipArchive<BufReader<File>>,
    /// `(zip entry index, entry name)` of every page, in reading order.
    entries: Vec<(usize, String)>,
    cursor: PageIndex,
}

impl ZipSource {
    pub fn open(path: &Path) -> Result<Self, ConvertError> {
        let file = File::open(path).map_err(|e| open_error(path, e))?;
        let mut archive =
            ZipArchive::new(BufReader::new(file)).map_err(|e| ConvertError::CorruptContainer {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;

        let mut entries = Vec::new();
        for i in 0..archive.len() {
            let entry = archive
                .by_index_raw(i)
                .map_err(|e| ConvertError::CorruptContainer {
                    path: path.to_path_buf(),
                    detail: format!("entry {i}: {e}"),
                })?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            if is_page_entry(&name) {
                entries.push((i, name));
            } else {
                debug!(entry = %name, "ignoring non-page entry");
            }
        }
        entries.sort_by(|a, b| natural_cmp(&a.1, &b.1));

        debug!(
            "Opened zip '{}' with {} pages",
            path.display(),
            entries.len()
        );
        Ok(Self {
            archive,
            entries,
            cursor: 0,
        })
    }
}

impl ArchiveSource for ZipSource {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Zip
    }

    fn len(&self) -> Option<usize> {
        Some(self.entries.len())
    }

    fn entry_names(&self) -> Vec<String> {
        self.entries.iter().map(|(_, n)| n.clone()).collect()
    }

    fn next_page(&mut self) -> Option<Result<RawPage, PageError>> {
        let (zip_index, name) = self.entries.get(self.cursor)?.clone();
        let index = self.cursor;
        self.cursor += 1;

        let entry_error = |detail: String| PageError::EntryRead {
            index,
            name: name.clone(),
            detail,
        };

        let mut entry = match self.archive.by_index(zip_index) {
            Ok(entry) => entry,
            Err(e) => return Some(Err(entry_error(e.to_string()))),
        };
        let mut data = Vec::with_capacity(entry.size().min(MAX_PREALLOC) as usize);
        if let Err(e) = entry.read_to_end(&mut data) {
            warn!(page = index, entry = %name, "unreadable entry: {e}");
            return Some(Err(entry_error(e.to_string())));
        }
        drop(entry);

        Some(Ok(RawPage::new(index, name, data)))
    }
}

// ── Directory ────────────────────────────────────────────────────────────

/// Unpacked comic: a directory tree of image files.
pub struct DirSource {
    root: PathBuf,
    /// Paths relative to `root`, `/`-separated, in reading order.
    entries: Vec<String>,
    cursor: PageIndex,
}

impl DirSource {
    pub fn open(root: &Path) -> Result<Self, ConvertError> {
        let mut entries = Vec::new();
        collect_images(root, root, &mut entries)?;
        entries.sort_by(|a, b| natural_cmp(a, b));
        debug!(
            "Opened directory '{}' with {} pages",
            root.display(),
            entries.len()
        );
        Ok(Self {
            root: root.to_path_buf(),
            entries,
            cursor: 0,
        })
    }
}

fn collect_images(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), ConvertError> {
    let read_dir = std::fs::read_dir(dir).map_err(|e| ConvertError::CorruptContainer {
        path: dir.to_path_buf(),
        detail: e.to_string(),
    })?;
    for entry in read_dir {
        let entry = entry.map_err(|e| ConvertError::CorruptContainer {
            path: dir.to_path_buf(),
            detail: e.to_string(),
        })?;
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if path.is_dir() {
            if !is_hidden(&rel) {
                collect_images(root, &path, out)?;
            }
        } else if is_page_entry(&rel) {
            out.push(rel);
        }
    }
    Ok(())
}

impl ArchiveSource for DirSource {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Directory
    }

    fn len(&self) -> Option<usize> {
        Some(self.entries.len())
    }

    fn entry_names(&self) -> Vec<String> {
        self.entries.clone()
    }

    fn next_page(&mut self) -> Option<Result<RawPage, PageError>> {
        let name = self.entries.get(self.cursor)?.clone();
        let index = self.cursor;
        self.cursor += 1;

        match std::fs::read(self.root.join(&name)) {
            Ok(data) => Some(Ok(RawPage::new(index, name, data))),
            Err(e) => Some(Err(PageError::EntryRead {
                index,
                name,
                detail: e.to_string(),
            })),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn open_error(path: &Path, e: std::io::Error) -> ConvertError {
    match e.kind() {
        std::io::ErrorKind::NotFound => ConvertError::InputNotFound {
            path: path.to_path_buf(),
        },
        std::io::ErrorKind::PermissionDenied => ConvertError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => ConvertError::CorruptContainer {
            path: path.to_path_buf(),
            detail: e.to_string(),
        },
    }
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn is_hidden(path: &str) -> bool {
    path.split('/')
        .any(|part| part.starts_with('.') || part == "__MACOSX")
}

/// True for image entries that are part of the reading order.
pub fn is_page_entry(name: &str) -> bool {
    if is_hidden(name) {
        return false;
    }
    let file = name.rsplit('/').next().unwrap_or(name);
    match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        }
        _ => false,
    }
}

static RE_CHUNKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+|\D+").unwrap());

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum Chunk {
    /// Digits with leading zeros stripped, ordered by length then value.
    Num(usize, String),
    Text(String),
}

fn chunks(s: &str) -> Vec<Chunk> {
    RE_CHUNKS
        .find_iter(s)
        .map(|m| {
            let part = m.as_str();
            if part.as_bytes()[0].is_ascii_digit() {
                let trimmed = part.trim_start_matches('0').to_string();
                Chunk::Num(trimmed.len(), trimmed)
            } else {
                Chunk::Text(part.to_lowercase())
            }
        })
        .collect()
}

/// Natural ordering: `page2` < `page10`, case-insensitive, ties broken by
/// the raw bytes so the order is total.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    chunks(a).cmp(&chunks(b)).then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, data) in entries {
            if name.ends_with('/') {
                zip.add_directory(*name, SimpleFileOptions::default()).unwrap();
            } else {
                zip.start_file(*name, SimpleFileOptions::default()).unwrap();
                zip.write_all(data).unwrap();
            }
        }
        zip.finish().unwrap();
    }

    #[test]
    fn natural_order_sorts_numbers_by_value() {
        let mut names = vec!["p10.png", "p2.png", "P1.png", "p02b.png", "cover.jpg"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["cover.jpg", "P1.png", "p2.png", "p02b.png", "p10.png"]);
    }

    #[test]
    fn page_entries_skip_metadata_and_resource_forks() {
        assert!(is_page_entry("ch1/001.JPG"));
        assert!(is_page_entry("002.webp"));
        assert!(!is_page_entry("ComicInfo.xml"));
        assert!(!is_page_entry("__MACOSX/ch1/._001.jpg"));
        assert!(!is_page_entry(".thumb.png"));
        assert!(!is_page_entry("ch1/.png"));
    }

    #[test]
    fn sniff_rejects_rar_by_magic_even_with_cbz_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.cbz");
        std::fs::write(&path, b"Rar!\x1a\x07\x00rest").unwrap();
        let err = sniff(&path).unwrap_err();
        match err {
            ConvertError::UnsupportedContainer { format, .. } => assert!(format.contains("RAR")),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn sniff_accepts_zip_with_cbr_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mislabelled.cbr");
        write_zip(&path, &[("001.png", b"x")]);
        assert_eq!(sniff(&path).unwrap(), ContainerKind::Zip);
    }

    #[test]
    fn sniff_missing_file_is_input_not_found() {
        let err = sniff(Path::new("/definitely/not/here.cbz")).unwrap_err();
        assert!(matches!(err, ConvertError::InputNotFound { .. }));
    }

    #[test]
    fn truncated_zip_is_corrupt_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.cbz");
        std::fs::write(&path, b"PK\x03\x04 this is not really a zip").unwrap();
        let err = ZipSource::open(&path).err().unwrap();
        assert!(matches!(err, ConvertError::CorruptContainer { .. }));
    }

    #[test]
    fn zip_source_emits_pages_in_natural_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.cbz");
        write_zip(
            &path,
            &[
                ("vol/", b""),
                ("vol/page10.png", b"ten"),
                ("vol/page2.png", b"two"),
                ("ComicInfo.xml", b"<xml/>"),
                ("vol/page1.png", b"one"),
            ],
        );

        let mut source = open_source(&path).unwrap();
        assert_eq!(source.kind(), ContainerKind::Zip);
        assert_eq!(source.len(), Some(3));

        let mut seen = Vec::new();
        while let Some(page) = source.next_page() {
            let page = page.unwrap();
            seen.push((page.index, page.data));
        }
        assert_eq!(
            seen,
            vec![
                (0, b"one".to_vec()),
                (1, b"two".to_vec()),
                (2, b"ten".to_vec())
            ]
        );
        assert!(source.next_page().is_none());
    }

    #[test]
    fn dir_source_reads_nested_pages() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("ch2")).unwrap();
        std::fs::create_dir_all(dir.path().join("ch10")).unwrap();
        std::fs::write(dir.path().join("ch10/01.png"), b"c").unwrap();
        std::fs::write(dir.path().join("ch2/01.png"), b"b").unwrap();
        std::fs::write(dir.path().join("00.png"), b"a").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"skip").unwrap();

        let mut source = open_source(dir.path()).unwrap();
        assert_eq!(source.kind(), ContainerKind::Directory);
        assert_eq!(
            source.entry_names(),
            vec!["00.png", "ch2/01.png", "ch10/01.png"]
        );
        let first = source.next_page().unwrap().unwrap();
        assert_eq!(first.data, b"a");
    }
}
