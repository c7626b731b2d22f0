//! Page data model.
//!
//! A page moves through `Raw → Decoded → Transformed → Encoded → Written`.
//! Only the two ends are values that cross stage boundaries: a [`RawPage`]
//! leaves the archive source, an [`EncodedPage`] enters the sink. The
//! decoded and transformed pixel buffers live inside one worker's
//! `spawn_blocking` closure and are dropped before the page is handed to
//! the reorder buffer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 0-based position of a page in the source archive.
pub type PageIndex = usize;

/// Sortable position of an output page.
///
/// Splitting a double-page spread yields two pages with the same `index`
/// and `part` 0 and 1, which sort before `index + 1` without renumbering
/// any later page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageKey {
    pub index: PageIndex,
    pub part: u8,
    /// Number of parts the source page was split into.
    pub parts: u8,
}

impl PageKey {
    pub fn whole(index: PageIndex) -> Self {
        Self {
            index,
            part: 0,
            parts: 1,
        }
    }

    pub fn split(index: PageIndex, part: u8, parts: u8) -> Self {
        Self { index, part, parts }
    }

    /// Entry stem used inside output containers: `00005` or `00005a`.
    pub fn file_stem(&self) -> String {
        if self.parts <= 1 {
            format!("{:05}", self.index)
        } else {
            let suffix = (b'a' + self.part) as char;
            format!("{:05}{}", self.index, suffix)
        }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parts <= 1 {
            write!(f, "{}", self.index)
        } else {
            write!(f, "{}{}", self.index, (b'a' + self.part) as char)
        }
    }
}

/// A page as it comes out of the container: opaque bytes plus the entry
/// name used as a format hint.
#[derive(Clone)]
pub struct RawPage {
    pub index: PageIndex,
    pub name: String,
    pub data: Vec<u8>,
}

impl RawPage {
    pub fn new(index: PageIndex, name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            index,
            name: name.into(),
            data,
        }
    }

    /// Lower-cased extension of the entry name, if any.
    pub fn extension(&self) -> Option<String> {
        let file = self.name.rsplit('/').next().unwrap_or(&self.name);
        file.rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
    }
}

impl fmt::Debug for RawPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawPage")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("len", &self.data.len())
            .finish()
    }
}

/// A finished page ready for the archive sink.
#[derive(Clone, PartialEq, Eq)]
pub struct EncodedPage {
    pub key: PageKey,
    /// Extension of the encoded payload, without the dot.
    pub extension: &'static str,
    pub data: Vec<u8>,
}

impl EncodedPage {
    pub fn entry_name(&self) -> String {
        format!("{}.{}", self.key.file_stem(), self.extension)
    }
}

impl fmt::Debug for EncodedPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedPage")
            .field("key", &self.key)
            .field("extension", &self.extension)
            .field("len", &self.data.len())
            .finish()
    }
}
