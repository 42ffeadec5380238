//! Binary wire codec
//!
//! Commands travel as a WBXML-style token stream: a tree of namespaced tags
//! where each tag is one byte looked up in a [`TokenTable`]. This module
//! holds the tree type; [`encoder`] and [`decoder`] turn it into bytes and
//! back.

pub mod decoder;
pub mod encoder;
pub mod tokens;

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::sync::Arc;

use tempfile::NamedTempFile;

use crate::error::Result;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub use tokens::TokenTable;

// Global tokens
pub const SWITCH_PAGE: u8 = 0x00;
pub const END: u8 = 0x01;
pub const STR_I: u8 = 0x03;
pub const OPAQUE: u8 = 0xC3;

pub const HAS_CONTENT: u8 = 0x40;
pub const HAS_ATTRIBUTES: u8 = 0x80;

// Header
pub const VERSION: u8 = 0x03;
pub const PUBLIC_ID: u8 = 0x01;
pub const CHARSET_UTF8: u8 = 0x6A;

/// Payloads past this many bytes go to a temp file unless configured otherwise
pub const DEFAULT_SPOOL_THRESHOLD: usize = 1024 * 1024;

/// Raw bytes of an opaque payload, in memory or spooled to a temp file
#[derive(Debug, Clone)]
pub enum Blob {
    Inline(Vec<u8>),
    Spooled { file: Arc<NamedTempFile>, len: u64 },
}

impl Blob {
    /// Copy `len` bytes from `reader` into a temporary file
    pub fn spool(reader: &mut impl Read, len: u64) -> Result<Self> {
        let mut file = NamedTempFile::new()?;
        let copied = std::io::copy(&mut reader.take(len), &mut file)?;
        if copied != len {
            return Err(crate::error::SyncError::MalformedStream(format!(
                "opaque payload truncated: expected {} bytes, got {}",
                len, copied
            )));
        }
        file.flush()?;
        Ok(Blob::Spooled {
            file: Arc::new(file),
            len,
        })
    }

    pub fn len(&self) -> u64 {
        match self {
            Blob::Inline(bytes) => bytes.len() as u64,
            Blob::Spooled { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_spooled(&self) -> bool {
        matches!(self, Blob::Spooled { .. })
    }

    /// Copy the whole payload into `out`
    pub fn write_to(&self, out: &mut impl Write) -> Result<()> {
        match self {
            Blob::Inline(bytes) => out.write_all(bytes)?,
            Blob::Spooled { file, .. } => {
                let mut reader: File = file.reopen()?;
                std::io::copy(&mut reader, out)?;
            }
        }
        Ok(())
    }

    /// Read the payload from the start
    pub fn reader(&self) -> Result<Box<dyn Read + Send + '_>> {
        Ok(match self {
            Blob::Inline(bytes) => Box::new(bytes.as_slice()),
            Blob::Spooled { file, .. } => Box::new(BufReader::new(file.reopen()?)),
        })
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len() as usize);
        self.write_to(&mut out)?;
        Ok(out)
    }
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        match (self.to_vec(), other.to_vec()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Blob::Inline(bytes)
    }
}

/// Builds a [`Blob`] from sequential writes. Bytes stay in memory until
/// they pass `threshold`, then everything moves to a temp file.
pub struct BlobWriter {
    threshold: usize,
    buffer: Vec<u8>,
    file: Option<NamedTempFile>,
    len: u64,
}

impl BlobWriter {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            buffer: Vec::new(),
            file: None,
            len: 0,
        }
    }

    pub fn finish(self) -> Result<Blob> {
        match self.file {
            Some(mut file) => {
                file.flush()?;
                Ok(Blob::Spooled {
                    file: Arc::new(file),
                    len: self.len,
                })
            }
            None => Ok(Blob::Inline(self.buffer)),
        }
    }
}

impl Write for BlobWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        if self.file.is_none() && self.buffer.len() + data.len() > self.threshold {
            let mut file = NamedTempFile::new()?;
            file.write_all(&self.buffer)?;
            self.buffer = Vec::new();
            self.file = Some(file);
        }
        match self.file.as_mut() {
            Some(file) => file.write_all(data)?,
            None => self.buffer.extend_from_slice(data),
        }
        self.len += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Opaque(Blob),
}

/// One element of a wire document
#[derive(Debug, Clone, PartialEq)]
pub struct WireNode {
    pub page: u8,
    pub tag: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<WireNode>,
    pub payload: Option<Payload>,
}

impl WireNode {
    pub fn new(page: u8, tag: impl Into<String>) -> Self {
        Self {
            page,
            tag: tag.into(),
            attributes: Vec::new(),
            children: Vec::new(),
            payload: None,
        }
    }

    /// Leaf element holding inline text
    pub fn text(page: u8, tag: impl Into<String>, text: impl Into<String>) -> Self {
        let mut node = Self::new(page, tag);
        node.payload = Some(Payload::Text(text.into()));
        node
    }

    pub fn opaque(page: u8, tag: impl Into<String>, bytes: Vec<u8>) -> Self {
        let mut node = Self::new(page, tag);
        node.payload = Some(Payload::Opaque(Blob::Inline(bytes)));
        node
    }

    pub fn with_child(mut self, child: WireNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    pub fn has_content(&self) -> bool {
        !self.children.is_empty() || self.payload.is_some()
    }

    /// First direct child with this tag
    pub fn child(&self, tag: &str) -> Option<&WireNode> {
        self.children.iter().find(|c| c.tag == tag)
    }

    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a WireNode> + 'a {
        self.children.iter().filter(move |c| c.tag == tag)
    }

    /// Walk down through first matching children
    pub fn path(&self, tags: &[&str]) -> Option<&WireNode> {
        tags.iter().try_fold(self, |node, tag| node.child(tag))
    }

    pub fn text_value(&self) -> Option<&str> {
        match &self.payload {
            Some(Payload::Text(text)) => Some(text.as_str()),
            _ => None,
        }
    }

    /// Text of a direct child
    pub fn child_text(&self, tag: &str) -> Option<&str> {
        self.child(tag).and_then(|c| c.text_value())
    }
}
