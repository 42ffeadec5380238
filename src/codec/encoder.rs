use std::io::Write;

use tokio_util::sync::CancellationToken;

use super::tokens::TokenTable;
use super::{
    Blob, BlobWriter, Payload, WireNode, CHARSET_UTF8, END, HAS_ATTRIBUTES, HAS_CONTENT, OPAQUE, PUBLIC_ID,
    STR_I, SWITCH_PAGE, VERSION,
};
use crate::error::{Result, SyncError};

/// Writes a multi-byte integer: 7 bits per byte, most significant group
/// first, continuation bit on every byte but the last
pub fn write_mb_u32(out: &mut impl Write, mut value: u32) -> Result<()> {
    let mut buf = [0u8; 5];
    let mut i = buf.len() - 1;
    buf[i] = (value & 0x7F) as u8;
    value >>= 7;
    while value > 0 {
        i -= 1;
        buf[i] = 0x80 | (value & 0x7F) as u8;
        value >>= 7;
    }
    out.write_all(&buf[i..])?;
    Ok(())
}

pub struct Encoder<'a> {
    table: &'a TokenTable,
    cancel: Option<&'a CancellationToken>,
}

impl<'a> Encoder<'a> {
    pub fn new(table: &'a TokenTable) -> Self {
        Self {
            table,
            cancel: None,
        }
    }

    /// Stop with [`SyncError::Cancelled`] once `cancel` fires
    pub fn with_cancel(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn encode(&self, root: &WireNode, out: &mut impl Write) -> Result<()> {
        out.write_all(&[VERSION, PUBLIC_ID, CHARSET_UTF8, 0x00])?;
        let mut page = 0u8;
        self.write_node(root, out, &mut page)
    }

    pub fn encode_to_vec(&self, root: &WireNode) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode(root, &mut out)?;
        Ok(out)
    }

    /// Encode into a buffer that moves to disk once it grows past `threshold`
    pub fn encode_spooled(&self, root: &WireNode, threshold: usize) -> Result<Blob> {
        let mut out = BlobWriter::new(threshold);
        self.encode(root, &mut out)?;
        out.finish()
    }

    fn write_node(&self, node: &WireNode, out: &mut impl Write, page: &mut u8) -> Result<()> {
        if self.cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(SyncError::Cancelled);
        }

        if node.page != *page {
            if !self.table.has_page(node.page) {
                return Err(SyncError::MalformedStream(format!(
                    "unknown code page {}",
                    node.page
                )));
            }
            out.write_all(&[SWITCH_PAGE, node.page])?;
            *page = node.page;
        }

        let token = self.table.token(node.page, &node.tag).ok_or_else(|| {
            SyncError::MalformedStream(format!(
                "no token for {} on code page {}",
                node.tag, node.page
            ))
        })?;

        let mut tag = token;
        if !node.attributes.is_empty() {
            tag |= HAS_ATTRIBUTES;
        }
        if node.has_content() {
            tag |= HAS_CONTENT;
        }
        out.write_all(&[tag])?;

        if !node.attributes.is_empty() {
            for (name, value) in &node.attributes {
                write_inline_string(out, name)?;
                write_inline_string(out, value)?;
            }
            out.write_all(&[END])?;
        }

        for child in &node.children {
            self.write_node(child, out, page)?;
        }

        match &node.payload {
            Some(Payload::Text(text)) => write_inline_string(out, text)?,
            Some(Payload::Opaque(blob)) => {
                let len = u32::try_from(blob.len()).map_err(|_| {
                    SyncError::MalformedStream(format!("opaque payload too large: {}", blob.len()))
                })?;
                out.write_all(&[OPAQUE])?;
                write_mb_u32(out, len)?;
                blob.write_to(out)?;
            }
            None => {}
        }

        if node.has_content() {
            out.write_all(&[END])?;
        }
        Ok(())
    }
}

fn write_inline_string(out: &mut impl Write, text: &str) -> Result<()> {
    if text.as_bytes().contains(&0) {
        return Err(SyncError::MalformedStream(
            "inline string contains a NUL byte".into(),
        ));
    }
    out.write_all(&[STR_I])?;
    out.write_all(text.as_bytes())?;
    out.write_all(&[0x00])?;
    Ok(())
}
