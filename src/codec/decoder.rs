use std::io::{BufReader, Read};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::tokens::{TokenTable, MIN_TAG_TOKEN};
use super::{
    Blob, Payload, WireNode, CHARSET_UTF8, DEFAULT_SPOOL_THRESHOLD, END, HAS_ATTRIBUTES, HAS_CONTENT, OPAQUE, STR_I,
    SWITCH_PAGE, VERSION,
};
use crate::error::{Result, SyncError};

fn malformed(message: impl Into<String>) -> SyncError {
    SyncError::MalformedStream(message.into())
}

struct ByteReader<R: Read> {
    inner: BufReader<R>,
}

impl<R: Read> ByteReader<R> {
    fn next(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn expect(&mut self, what: &str) -> Result<u8> {
        self.next()?
            .ok_or_else(|| malformed(format!("stream truncated reading {}", what)))
    }

    fn mb_u32(&mut self) -> Result<u32> {
        let mut value: u32 = 0;
        for _ in 0..5 {
            let byte = self.expect("multi-byte integer")?;
            if value > (u32::MAX >> 7) {
                return Err(malformed("multi-byte integer overflows"));
            }
            value = (value << 7) | (byte & 0x7F) as u32;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(malformed("multi-byte integer longer than 5 bytes"))
    }

    fn inline_string(&mut self) -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            match self.expect("inline string")? {
                0x00 => break,
                b => bytes.push(b),
            }
        }
        String::from_utf8(bytes).map_err(|e| malformed(format!("inline string is not UTF-8: {}", e)))
    }

    fn opaque(&mut self, spool_threshold: usize) -> Result<Blob> {
        let len = self.mb_u32()? as u64;
        if len as usize > spool_threshold {
            return Blob::spool(&mut self.inner, len);
        }
        let mut bytes = vec![0u8; len as usize];
        self.inner.read_exact(&mut bytes).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                malformed("opaque payload truncated")
            } else {
                e.into()
            }
        })?;
        Ok(Blob::Inline(bytes))
    }
}

pub struct Decoder<'a> {
    table: &'a TokenTable,
    cancel: Option<&'a CancellationToken>,
    spool_threshold: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(table: &'a TokenTable) -> Self {
        Self {
            table,
            cancel: None,
            spool_threshold: DEFAULT_SPOOL_THRESHOLD,
        }
    }

    /// Stop with [`SyncError::Cancelled`] once `cancel` fires
    pub fn with_cancel(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Opaque payloads longer than this are written to a temp file
    pub fn with_spool_threshold(mut self, threshold: usize) -> Self {
        self.spool_threshold = threshold;
        self
    }

    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<WireNode> {
        self.decode(bytes)
    }

    /// Decode one document. Either the whole tree comes back or an error
    /// does; a cancelled or malformed stream never yields a partial tree.
    pub fn decode(&self, reader: impl Read) -> Result<WireNode> {
        let mut input = ByteReader {
            inner: BufReader::new(reader),
        };

        let version = input.expect("version")?;
        if version != VERSION {
            warn!(version, "Unexpected WBXML version");
        }
        let _public_id = input.mb_u32()?;
        let charset = input.mb_u32()?;
        if charset != CHARSET_UTF8 as u32 {
            return Err(malformed(format!("unsupported charset {}", charset)));
        }
        let string_table = input.mb_u32()?;
        if string_table != 0 {
            return Err(malformed("string tables are not supported"));
        }

        let mut page = 0u8;
        let mut stack: Vec<WireNode> = Vec::new();

        loop {
            let Some(byte) = input.next()? else {
                return Err(match stack.last() {
                    Some(open) => malformed(format!("stream truncated inside {}", open.tag)),
                    None => malformed("empty document"),
                });
            };

            let finished = match byte {
                SWITCH_PAGE => {
                    let next = input.expect("code page")?;
                    if !self.table.has_page(next) {
                        return Err(malformed(format!("unknown code page {}", next)));
                    }
                    page = next;
                    None
                }
                END => {
                    let node = stack.pop().ok_or_else(|| malformed("END without open element"))?;
                    // The encoder only sets the content flag on non-empty
                    // elements, so an empty one cannot round-trip
                    if !node.has_content() {
                        return Err(malformed(format!("{} flagged with content but empty", node.tag)));
                    }
                    attach(&mut stack, node)
                }
                STR_I => {
                    let text = input.inline_string()?;
                    set_payload(&mut stack, Payload::Text(text))?;
                    None
                }
                OPAQUE => {
                    let blob = input.opaque(self.spool_threshold)?;
                    set_payload(&mut stack, Payload::Opaque(blob))?;
                    None
                }
                tag => {
                    if self.cancel.is_some_and(|c| c.is_cancelled()) {
                        return Err(SyncError::Cancelled);
                    }

                    let token = tag & 0x3F;
                    if token < MIN_TAG_TOKEN {
                        return Err(malformed(format!("unsupported global token {:#04x}", tag)));
                    }
                    let name = self.table.name(page, token).ok_or_else(|| {
                        malformed(format!("unknown tag {:#04x} on code page {}", token, page))
                    })?;

                    let mut node = WireNode::new(page, name);
                    if tag & HAS_ATTRIBUTES != 0 {
                        node.attributes = read_attributes(&mut input)?;
                    }

                    if tag & HAS_CONTENT != 0 {
                        stack.push(node);
                        None
                    } else {
                        attach(&mut stack, node)
                    }
                }
            };

            if let Some(root) = finished {
                if input.next()?.is_some() {
                    return Err(malformed("trailing bytes after document"));
                }
                return Ok(root);
            }
        }
    }
}

/// Hang a completed node on its parent. Returns it when it was the root.
fn attach(stack: &mut [WireNode], node: WireNode) -> Option<WireNode> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            None
        }
        None => Some(node),
    }
}

fn set_payload(stack: &mut [WireNode], payload: Payload) -> Result<()> {
    let open = stack
        .last_mut()
        .ok_or_else(|| malformed("payload outside of any element"))?;
    if open.payload.is_some() {
        return Err(malformed(format!("{} has more than one payload", open.tag)));
    }
    open.payload = Some(payload);
    Ok(())
}

fn read_attributes<R: Read>(input: &mut ByteReader<R>) -> Result<Vec<(String, String)>> {
    let mut attributes = Vec::new();
    loop {
        match input.expect("attribute")? {
            END if attributes.is_empty() => return Err(malformed("empty attribute list")),
            END => return Ok(attributes),
            STR_I => {
                let name = input.inline_string()?;
                if input.expect("attribute value")? != STR_I {
                    return Err(malformed(format!("attribute {} has no value", name)));
                }
                let value = input.inline_string()?;
                attributes.push((name, value));
            }
            other => {
                return Err(malformed(format!(
                    "unexpected token {:#04x} in attribute list",
                    other
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tokens::{AIR_SYNC, COMPOSE_MAIL, FOLDER_HIERARCHY, MOVE};
    use crate::codec::Encoder;

    fn table() -> TokenTable {
        TokenTable::builtin().expect("builtin table")
    }

    fn sample_tree() -> WireNode {
        WireNode::new(FOLDER_HIERARCHY, "FolderSync")
            .with_child(WireNode::text(FOLDER_HIERARCHY, "Status", "1"))
            .with_child(WireNode::text(FOLDER_HIERARCHY, "SyncKey", "42"))
            .with_child(
                WireNode::new(FOLDER_HIERARCHY, "Changes")
                    .with_child(WireNode::text(FOLDER_HIERARCHY, "Count", "1"))
                    .with_child(
                        WireNode::new(FOLDER_HIERARCHY, "Add")
                            .with_child(WireNode::text(FOLDER_HIERARCHY, "ServerId", "5"))
                            .with_child(WireNode::text(FOLDER_HIERARCHY, "ParentId", "0"))
                            .with_child(WireNode::text(FOLDER_HIERARCHY, "DisplayName", "Inbox2"))
                            .with_child(WireNode::text(FOLDER_HIERARCHY, "Type", "12")),
                    ),
            )
            .with_child(
                WireNode::new(MOVE, "Response")
                    .with_attribute("origin", "test")
                    .with_child(WireNode::opaque(COMPOSE_MAIL, "Mime", b"From: a".to_vec()))
                    .with_child(WireNode::new(AIR_SYNC, "GetChanges")),
            )
    }

    #[test]
    fn test_decode_inverts_encode() {
        let table = table();
        let tree = sample_tree();
        let bytes = Encoder::new(&table).encode_to_vec(&tree).expect("encode");
        let decoded = Decoder::new(&table).decode_bytes(&bytes).expect("decode");
        assert_eq!(decoded, tree);
    }

    #[test]
    fn test_encode_inverts_decode() {
        let table = table();
        let bytes = Encoder::new(&table)
            .encode_to_vec(&sample_tree())
            .expect("encode");
        let decoded = Decoder::new(&table).decode_bytes(&bytes).expect("decode");
        let reencoded = Encoder::new(&table).encode_to_vec(&decoded).expect("re-encode");
        assert_eq!(reencoded, bytes);
    }

    #[test]
    fn test_truncated_stream() {
        let table = table();
        let bytes = Encoder::new(&table)
            .encode_to_vec(&sample_tree())
            .expect("encode");
        for cut in [0, 3, 6, bytes.len() / 2, bytes.len() - 1] {
            let result = Decoder::new(&table).decode_bytes(&bytes[..cut]);
            assert!(
                matches!(result, Err(SyncError::MalformedStream(_))),
                "cut at {} gave {:?}",
                cut,
                result
            );
        }
    }

    #[test]
    fn test_invalid_sequences() {
        let table = table();
        let cases: Vec<Vec<u8>> = vec![
            // wrong charset
            vec![0x03, 0x01, 0x04, 0x00, 0x05],
            // string table present
            vec![0x03, 0x01, 0x6A, 0x02, b'a', 0x00, 0x05],
            // unknown tag on page 0
            vec![0x03, 0x01, 0x6A, 0x00, 0x3F],
            // unknown code page
            vec![0x03, 0x01, 0x6A, 0x00, 0x00, 0x63, 0x05],
            // unsupported global (LITERAL)
            vec![0x03, 0x01, 0x6A, 0x00, 0x04],
            // END with nothing open
            vec![0x03, 0x01, 0x6A, 0x00, 0x01],
            // trailing bytes
            vec![0x03, 0x01, 0x6A, 0x00, 0x05, 0x05],
            // text outside an element
            vec![0x03, 0x01, 0x6A, 0x00, 0x03, b'x', 0x00],
        ];
        for bytes in cases {
            let result = Decoder::new(&table).decode_bytes(&bytes);
            assert!(
                matches!(result, Err(SyncError::MalformedStream(_))),
                "{:02x?} gave {:?}",
                bytes,
                result
            );
        }
    }

    #[test]
    fn test_empty_content_and_attribute_flags_rejected() {
        let table = table();
        for bytes in [
            // Sync flagged with content, closed at once
            vec![0x03, 0x01, 0x6A, 0x00, 0x45, 0x01],
            // Sync flagged with attributes, empty list
            vec![0x03, 0x01, 0x6A, 0x00, 0x85, 0x01],
        ] {
            let result = Decoder::new(&table).decode_bytes(&bytes);
            assert!(
                matches!(result, Err(SyncError::MalformedStream(_))),
                "{:02x?} gave {:?}",
                bytes,
                result
            );
        }

        // Every stream the decoder accepts encodes back to the same bytes
        for bytes in [
            vec![0x03, 0x01, 0x6A, 0x00, 0x05],
            vec![0x03, 0x01, 0x6A, 0x00, 0x45, 0x03, 0x00, 0x01],
            vec![0x03, 0x01, 0x6A, 0x00, 0x85, 0x03, b'a', 0x00, 0x03, 0x00, 0x01],
        ] {
            let decoded = Decoder::new(&table).decode_bytes(&bytes).expect("decode");
            let reencoded = Encoder::new(&table).encode_to_vec(&decoded).expect("encode");
            assert_eq!(reencoded, bytes);
        }
    }

    #[test]
    fn test_huge_length_prefix_is_truncation() {
        let table = table();
        // ApplicationData claiming u32::MAX opaque bytes, followed by two
        let bytes = vec![
            0x03, 0x01, 0x6A, 0x00, 0x5D, 0xC3, 0x8F, 0xFF, 0xFF, 0xFF, 0x7F, 0xDE, 0xAD,
        ];
        let result = Decoder::new(&table).decode_bytes(&bytes);
        assert!(matches!(result, Err(SyncError::MalformedStream(_))), "{:?}", result);
    }

    #[test]
    fn test_decode_from_spooled_reader() {
        let table = table();
        let tree = sample_tree();
        let spooled = Encoder::new(&table).encode_spooled(&tree, 8).expect("encode");
        assert!(spooled.is_spooled());
        let decoded = Decoder::new(&table)
            .decode(spooled.reader().expect("reader"))
            .expect("decode");
        assert_eq!(decoded, tree);
    }

    #[test]
    fn test_unknown_version_still_decodes() {
        let table = table();
        let node = Decoder::new(&table)
            .decode_bytes(&[0x02, 0x01, 0x6A, 0x00, 0x05])
            .expect("decode");
        assert_eq!(node.tag, "Sync");
        assert!(!node.has_content());
    }

    #[test]
    fn test_cancelled_decode() {
        let table = table();
        let bytes = Encoder::new(&table)
            .encode_to_vec(&sample_tree())
            .expect("encode");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = Decoder::new(&table).with_cancel(&cancel).decode_bytes(&bytes);
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[test]
    fn test_large_opaque_is_spooled() {
        let table = table();
        let tree = WireNode::opaque(AIR_SYNC, "ApplicationData", vec![9u8; 1000]);
        let bytes = Encoder::new(&table).encode_to_vec(&tree).expect("encode");

        let decoded = Decoder::new(&table)
            .with_spool_threshold(100)
            .decode_bytes(&bytes)
            .expect("decode");
        match &decoded.payload {
            Some(Payload::Opaque(blob)) => assert!(blob.is_spooled()),
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(decoded, tree);
    }
}
