//! Serialization of message metadata and content to the backing store's
//! blob columns.
//!
//! Metadata is stored as a one-byte type tag followed by the
//! type-specific encoded payload: a big-endian declared content length
//! (used for buffer sizing on recovery) and the opaque body bytes.
//! Content is stored as the submission-order concatenation of the
//! message's chunks, with no padding.

use std::ops::Deref;
use std::sync::Arc;

use crate::error::{Result, StoreError};

/// Declared-length field width plus the type tag.
const METADATA_HEADER_LEN: usize = 5;

/// Discriminator for the encoding of a message's metadata payload.
///
/// Tags are part of the persisted format and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MetadataType {
    /// Broker-internal messages (management, virtual-host state).
    Internal = 0,
    Amqp0_8 = 1,
    Amqp0_9 = 2,
    Amqp0_9_1 = 3,
    Amqp0_10 = 4,
    Amqp1_0 = 5,
}

impl MetadataType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Internal),
            1 => Ok(Self::Amqp0_8),
            2 => Ok(Self::Amqp0_9),
            3 => Ok(Self::Amqp0_9_1),
            4 => Ok(Self::Amqp0_10),
            5 => Ok(Self::Amqp1_0),
            other => Err(StoreError::CorruptRecord(format!(
                "unknown metadata type tag {other}"
            ))),
        }
    }
}

/// Decoded form of a metadata record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub kind: MetadataType,
    /// Declared length of the message's content, in bytes.
    pub content_size: u32,
    /// Type-specific encoded body; opaque to the store.
    pub body: Vec<u8>,
}

impl MessageMetadata {
    pub fn new(kind: MetadataType, content_size: u32, body: Vec<u8>) -> Self {
        Self {
            kind,
            content_size,
            body,
        }
    }
}

pub fn encode_metadata(metadata: &MessageMetadata) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(METADATA_HEADER_LEN + metadata.body.len());
    encoded.push(metadata.kind.tag());
    encoded.extend_from_slice(&metadata.content_size.to_be_bytes());
    encoded.extend_from_slice(&metadata.body);
    encoded
}

pub fn decode_metadata(bytes: &[u8]) -> Result<MessageMetadata> {
    if bytes.len() < METADATA_HEADER_LEN {
        return Err(StoreError::CorruptRecord(format!(
            "metadata record truncated at {} bytes",
            bytes.len()
        )));
    }
    let kind = MetadataType::from_tag(bytes[0])?;
    let mut size_bytes = [0u8; 4];
    size_bytes.copy_from_slice(&bytes[1..5]);
    Ok(MessageMetadata {
        kind,
        content_size: u32::from_be_bytes(size_bytes),
        body: bytes[METADATA_HEADER_LEN..].to_vec(),
    })
}

/// Concatenate content chunks in submission order.
pub fn encode_content(chunks: &[Arc<[u8]>]) -> Vec<u8> {
    let total: usize = chunks.iter().map(|c| c.len()).sum();
    let mut encoded = Vec::with_capacity(total);
    for chunk in chunks {
        encoded.extend_from_slice(chunk);
    }
    encoded
}

/// A zero-copy view into a refcounted content chunk.
#[derive(Debug, Clone)]
pub struct ContentView {
    data: Arc<[u8]>,
    start: usize,
    end: usize,
}

impl ContentView {
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl Deref for ContentView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for ContentView {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// Slice `[offset, offset + length)` out of a chunked payload without
/// copying. The views cover the intersection of the requested range with
/// the stored payload; a range past the end simply yields fewer bytes.
pub fn content_views(chunks: &[Arc<[u8]>], offset: usize, length: usize) -> Vec<ContentView> {
    let mut views = Vec::new();
    let mut remaining = length;
    let mut pos = 0usize;

    for chunk in chunks {
        if remaining == 0 {
            break;
        }
        let chunk_len = chunk.len();
        if pos + chunk_len <= offset {
            pos += chunk_len;
            continue;
        }
        let start = offset.saturating_sub(pos);
        let available = chunk_len - start;
        let take = available.min(remaining);
        if take > 0 {
            views.push(ContentView {
                data: Arc::clone(chunk),
                start,
                end: start + take,
            });
        }
        remaining -= take;
        pos += chunk_len;
    }

    views
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chunk(bytes: &[u8]) -> Arc<[u8]> {
        Arc::from(bytes)
    }

    fn flatten(views: &[ContentView]) -> Vec<u8> {
        let mut out = Vec::new();
        for view in views {
            out.extend_from_slice(view);
        }
        out
    }

    #[test]
    fn metadata_round_trip() {
        for kind in [
            MetadataType::Internal,
            MetadataType::Amqp0_8,
            MetadataType::Amqp0_9,
            MetadataType::Amqp0_9_1,
            MetadataType::Amqp0_10,
            MetadataType::Amqp1_0,
        ] {
            let metadata = MessageMetadata::new(kind, 42, vec![1, 2, 3, 4]);
            let decoded = decode_metadata(&encode_metadata(&metadata)).unwrap();
            assert_eq!(decoded, metadata);
        }
    }

    #[test]
    fn metadata_empty_body_round_trip() {
        let metadata = MessageMetadata::new(MetadataType::Internal, 0, Vec::new());
        let decoded = decode_metadata(&encode_metadata(&metadata)).unwrap();
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn unknown_tag_is_corrupt() {
        let err = decode_metadata(&[0xAB, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRecord(_)));
    }

    #[test]
    fn truncated_metadata_is_corrupt() {
        let err = decode_metadata(&[0, 0, 0]).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRecord(_)));
    }

    #[test]
    fn encode_content_concatenates_in_order() {
        let chunks = [chunk(b"he"), chunk(b"ll"), chunk(b"o")];
        assert_eq!(encode_content(&chunks), b"hello");
    }

    #[test]
    fn views_span_chunk_boundaries() {
        let chunks = [chunk(b"abc"), chunk(b"def"), chunk(b"ghi")];
        let views = content_views(&chunks, 2, 5);
        assert_eq!(flatten(&views), b"cdefg");
    }

    #[test]
    fn views_past_end_yield_fewer_bytes() {
        let chunks = [chunk(b"abc")];
        let views = content_views(&chunks, 1, 100);
        assert_eq!(flatten(&views), b"bc");
    }

    #[test]
    fn zero_length_request_yields_no_views() {
        let chunks = [chunk(b"abc")];
        assert!(content_views(&chunks, 0, 0).is_empty());
    }

    #[test]
    fn views_do_not_copy() {
        let data = chunk(b"abcdef");
        let views = content_views(std::slice::from_ref(&data), 1, 4);
        assert_eq!(views.len(), 1);
        assert!(Arc::ptr_eq(&views[0].data, &data));
    }

    proptest! {
        #[test]
        fn metadata_round_trip_prop(tag in 0u8..=5, content_size: u32, body in proptest::collection::vec(any::<u8>(), 0..256)) {
            let metadata = MessageMetadata::new(MetadataType::from_tag(tag).unwrap(), content_size, body);
            let decoded = decode_metadata(&encode_metadata(&metadata)).unwrap();
            prop_assert_eq!(decoded, metadata);
        }

        #[test]
        fn views_match_flat_slice(
            raw in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..32), 0..8),
            offset in 0usize..64,
            length in 0usize..64,
        ) {
            let chunks: Vec<Arc<[u8]>> = raw.iter().map(|c| Arc::from(c.as_slice())).collect();
            let flat = encode_content(&chunks);
            let end = flat.len().min(offset.saturating_add(length));
            let expected = if offset >= flat.len() { &[] as &[u8] } else { &flat[offset..end] };
            prop_assert_eq!(flatten(&content_views(&chunks, offset, length)), expected);
        }
    }
}
