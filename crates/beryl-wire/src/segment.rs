use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, WireError};

/// Hard ceiling on the byte length of a single message.
pub const MAX_MESSAGE_BYTES: usize = u32::MAX as usize;

/// Hex-encoded SHA-256 digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// A single chunk of one message, carrying sequence metadata and an
/// integrity digest. Payloads always split on UTF-8 code-point
/// boundaries, so each segment's `data` decodes on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub sequence_number: u64,
    pub data: Bytes,
    pub checksum: String,
    pub total_segments: u64,
    pub message_id: String,
    pub is_last: bool,
    pub original_length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SegmentMetadata {
    pub seq: u64,
    pub checksum: String,
    pub total_segments: u64,
    pub message_id: String,
    pub is_last: bool,
    pub original_length: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SegmentEnvelope {
    pub metadata: SegmentMetadata,
    pub data: String,
}

impl Segment {
    pub(crate) fn to_envelope(&self) -> Result<SegmentEnvelope> {
        let data = std::str::from_utf8(&self.data)
            .map_err(|_| WireError::InvalidUtf8)?
            .to_owned();
        Ok(SegmentEnvelope {
            metadata: SegmentMetadata {
                seq: self.sequence_number,
                checksum: self.checksum.clone(),
                total_segments: self.total_segments,
                message_id: self.message_id.clone(),
                is_last: self.is_last,
                original_length: self.original_length,
            },
            data,
        })
    }

    /// Parses one wire frame into a segment, verifying the integrity
    /// digest. Returns `None` on malformed JSON, missing metadata
    /// fields, or a checksum mismatch; the bytes are simply dropped and
    /// the peer's retransmission recovers the segment.
    pub fn decode(bytes: &[u8]) -> Option<Segment> {
        let text = std::str::from_utf8(bytes).ok()?;
        let envelope: SegmentEnvelope = serde_json::from_str(text.trim_end()).ok()?;
        let data = Bytes::from(envelope.data.into_bytes());
        if sha256_hex(&data) != envelope.metadata.checksum {
            return None;
        }
        Some(Segment {
            sequence_number: envelope.metadata.seq,
            data,
            checksum: envelope.metadata.checksum,
            total_segments: envelope.metadata.total_segments,
            message_id: envelope.metadata.message_id,
            is_last: envelope.metadata.is_last,
            original_length: envelope.metadata.original_length,
        })
    }
}

/// Splits messages into bounded, self-describing segments and
/// reassembles them on the far side.
///
/// The size budget per segment covers the full serialized envelope,
/// so construction measures the metadata overhead against a worst-case
/// sample and derives how many payload bytes fit in each frame.
#[derive(Debug)]
pub struct Segmenter {
    max_segment_size: usize,
    max_data_size: usize,
    metadata_overhead: usize,
    message_counter: u64,
}

impl Segmenter {
    pub fn new(max_segment_size: usize) -> Result<Self> {
        let sample = SegmentEnvelope {
            metadata: SegmentMetadata {
                seq: 999_999,
                checksum: "x".repeat(64),
                total_segments: 999_999,
                message_id: format!("999999-{}", "f".repeat(16)),
                is_last: true,
                original_length: 999_999_999,
            },
            data: String::new(),
        };
        // +1 for the trailing frame delimiter
        let metadata_overhead = serde_json::to_string(&sample)?.len() + 1;

        if max_segment_size <= metadata_overhead {
            return Err(WireError::SegmentTooSmall {
                max_segment_size,
                metadata_overhead,
            });
        }

        Ok(Self {
            max_segment_size,
            max_data_size: max_segment_size - metadata_overhead,
            metadata_overhead,
            message_counter: 0,
        })
    }

    pub fn max_segment_size(&self) -> usize {
        self.max_segment_size
    }

    pub fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    pub fn metadata_overhead(&self) -> usize {
        self.metadata_overhead
    }

    fn generate_message_id(&mut self, message: &str) -> String {
        self.message_counter += 1;
        let digest = sha256_hex(format!("{}{}", self.message_counter, message).as_bytes());
        format!("{}-{}", self.message_counter, &digest[..16])
    }

    /// Splits `message` into segments of at most `max_data_size` payload
    /// bytes, never breaking a UTF-8 code point across two segments.
    pub fn segment_message(&mut self, message: &str) -> Result<Vec<Segment>> {
        if message.is_empty() {
            return Err(WireError::EmptyMessage);
        }
        let message_bytes = message.as_bytes();
        let total_length = message_bytes.len();
        if total_length > MAX_MESSAGE_BYTES {
            return Err(WireError::MessageTooLarge(total_length));
        }

        let message_id = self.generate_message_id(message);

        // First pass: find every split point, so total_segments reflects
        // the boundary-respecting split rather than a byte-count estimate.
        let mut splits = Vec::new();
        let mut processed = 0;
        while processed < total_length {
            let remaining = &message_bytes[processed..];
            let target = self.max_data_size.min(remaining.len());
            let split = find_safe_split_point(remaining, target)?;
            splits.push((processed, processed + split));
            processed += split;
        }

        let total_segments = splits.len() as u64;
        let segments = splits
            .iter()
            .enumerate()
            .map(|(i, &(start, end))| {
                let data = Bytes::copy_from_slice(&message_bytes[start..end]);
                Segment {
                    sequence_number: i as u64,
                    checksum: sha256_hex(&data),
                    data,
                    total_segments,
                    message_id: message_id.clone(),
                    is_last: i as u64 == total_segments - 1,
                    original_length: total_length as u64,
                }
            })
            .collect();

        Ok(segments)
    }

    /// Serializes a segment into one newline-terminated wire frame,
    /// enforcing the configured size bound.
    pub fn serialize_segment(&self, segment: &Segment) -> Result<Bytes> {
        let mut serialized = serde_json::to_string(&segment.to_envelope()?)?;
        serialized.push('\n');
        if serialized.len() > self.max_segment_size {
            return Err(WireError::SegmentOverflow {
                size: serialized.len(),
                max: self.max_segment_size,
            });
        }
        Ok(Bytes::from(serialized.into_bytes()))
    }

    /// See [`Segment::decode`].
    pub fn deserialize_segment(bytes: &[u8]) -> Option<Segment> {
        Segment::decode(bytes)
    }

    /// Reconstructs the original message from a set of segments.
    ///
    /// Sorts by sequence, drops adjacent duplicates when more segments
    /// than expected arrived, and verifies contiguity, metadata
    /// consistency, the last-segment flag, and the reassembled length.
    /// Any failure yields `None`.
    pub fn reassemble_message(segments: &[Segment]) -> Option<String> {
        if segments.is_empty() {
            return None;
        }

        let mut sorted: Vec<&Segment> = segments.iter().collect();
        sorted.sort_by_key(|s| s.sequence_number);

        let expected = sorted[0].total_segments as usize;
        if sorted.len() != expected {
            sorted.dedup_by(|a, b| a.sequence_number == b.sequence_number);
        }

        if sorted
            .iter()
            .enumerate()
            .any(|(i, s)| s.sequence_number != i as u64)
        {
            return None;
        }

        let message_id = &sorted[0].message_id;
        let original_length = sorted[0].original_length;
        if !sorted
            .iter()
            .all(|s| s.message_id == *message_id && s.original_length == original_length)
        {
            return None;
        }

        if !sorted.last()?.is_last {
            return None;
        }

        let mut reassembled = Vec::with_capacity(original_length as usize);
        for segment in &sorted {
            reassembled.extend_from_slice(&segment.data);
        }
        if reassembled.len() as u64 != original_length {
            return None;
        }

        String::from_utf8(reassembled).ok()
    }
}

/// Finds the largest split position `<= target` where the prefix is
/// valid UTF-8, so no code point straddles two segments.
fn find_safe_split_point(bytes: &[u8], target: usize) -> Result<usize> {
    if target >= bytes.len() {
        return Ok(bytes.len());
    }

    // ASCII prefix: the target itself is always a boundary.
    if bytes[..target].iter().all(|b| *b <= 0x7f) {
        return Ok(target);
    }

    let mut pos = target;
    while pos > 0 {
        // A continuation byte has its two high bits set to 10.
        if bytes[pos] & 0xc0 != 0x80 && std::str::from_utf8(&bytes[..pos]).is_ok() {
            return Ok(pos);
        }
        pos -= 1;
    }

    Err(WireError::NoSplitBoundary(target))
}
