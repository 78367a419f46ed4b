use std::collections::{BTreeMap, HashMap, HashSet};

use beryl_wire::Segment;

/// What the server should do with a segment it just received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentDisposition {
    /// Newly stored; acknowledge the highest contiguous sequence.
    Stored { highest: i64, complete: bool },
    /// Already seen within an in-flight message; re-acknowledge the
    /// current highest contiguous sequence so the sender stops resending.
    DuplicateInFlight { highest: i64 },
    /// The message was already delivered; re-acknowledge its final
    /// sequence number.
    DuplicateCompleted { final_ack: i64 },
}

/// Per-connection segment store: received segments keyed by message,
/// the highest contiguous sequence per message (starting at −1), and
/// the set of completed message ids for late-duplicate suppression.
#[derive(Debug, Default)]
pub struct ReceiverStore {
    received: HashMap<String, BTreeMap<u64, Segment>>,
    history: HashMap<String, HashSet<u64>>,
    highest_contiguous: HashMap<String, i64>,
    completed: HashSet<String>,
}

impl ReceiverStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a segment and classifies it.
    ///
    /// Completion is decided purely by the contiguous count reaching
    /// `total_segments`; reassembly separately checks the `is_last`
    /// flag, so a last segment that arrived early (out of order) cannot
    /// wedge the message.
    pub fn insert(&mut self, segment: Segment) -> SegmentDisposition {
        let message_id = segment.message_id.clone();
        let seq = segment.sequence_number;

        if self.completed.contains(&message_id) {
            return SegmentDisposition::DuplicateCompleted {
                final_ack: segment.total_segments as i64 - 1,
            };
        }

        let history = self.history.entry(message_id.clone()).or_default();
        if history.contains(&seq) {
            return SegmentDisposition::DuplicateInFlight {
                highest: self
                    .highest_contiguous
                    .get(&message_id)
                    .copied()
                    .unwrap_or(-1),
            };
        }
        history.insert(seq);

        let total = segment.total_segments as i64;
        let segments = self.received.entry(message_id.clone()).or_default();
        let highest = self.highest_contiguous.entry(message_id).or_insert(-1);
        segments.insert(seq, segment);
        while segments.contains_key(&((*highest + 1) as u64)) {
            *highest += 1;
        }

        SegmentDisposition::Stored {
            highest: *highest,
            complete: *highest == total - 1,
        }
    }

    /// Frees a message's bookkeeping and returns its segments for
    /// reassembly, keeping only the id in the completed set.
    pub fn take_complete(&mut self, message_id: &str) -> Vec<Segment> {
        self.completed.insert(message_id.to_owned());
        self.history.remove(message_id);
        self.highest_contiguous.remove(message_id);
        self.received
            .remove(message_id)
            .map(|segments| segments.into_values().collect())
            .unwrap_or_default()
    }

    pub fn is_completed(&self, message_id: &str) -> bool {
        self.completed.contains(message_id)
    }

    pub fn highest_contiguous(&self, message_id: &str) -> i64 {
        self.highest_contiguous
            .get(message_id)
            .copied()
            .unwrap_or(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beryl_wire::Segmenter;

    fn segments_for(message: &str, max_data_size: usize) -> Vec<Segment> {
        let probe = Segmenter::new(4096).unwrap();
        let mut segmenter = Segmenter::new(probe.metadata_overhead() + max_data_size).unwrap();
        segmenter.segment_message(message).unwrap()
    }

    #[test]
    fn in_order_arrival_advances_contiguously() {
        let segments = segments_for("abcdefghijklmnopqrstuvwxyz", 8);
        let total = segments.len();
        let mut store = ReceiverStore::new();

        for (i, segment) in segments.into_iter().enumerate() {
            let disposition = store.insert(segment);
            let complete = i == total - 1;
            assert_eq!(
                disposition,
                SegmentDisposition::Stored {
                    highest: i as i64,
                    complete
                }
            );
        }
    }

    #[test]
    fn out_of_order_arrival_holds_the_ack_back() {
        let segments = segments_for("abcdefghijklmnopqrstuvwx", 8);
        assert_eq!(segments.len(), 3);
        let mut store = ReceiverStore::new();

        assert_eq!(
            store.insert(segments[0].clone()),
            SegmentDisposition::Stored {
                highest: 0,
                complete: false
            }
        );
        // A gap: segment 2 lands before segment 1.
        assert_eq!(
            store.insert(segments[2].clone()),
            SegmentDisposition::Stored {
                highest: 0,
                complete: false
            }
        );
        assert_eq!(
            store.insert(segments[1].clone()),
            SegmentDisposition::Stored {
                highest: 2,
                complete: true
            }
        );
    }

    #[test]
    fn last_segment_arriving_first_still_completes() {
        let segments = segments_for("abcdefghijklmnop", 8);
        assert_eq!(segments.len(), 2);
        let mut store = ReceiverStore::new();

        store.insert(segments[1].clone());
        assert_eq!(
            store.insert(segments[0].clone()),
            SegmentDisposition::Stored {
                highest: 1,
                complete: true
            }
        );
    }

    #[test]
    fn duplicate_in_flight_reacks_current_highest() {
        let segments = segments_for("abcdefghijklmnopqrstuvwx", 8);
        let mut store = ReceiverStore::new();

        store.insert(segments[0].clone());
        assert_eq!(
            store.insert(segments[0].clone()),
            SegmentDisposition::DuplicateInFlight { highest: 0 }
        );
        // A duplicate beyond the contiguous prefix still re-acks it.
        store.insert(segments[2].clone());
        assert_eq!(
            store.insert(segments[2].clone()),
            SegmentDisposition::DuplicateInFlight { highest: 0 }
        );
    }

    #[test]
    fn completed_message_yields_final_ack_and_no_redelivery() {
        let segments = segments_for("abcdefghijklmnopqrstuvwx", 8);
        let message_id = segments[0].message_id.clone();
        let total = segments.len() as i64;
        let mut store = ReceiverStore::new();

        for segment in &segments {
            store.insert(segment.clone());
        }
        let collected = store.take_complete(&message_id);
        assert_eq!(collected.len(), segments.len());
        assert!(store.is_completed(&message_id));

        assert_eq!(
            store.insert(segments[1].clone()),
            SegmentDisposition::DuplicateCompleted {
                final_ack: total - 1
            }
        );
    }

    #[test]
    fn highest_contiguous_is_monotonic() {
        let segments = segments_for("abcdefghijklmnopqrstuvwxyz0123456789abcd", 8);
        assert_eq!(segments.len(), 5);
        let mut store = ReceiverStore::new();
        let message_id = segments[0].message_id.clone();

        let mut previous = -1;
        for segment in [4, 0, 2, 1, 3].map(|i| segments[i].clone()) {
            store.insert(segment);
            let current = store.highest_contiguous(&message_id);
            assert!(current >= previous);
            previous = current;
        }
        assert_eq!(previous, 4);
    }

    #[test]
    fn interleaved_messages_are_tracked_independently() {
        let a = segments_for("first message, two segments!", 16);
        let b = segments_for("second message, two segments", 16);
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
        let mut store = ReceiverStore::new();

        store.insert(a[0].clone());
        store.insert(b[1].clone());
        assert_eq!(store.highest_contiguous(&a[0].message_id), 0);
        assert_eq!(store.highest_contiguous(&b[0].message_id), -1);

        assert_eq!(
            store.insert(b[0].clone()),
            SegmentDisposition::Stored {
                highest: 1,
                complete: true
            }
        );
    }
}
