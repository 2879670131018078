// Copyright 2025 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Buffered backfill chunks for one pass of the backfill loop.
//!
//! Between writing a watermark and observing it in the replication stream,
//! any replication event landing on a not-yet-emitted key is applied to
//! the buffered chunk instead of being forwarded, so that when the chunk
//! is finally emitted every buffered row reflects its state as of the
//! watermark.

use std::collections::BTreeMap;

use bytes::Bytes;
use itertools::Itertools;

use crate::source::{ChangeEvent, ChangeOp};
use crate::{CaptureError, CaptureResult, StreamId};

pub(crate) struct ResultSet {
    chunk_size: usize,
    streams: BTreeMap<StreamId, BackfillChunk>,
}

#[derive(Default)]
struct BackfillChunk {
    rows: BTreeMap<Bytes, ChangeEvent>,
    /// The last key returned by the scan, fixed at buffer time. Patches
    /// never move it: a delete may shrink `rows`, but the scan still
    /// covered everything up to this key.
    scanned: Option<Bytes>,
    complete: bool,
}

impl ResultSet {
    pub(crate) fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            streams: BTreeMap::new(),
        }
    }

    /// Appends a chunk of scanned rows for a stream. A chunk shorter than
    /// the chunk size means the scan reached the end of the table.
    pub(crate) fn buffer(
        &mut self,
        stream_id: &StreamId,
        events: Vec<ChangeEvent>,
    ) -> CaptureResult<()> {
        let chunk = self.streams.entry(stream_id.clone()).or_default();
        let short = events.len() < self.chunk_size;
        for event in events {
            if chunk
                .scanned
                .as_deref()
                .is_some_and(|last| event.row_key.as_ref() <= last)
            {
                return Err(CaptureError::ChunkOrder {
                    stream: stream_id.clone(),
                    key: event.row_key.clone(),
                });
            }
            chunk.scanned = Some(event.row_key.clone());
            chunk.rows.insert(event.row_key.clone(), event);
        }
        if short {
            chunk.complete = true;
        }
        Ok(())
    }

    /// Applies a replication event to the buffered chunk of a stream.
    ///
    /// Only rows the scan has already covered can go stale in the buffer,
    /// so events beyond the scan boundary of an incomplete chunk are
    /// dropped: the next chunk reads those rows' final state directly.
    /// Once a chunk is complete there is no next chunk, and every event
    /// must be applied.
    pub(crate) fn patch(
        &mut self,
        stream_id: &StreamId,
        event: ChangeEvent,
    ) -> CaptureResult<()> {
        let Some(chunk) = self.streams.get_mut(stream_id) else {
            return Err(CaptureError::NoResultSet(stream_id.clone()));
        };
        if !chunk.complete
            && chunk
                .scanned
                .as_deref()
                .is_none_or(|scanned| event.row_key.as_ref() > scanned)
        {
            return Ok(());
        }
        match event.operation {
            // An update for a row which isn't buffered carries the row's
            // current contents, so it buffers the same way an insert does.
            ChangeOp::Insert | ChangeOp::Update => {
                let row = ChangeEvent {
                    operation: ChangeOp::Insert,
                    source: event.source,
                    row_key: event.row_key.clone(),
                    before: None,
                    after: event.after,
                };
                chunk.rows.insert(event.row_key, row);
            }
            ChangeOp::Delete => {
                chunk.rows.remove(&event.row_key);
            }
        }
        Ok(())
    }

    /// The streams with buffered results, in sorted order.
    pub(crate) fn streams(&self) -> Vec<StreamId> {
        self.streams.keys().cloned().collect_vec()
    }

    /// Drains the buffered rows of a stream in strictly increasing key
    /// order, ready for emission.
    pub(crate) fn take_changes(&mut self, stream_id: &StreamId) -> Vec<ChangeEvent> {
        match self.streams.get_mut(stream_id) {
            Some(chunk) => std::mem::take(&mut chunk.rows).into_values().collect_vec(),
            None => Vec::new(),
        }
    }

    pub(crate) fn scanned(&self, stream_id: &StreamId) -> Option<Bytes> {
        self.streams
            .get(stream_id)
            .and_then(|chunk| chunk.scanned.clone())
    }

    pub(crate) fn complete(&self, stream_id: &StreamId) -> bool {
        self.streams
            .get(stream_id)
            .is_some_and(|chunk| chunk.complete)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::source::SourceMetadata;
    use crate::tuple::{encode_tuple, Element};

    fn key(id: i64) -> Bytes {
        Bytes::from(encode_tuple(&[Element::Int(id)]))
    }

    fn event(op: ChangeOp, id: i64, value: &str) -> ChangeEvent {
        let row = json!({"id": id, "v": value});
        let row = row.as_object().unwrap().clone();
        ChangeEvent {
            operation: op,
            source: SourceMetadata {
                schema: "public".to_owned(),
                table: "t".to_owned(),
                ..Default::default()
            },
            row_key: key(id),
            before: matches!(op, ChangeOp::Update | ChangeOp::Delete).then(|| row.clone()),
            after: matches!(op, ChangeOp::Insert | ChangeOp::Update).then_some(row),
        }
    }

    fn stream() -> StreamId {
        StreamId::new("public", "t")
    }

    fn ids(results: &mut ResultSet) -> Vec<i64> {
        results
            .take_changes(&stream())
            .iter()
            .map(|event| event.after.as_ref().unwrap()["id"].as_i64().unwrap())
            .collect_vec()
    }

    #[test]
    fn test_buffer_and_drain_in_key_order() {
        let mut results = ResultSet::new(2);
        results
            .buffer(&stream(), vec![event(ChangeOp::Insert, 1, "a"), event(ChangeOp::Insert, 2, "b")])
            .unwrap();
        assert!(!results.complete(&stream()));
        assert_eq!(results.scanned(&stream()), Some(key(2)));
        assert_eq!(results.streams(), vec![stream()]);
        assert_eq!(ids(&mut results), vec![1, 2]);
    }

    #[test]
    fn test_short_chunk_marks_complete() {
        let mut results = ResultSet::new(4);
        results
            .buffer(&stream(), vec![event(ChangeOp::Insert, 7, "x")])
            .unwrap();
        assert!(results.complete(&stream()));
        let mut empty = ResultSet::new(4);
        empty.buffer(&stream(), vec![]).unwrap();
        assert!(empty.complete(&stream()));
        assert_eq!(empty.scanned(&stream()), None);
    }

    #[test]
    fn test_buffer_rejects_unordered_chunks() {
        let mut results = ResultSet::new(1);
        results
            .buffer(&stream(), vec![event(ChangeOp::Insert, 5, "a")])
            .unwrap();
        assert_matches!(
            results.buffer(&stream(), vec![event(ChangeOp::Insert, 5, "b")]),
            Err(CaptureError::ChunkOrder { .. })
        );
        assert_matches!(
            results.buffer(&stream(), vec![event(ChangeOp::Insert, 4, "c")]),
            Err(CaptureError::ChunkOrder { .. })
        );
        // Strictly ascending continuation is fine.
        results
            .buffer(&stream(), vec![event(ChangeOp::Insert, 6, "d")])
            .unwrap();
    }

    #[test]
    fn test_patch_replaces_and_inserts_within_region() {
        let mut results = ResultSet::new(3);
        results
            .buffer(
                &stream(),
                vec![event(ChangeOp::Insert, 1, "a"), event(ChangeOp::Insert, 4, "d")],
            )
            .unwrap();
        // complete chunk (2 < 3): every patch applies
        results.patch(&stream(), event(ChangeOp::Update, 1, "a2")).unwrap();
        results.patch(&stream(), event(ChangeOp::Insert, 2, "b")).unwrap();
        results.patch(&stream(), event(ChangeOp::Update, 3, "c")).unwrap();
        let changes = results.take_changes(&stream());
        assert_eq!(
            changes
                .iter()
                .map(|event| {
                    let after = event.after.as_ref().unwrap();
                    (after["id"].as_i64().unwrap(), after["v"].as_str().unwrap().to_owned())
                })
                .collect_vec(),
            vec![(1, "a2".to_owned()), (2, "b".to_owned()), (3, "c".to_owned()), (4, "d".to_owned())],
        );
        // Patched rows buffer as inserts with no `before` image.
        assert!(changes.iter().all(|event| event.operation == ChangeOp::Insert));
        assert!(changes.iter().all(|event| event.before.is_none()));
    }

    #[test]
    fn test_patch_delete_suppresses_buffered_row() {
        let mut results = ResultSet::new(2);
        results
            .buffer(
                &stream(),
                vec![event(ChangeOp::Insert, 3, "c"), event(ChangeOp::Insert, 4, "d")],
            )
            .unwrap();
        results.patch(&stream(), event(ChangeOp::Delete, 4, "d")).unwrap();
        // Deleting an absent row is a no-op.
        results.patch(&stream(), event(ChangeOp::Delete, 2, "b")).unwrap();
        assert_eq!(ids(&mut results), vec![3]);
        // The scan still covered key 4, so the cursor must not regress.
        assert_eq!(results.scanned(&stream()), Some(key(4)));
    }

    #[test]
    fn test_patch_beyond_incomplete_chunk_is_dropped() {
        let mut results = ResultSet::new(2);
        results
            .buffer(
                &stream(),
                vec![event(ChangeOp::Insert, 1, "a"), event(ChangeOp::Insert, 2, "b")],
            )
            .unwrap();
        // Key 5 is past the scan boundary and the chunk isn't complete,
        // so a later chunk will observe the row's final state instead.
        results.patch(&stream(), event(ChangeOp::Insert, 5, "e")).unwrap();
        results.patch(&stream(), event(ChangeOp::Delete, 5, "e")).unwrap();
        assert_eq!(ids(&mut results), vec![1, 2]);
    }

    #[test]
    fn test_patch_beyond_complete_chunk_applies() {
        let mut results = ResultSet::new(4);
        results
            .buffer(&stream(), vec![event(ChangeOp::Insert, 1, "a")])
            .unwrap();
        assert!(results.complete(&stream()));
        results.patch(&stream(), event(ChangeOp::Insert, 9, "z")).unwrap();
        assert_eq!(ids(&mut results), vec![1, 9]);
    }

    #[test]
    fn test_patch_without_buffered_stream_fails() {
        let mut results = ResultSet::new(2);
        assert_matches!(
            results.patch(&stream(), event(ChangeOp::Insert, 1, "a")),
            Err(CaptureError::NoResultSet(_))
        );
    }
}
