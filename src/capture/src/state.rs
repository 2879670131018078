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

use std::collections::BTreeMap;

use bytes::Bytes;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::StreamId;

/// Lifecycle mode of a captured table.
///
/// Streams transition `Pending -> Backfill -> Active`, or directly
/// `Pending -> Active` when backfill is skipped by policy, or from any
/// mode to `Ignore` when the binding is removed. No transition goes
/// backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableMode {
    /// The table is being deliberately ignored.
    Ignore,
    /// The table is new, and will start being backfilled soon.
    Pending,
    /// The table's rows are being backfilled and replication events are
    /// only emitted for the already-backfilled portion.
    Backfill,
    /// The table finished backfilling and replication events are emitted
    /// for the entire table.
    Active,
}

/// The serializable, resumable capture state of a single table. It is
/// mostly concerned with the backfill scanning process and the transition
/// from that to pure replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableState {
    pub mode: TableMode,
    /// The "primary key" used for ordering/chunking the backfill scan.
    pub key_columns: Vec<String>,
    /// The serialized row-key tuple of the last row which has been
    /// backfilled. Replication events are only emitted for rows <= this
    /// value while backfilling is in progress.
    #[serde(default, with = "base64_bytes")]
    pub scanned: Option<Bytes>,
    /// An arbitrary amount of database-specific metadata which needs to be
    /// tracked persistently on a per-table basis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Set whenever the table state changes, and cleared whenever a state
    /// checkpoint is emitted. Never serialized.
    #[serde(skip)]
    pub(crate) dirty: bool,
}

impl TableState {
    pub(crate) fn pending(key_columns: Vec<String>) -> Self {
        Self {
            mode: TableMode::Pending,
            key_columns,
            scanned: None,
            metadata: None,
            dirty: true,
        }
    }

    pub(crate) fn ignored() -> Self {
        Self {
            mode: TableMode::Ignore,
            key_columns: Vec::new(),
            scanned: None,
            metadata: None,
            dirty: true,
        }
    }
}

/// The part of the capture's state which is serialized and emitted in
/// checkpoints, and resumed from after a restart.
///
/// Checkpoints are partial updates: a checkpoint contains only the streams
/// whose state changed since the previous one, and the consumer merges it
/// with prior state. An empty object `{}` is a valid full reset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentState {
    /// The replication cursor of the most recent flush event.
    #[serde(default)]
    pub cursor: String,
    /// A mapping from stream IDs (`<namespace>.<table>`) to table state.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub streams: BTreeMap<StreamId, TableState>,
}

impl PersistentState {
    /// Basic sanity-checking after a state has been parsed from JSON. More
    /// detailed checks are performed during state reconciliation against
    /// the current bindings.
    pub fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// The IDs of all streams currently in a particular mode, in sorted
    /// order for reproducibility.
    pub fn streams_in_mode(&self, mode: TableMode) -> Vec<StreamId> {
        self.streams
            .iter()
            .filter(|(_, state)| state.mode == mode)
            .map(|(id, _)| id.clone())
            .collect_vec()
    }

    /// Takes a checkpoint containing only the streams which changed since
    /// the last one, clearing their dirty flags in the process.
    pub(crate) fn checkpoint(&mut self) -> PersistentState {
        let mut streams = BTreeMap::new();
        for (stream_id, state) in &mut self.streams {
            if state.dirty {
                state.dirty = false;
                streams.insert(stream_id.clone(), state.clone());
            }
        }
        PersistentState {
            cursor: self.cursor.clone(),
            streams,
        }
    }
}

/// The `scanned` cursor goes out in checkpoints as base64, or null once
/// the stream no longer needs one.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Bytes>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => STANDARD.encode(bytes).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Bytes>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|text| {
                STANDARD
                    .decode(text.as_bytes())
                    .map(Bytes::from)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use expect_test::expect;

    use super::*;

    fn test_state() -> PersistentState {
        let mut state = PersistentState {
            cursor: "0000000a".to_owned(),
            streams: BTreeMap::new(),
        };
        state.streams.insert(
            StreamId::new("public", "foo"),
            TableState {
                mode: TableMode::Backfill,
                key_columns: vec!["id".to_owned()],
                scanned: Some(Bytes::from_static(b"\x15\x02")),
                metadata: None,
                dirty: true,
            },
        );
        state.streams.insert(
            StreamId::new("public", "bar"),
            TableState {
                mode: TableMode::Active,
                key_columns: vec!["id".to_owned(), "seq".to_owned()],
                scanned: None,
                metadata: Some(serde_json::json!({"schema": 3})),
                dirty: false,
            },
        );
        state
    }

    #[test]
    fn test_checkpoint_wire_format() {
        let state = test_state();
        expect![[r#"{"cursor":"0000000a","streams":{"public.bar":{"mode":"Active","key_columns":["id","seq"],"scanned":null,"metadata":{"schema":3}},"public.foo":{"mode":"Backfill","key_columns":["id"],"scanned":"FQI="}}}"#]]
            .assert_eq(&serde_json::to_string(&state).unwrap());
    }

    #[test]
    fn test_state_round_trip() {
        let state = test_state();
        let encoded = serde_json::to_vec(&state).unwrap();
        let decoded: PersistentState = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.cursor, state.cursor);
        assert_eq!(decoded.streams.len(), 2);
        let foo = &decoded.streams[&StreamId::new("public", "foo")];
        assert_eq!(foo.mode, TableMode::Backfill);
        assert_eq!(foo.scanned.as_deref(), Some(&b"\x15\x02"[..]));
        assert!(!foo.dirty);
        let bar = &decoded.streams[&StreamId::new("public", "bar")];
        assert_eq!(bar.metadata, Some(serde_json::json!({"schema": 3})));
    }

    #[test]
    fn test_empty_state_is_a_valid_reset() {
        let decoded: PersistentState = serde_json::from_str("{}").unwrap();
        assert_eq!(decoded.cursor, "");
        assert!(decoded.streams.is_empty());
        assert!(decoded.validate().is_ok());
        // And an empty state with no streams serializes without the map.
        assert_eq!(serde_json::to_string(&PersistentState::default()).unwrap(), r#"{"cursor":""}"#);
    }

    #[test]
    fn test_streams_in_mode_sorted() {
        let mut state = PersistentState::default();
        for name in ["zeta", "alpha", "mid"] {
            state
                .streams
                .insert(StreamId::new("public", name), TableState::pending(vec!["id".to_owned()]));
        }
        state
            .streams
            .insert(StreamId::new("public", "done"), TableState::ignored());
        assert_eq!(
            state.streams_in_mode(TableMode::Pending),
            vec![
                StreamId::new("public", "alpha"),
                StreamId::new("public", "mid"),
                StreamId::new("public", "zeta"),
            ],
        );
        assert_eq!(
            state.streams_in_mode(TableMode::Ignore),
            vec![StreamId::new("public", "done")],
        );
        assert!(state.streams_in_mode(TableMode::Active).is_empty());
    }

    #[test]
    fn test_checkpoint_takes_only_dirty_streams() {
        let mut state = test_state();
        let checkpoint = state.checkpoint();
        assert_eq!(checkpoint.cursor, "0000000a");
        assert_eq!(
            checkpoint.streams.keys().cloned().collect_vec(),
            vec![StreamId::new("public", "foo")],
        );
        // Emission cleared the dirty flag, so the next checkpoint is empty.
        assert!(state.checkpoint().streams.is_empty());
    }
}
