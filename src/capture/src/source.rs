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

//! The capability set a database backend supplies to the capture engine:
//! table discovery, chunked backfill scans, watermark writes, and the
//! logical replication stream itself. The engine only ever talks to these
//! traits, so backends for different databases are interchangeable.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::StreamId;

/// The operation described by a change event, serialized with the short
/// codes embedded in every output document's `_meta.op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    #[serde(rename = "c")]
    Insert,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
}

/// Provenance of a change event. The common fields below appear in every
/// document's `_meta.source`; driver-specific fields (a LSN, a GTID, a
/// resume token position) travel in `extra` and are flattened alongside
/// them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Unix timestamp (in millis) at which the change was committed.
    #[serde(rename = "ts_ms", default, skip_serializing_if = "Option::is_none")]
    pub ts_ms: Option<i64>,
    /// The schema/namespace in which the change occurred.
    pub schema: String,
    /// True when the record was produced by a backfill scan rather than
    /// observed via replication.
    #[serde(default, skip_serializing_if = "is_false")]
    pub snapshot: bool,
    /// The table in which the change occurred.
    pub table: String,
    /// The driver-defined replication cursor at which the change was
    /// committed. Not serialized; drivers expose a readable form of it
    /// under a driver-specific name in `extra`.
    #[serde(skip)]
    pub cursor: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A single row-level change, produced either by a backfill scan or by
/// the replication stream.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub operation: ChangeOp,
    pub source: SourceMetadata,
    /// The key columns of the affected row, serialized with the tuple
    /// codec. This is both the backfill resume cursor and the merge key
    /// between scanned rows and replication events.
    pub row_key: Bytes,
    /// The previous row contents. Present for updates and deletes.
    pub before: Option<Map<String, Value>>,
    /// The new row contents. Present for inserts and updates.
    pub after: Option<Map<String, Value>>,
}

impl ChangeEvent {
    pub fn stream_id(&self) -> StreamId {
        StreamId::new(&self.source.schema, &self.source.table)
    }
}

/// One event from the logical replication log.
#[derive(Debug, Clone)]
pub enum ReplicationEvent {
    Change(ChangeEvent),
    /// A transactional commit boundary. The cursor is an opaque
    /// driver-defined pointer into the replication log (LSN, GTID, resume
    /// token, ...); a state checkpoint is emitted right after each flush.
    Flush { cursor: String },
    /// A driver-produced per-table metadata blob which must be persisted
    /// alongside the table's state and handed back on restart.
    Metadata {
        stream_id: StreamId,
        metadata: Value,
    },
}

/// Everything discovery reports about one table.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryInfo {
    pub schema: String,
    pub table: String,
    /// False for views and other non-table relations, which cannot be
    /// captured.
    pub base_table: bool,
    pub primary_key: Vec<String>,
    pub columns: BTreeMap<String, ColumnInfo>,
}

impl DiscoveryInfo {
    pub fn stream_id(&self) -> StreamId {
        StreamId::new(&self.schema, &self.table)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ColumnInfo {
    pub name: String,
    pub nullable: bool,
    /// The database-specific column type, opaque to the engine.
    pub data_type: Value,
}

/// Drivers return this from [`SourceDatabase::replication_stream`] (as the
/// root of their error chain) when the persisted cursor no longer exists
/// on the server. The controller reacts by emitting a reset checkpoint so
/// that the next run performs a fresh backfill.
#[derive(Debug, thiserror::Error)]
#[error("replication cursor {cursor:?} is no longer available")]
pub struct InvalidCursorError {
    pub cursor: String,
}

/// The database-specific half of a capture. All methods are invoked
/// sequentially from the controller task, except that `scan_table_chunk`
/// may be called concurrently for different streams within one backfill
/// pass; implementations need no further thread-safety.
#[async_trait]
pub trait SourceDatabase: Send + Sync {
    type Replication: ReplicationStream;

    /// Returns metadata about every table visible to the capture,
    /// including the watermarks table.
    async fn discover_tables(&self) -> anyhow::Result<HashMap<StreamId, DiscoveryInfo>>;

    /// Reads the next backfill chunk of up to the configured chunk size,
    /// containing rows whose serialized key is strictly greater than
    /// `resume_key` (or from the start of the table when absent), as
    /// snapshot-flagged insert events in key order.
    ///
    /// A result shorter than the configured chunk size signals that the
    /// table is exhausted, so implementations must never return short
    /// chunks for any other reason.
    async fn scan_table_chunk(
        &self,
        info: &DiscoveryInfo,
        key_columns: &[String],
        resume_key: Option<&[u8]>,
    ) -> anyhow::Result<Vec<ChangeEvent>>;

    /// Opens the replication stream at `cursor`, or from scratch when the
    /// cursor is empty.
    async fn replication_stream(&self, cursor: String) -> anyhow::Result<Self::Replication>;

    /// Upserts `(slot, watermark)` into the watermarks table. The write
    /// must itself be visible in the replication stream; the engine
    /// recognizes its own writes by the watermark text.
    async fn write_watermark(&self, watermark: &str) -> anyhow::Result<()>;

    /// The fully-qualified stream ID of the watermarks table.
    fn watermarks_table(&self) -> StreamId;

    /// Policy hook: returning false skips (or early-terminates) the
    /// backfill of a stream, transitioning it straight to active tailing.
    fn should_backfill(&self, stream_id: &StreamId) -> bool;

    /// Post-processes a single row value before it is emitted. The
    /// default is the identity; drivers override it to fix up values
    /// whose natural decoding isn't what the collection schema expects.
    fn translate_record_field(
        &self,
        _column: Option<&ColumnInfo>,
        value: Value,
    ) -> anyhow::Result<Value> {
        Ok(value)
    }

    /// Maps a discovered column to the JSON schema type it is advertised
    /// as. Only consulted by the discovery surface; the default passes
    /// the driver's opaque type blob through unchanged.
    fn translate_db_to_json_type(&self, column: &ColumnInfo) -> anyhow::Result<Value> {
        Ok(column.data_type.clone())
    }
}

/// A driver's connection to the database's logical replication log.
#[async_trait]
pub trait ReplicationStream: Send {
    /// Registers a table for tailing. Must be called before
    /// `start_replication` for every stream being captured, and is also
    /// called for the watermarks table.
    async fn activate_table(
        &mut self,
        stream_id: &StreamId,
        key_columns: &[String],
        info: &DiscoveryInfo,
        metadata: Option<&Value>,
    ) -> anyhow::Result<()>;

    async fn start_replication(&mut self) -> anyhow::Result<()>;

    /// Yields the next replication event, or `None` once the stream has
    /// closed. Only ever polled from the single controller task, but the
    /// future must be cancel-safe: dropping it mid-poll (for idle
    /// diagnostics or shutdown) must not discard an event.
    async fn next_event(&mut self) -> anyhow::Result<Option<ReplicationEvent>>;

    async fn close(&mut self) -> anyhow::Result<()>;
}
