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

use bytes::Bytes;

use crate::state::TableMode;
use crate::StreamId;

pub type CaptureResult<T, E = CaptureError> = std::result::Result<T, E>;

/// All the ways a capture run can fail. Every variant is fatal for the
/// current run; recovery is process restart plus checkpoint resumption.
/// The engine never retries internally.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("table {0} is a configured binding of this capture, but doesn't exist or isn't visible with current permissions")]
    TableNotDiscovered(StreamId),

    #[error("stream {0}: primary key must be specified")]
    MissingPrimaryKey(StreamId),

    #[error("stream {stream}: primary key {selected:?} doesn't match initialized scan key {initialized:?}")]
    KeyColumnsChanged {
        stream: StreamId,
        selected: Vec<String>,
        initialized: Vec<String>,
    },

    #[error("watermarks table {0} does not exist")]
    MissingWatermarksTable(StreamId),

    #[error("stream {stream}: scan key ordering failure: last={last:?}, next={next:?}")]
    ScanKeyOrder {
        stream: StreamId,
        last: Option<Bytes>,
        next: Bytes,
    },

    #[error("stream {stream}: buffered chunk out of order at key {key:?}")]
    ChunkOrder { stream: StreamId, key: Bytes },

    #[error("table {stream} in invalid mode {mode:?}")]
    InvalidStreamMode { stream: StreamId, mode: TableMode },

    #[error("change event on stream {0} without an active result set")]
    NoResultSet(StreamId),

    #[error("capture output to invalid stream {0}")]
    UnknownBinding(StreamId),

    #[error("replication stream closed")]
    ReplicationClosed,

    #[error("replication stream closed before reaching watermark")]
    ReplicationClosedEarly,

    /// The persisted replication cursor no longer exists on the server.
    /// By the time this is returned a reset checkpoint has already been
    /// emitted, so the next run will backfill from scratch.
    #[error("replication cursor is no longer available")]
    InvalidCursor(#[source] anyhow::Error),

    #[error("capture canceled")]
    Canceled,

    #[error("error serializing record data")]
    Serialize(#[from] serde_json::Error),

    /// A database-side operation failed. The error chain carries the
    /// operation that was being attempted.
    #[error(transparent)]
    Database(#[from] anyhow::Error),
}
