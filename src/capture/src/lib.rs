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

//! Generic change-data-capture core for SQL database source connectors.
//!
//! The engine reads an initial snapshot ("backfill") of one or more tables
//! while simultaneously tailing the database's logical replication log, and
//! fuses the two into a single ordered stream of change documents plus
//! periodic resumable state checkpoints. Database-specific behavior lives
//! behind the [`SourceDatabase`] and [`ReplicationStream`] traits; the
//! runtime receiving documents and checkpoints is abstracted as
//! [`CaptureOutput`].
//!
//! The interesting part is the watermark interlock: before scanning each
//! backfill chunk the engine writes a unique watermark row into a dedicated
//! table whose writes show up in the replication log. Observing that row in
//! the log proves every change committed before the chunk scan has been
//! seen, so replication events can be either forwarded directly (for
//! already-scanned keys) or patched into the buffered chunk (for keys the
//! scan raced with) without duplication or loss.

use std::fmt;

use serde::{Deserialize, Serialize};

mod capture;
mod config;
mod emit;
mod error;
mod resultset;
mod source;
mod state;
pub mod tuple;

pub use capture::Capture;
pub use config::{Binding, CaptureConfig, CaptureResource};
pub use emit::CaptureOutput;
pub use error::{CaptureError, CaptureResult};
pub use source::{
    ChangeEvent, ChangeOp, ColumnInfo, DiscoveryInfo, InvalidCursorError, ReplicationEvent,
    ReplicationStream, SourceDatabase, SourceMetadata,
};
pub use state::{PersistentState, TableMode, TableState};

/// A fully-qualified stream identifier of the form `namespace.table`,
/// case-normalized to lower case. Streams are totally ordered by byte
/// comparison of this name.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Combines a namespace and a stream name into a dotted identifier
    /// like `public.foo_table`.
    pub fn new(namespace: &str, table: &str) -> Self {
        Self(format!("{}.{}", namespace, table).to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StreamId {
    fn from(id: &str) -> Self {
        Self(id.to_lowercase())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}
