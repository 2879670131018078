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

use serde::{Deserialize, Serialize};

use crate::StreamId;

/// A runtime-side declaration that a particular stream should be captured
/// into a particular collection. The runtime routes emitted documents by
/// the binding index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub index: u32,
    /// The key of the target collection, as JSON pointers into captured
    /// documents.
    #[serde(default)]
    pub collection_key: Vec<String>,
    pub resource: CaptureResource,
}

impl Binding {
    pub fn stream_id(&self) -> StreamId {
        StreamId::new(&self.resource.namespace, &self.resource.stream)
    }
}

/// The per-binding resource configuration identifying one source table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResource {
    pub namespace: String,
    pub stream: String,
    /// Optional override of the key columns used for ordering/chunking
    /// the backfill. Defaults to the collection key.
    #[serde(default)]
    pub primary_key: Vec<String>,
}

/// Engine-level tuning knobs shared between the controller and the
/// backfill scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// The number of rows requested per backfill chunk. Scanners must
    /// return exactly this many rows except on the final chunk of a
    /// table, since a shorter result is what signals end-of-table.
    #[serde(default = "default_backfill_chunk_size")]
    pub backfill_chunk_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backfill_chunk_size: default_backfill_chunk_size(),
        }
    }
}

fn default_backfill_chunk_size() -> usize {
    4096
}
