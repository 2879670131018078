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

//! The capture controller: the state machine driving discovery, backfill
//! and replication into one consistent output stream.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use futures::future::try_join_all;
use itertools::Itertools;
use serde_json::Value;
use thiserror_ext::AsReport;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{Binding, CaptureConfig};
use crate::emit::{CaptureOutput, EmitMessage, Emitter};
use crate::error::{CaptureError, CaptureResult};
use crate::resultset::ResultSet;
use crate::source::{
    ChangeEvent, ChangeOp, DiscoveryInfo, InvalidCursorError, ReplicationEvent, ReplicationStream,
    SourceDatabase,
};
use crate::state::{PersistentState, TableMode, TableState};
use crate::StreamId;

/// The watermark used for the final "tailing" streaming call, which is
/// never expected to be observed.
const NONEXISTENT_WATERMARK: &str = "nonexistent-watermark";
/// After this long without a replication event, log a diagnostic.
const STREAM_IDLE_WARNING: Duration = Duration::from_secs(60);
/// After this long of continuous events, log a progress report.
const STREAM_PROGRESS_INTERVAL: Duration = Duration::from_secs(60);
/// The column of the watermarks table holding the watermark value.
const WATERMARK_COLUMN: &str = "watermark";

/// A generic capture: backfilling preexisting table contents while tailing
/// the replication log, and emitting documents and state checkpoints. All
/// database-specific behavior is delegated to the [`SourceDatabase`].
pub struct Capture<D: SourceDatabase, O: CaptureOutput> {
    /// Map from fully-qualified stream IDs to the corresponding bindings.
    pub bindings: HashMap<StreamId, Binding>,
    /// State resumed from the last checkpoint and emitted as updates.
    pub state: PersistentState,
    pub output: O,
    pub database: D,
    pub config: CaptureConfig,
}

impl<D: SourceDatabase, O: CaptureOutput> Capture<D, O> {
    /// Runs the capture until it fails or `shutdown` is canceled. In
    /// practice a healthy capture tails replication indefinitely, so this
    /// only ever returns an error; checkpoints emitted before the error
    /// remain valid and the next run resumes from them.
    pub async fn run(self, shutdown: CancellationToken) -> CaptureResult<()> {
        let Capture {
            bindings,
            state,
            mut output,
            database,
            config,
        } = self;

        // Start the emit worker first and notify the runtime that we're
        // up; output serialization proceeds in parallel with everything
        // below, and the worker must drain before run() returns.
        output
            .ready()
            .await
            .context("error notifying runtime of readiness")?;
        let indices = bindings
            .iter()
            .map(|(stream_id, binding)| (stream_id.clone(), binding.index))
            .collect();
        let emitter = Emitter::start(output, indices);

        let mut runner = Runner {
            database,
            bindings,
            state,
            config,
            discovery: HashMap::new(),
            emitter,
            shutdown,
        };
        let result = runner.run().await;
        match (result, runner.emitter.finish().await) {
            (Err(error), _) => Err(error),
            (Ok(()), drain) => drain,
        }
    }
}

/// The controller task's working set. Mutated only from `run`'s task; the
/// emit queue is the single channel to the worker.
struct Runner<D: SourceDatabase> {
    database: D,
    bindings: HashMap<StreamId, Binding>,
    state: PersistentState,
    config: CaptureConfig,
    discovery: HashMap<StreamId, DiscoveryInfo>,
    emitter: Emitter,
    shutdown: CancellationToken,
}

impl<D: SourceDatabase> Runner<D> {
    async fn run(&mut self) -> CaptureResult<()> {
        // Discovery runs once and the result is cached: it drives state
        // reconciliation at startup and table activation below.
        tracing::info!("discovering tables");
        self.discovery = self
            .cancellable(self.database.discover_tables())
            .await?
            .context("error discovering database tables")?;

        self.update_state().await?;

        let cursor = self.state.cursor.clone();
        let mut replication = match self
            .cancellable(self.database.replication_stream(cursor))
            .await?
        {
            Ok(stream) => stream,
            Err(error) => {
                if error.downcast_ref::<InvalidCursorError>().is_some() {
                    // The server no longer has our resume point. Wipe the
                    // persisted state so the next run backfills from
                    // scratch, and surface a descriptive error.
                    tracing::warn!(
                        error = %format!("{:#}", error),
                        "persisted replication cursor is gone, resetting state",
                    );
                    self.emit(EmitMessage::Reset).await?;
                    return Err(CaptureError::InvalidCursor(error));
                }
                return Err(error.context("error creating replication stream").into());
            }
        };

        let result = self.run_with_stream(&mut replication).await;

        // The stream gets closed on every exit path, success or not.
        match replication.close().await {
            Ok(()) => result,
            Err(close_error) => {
                let close_error =
                    CaptureError::Database(close_error.context("error closing replication stream"));
                match result {
                    Ok(()) => Err(close_error),
                    Err(error) => {
                        tracing::warn!(error = %close_error.as_report(), "error closing replication stream");
                        Err(error)
                    }
                }
            }
        }
    }

    async fn run_with_stream(&mut self, replication: &mut D::Replication) -> CaptureResult<()> {
        // Activate replication for every stream which was already begun
        // in a previous run, plus the watermarks table, then start.
        let active = self
            .state
            .streams
            .iter()
            .filter(|(_, state)| {
                matches!(state.mode, TableMode::Backfill | TableMode::Active)
            })
            .map(|(stream_id, state)| {
                (
                    stream_id.clone(),
                    state.key_columns.clone(),
                    state.metadata.clone(),
                )
            })
            .collect_vec();
        for (stream_id, key_columns, metadata) in active {
            self.activate_table(replication, &stream_id, &key_columns, metadata.as_ref())
                .await?;
        }
        let watermarks = self.database.watermarks_table();
        let Some(info) = self.discovery.get(&watermarks) else {
            return Err(CaptureError::MissingWatermarksTable(watermarks));
        };
        replication
            .activate_table(&watermarks, &info.primary_key, info, None)
            .await
            .with_context(|| format!("error activating table {:?}", watermarks))?;
        replication
            .start_replication()
            .await
            .context("error starting replication")?;

        // Perform an initial catch-up stream-to-watermark before
        // transitioning any Pending streams into the Backfill state. This
        // ensures a given stream only ever observes replication events
        // which occur *after* the capture was started.
        let watermark = Uuid::new_v4().to_string();
        self.write_watermark(&watermark).await?;
        self.stream_to_watermark(replication, &watermark, None)
            .await?;
        for stream_id in self.state.streams_in_mode(TableMode::Pending) {
            tracing::info!(stream = %stream_id, "activating replication for stream");
            let Some(state) = self.state.streams.get_mut(&stream_id) else {
                continue;
            };
            state.mode = TableMode::Backfill;
            state.dirty = true;
            let key_columns = state.key_columns.clone();
            let metadata = state.metadata.clone();
            self.activate_table(replication, &stream_id, &key_columns, metadata.as_ref())
                .await?;
        }

        // Transition streams from Backfill to Active if backfilling is
        // skipped by policy. Combined with the Pending->Backfill logic
        // above this may take a newly-added stream through
        // Pending->Backfill->Active, but it can also terminate a
        // partially-completed backfill if the capture was restarted with a
        // changed configuration after the backfill began.
        for stream_id in self.state.streams_in_mode(TableMode::Backfill) {
            if self.database.should_backfill(&stream_id) {
                continue;
            }
            if let Some(state) = self.state.streams.get_mut(&stream_id) {
                if state.scanned.is_none() {
                    tracing::info!(stream = %stream_id, "skipping backfill for stream");
                } else {
                    tracing::info!(
                        stream = %stream_id,
                        scanned = ?state.scanned,
                        "terminating backfill early for stream",
                    );
                }
                state.mode = TableMode::Active;
                state.scanned = None;
                state.dirty = true;
            }
        }

        // Backfill any tables which require it. Each pass streams
        // replication up to a fresh watermark (patching events into the
        // chunks scanned by the previous pass), emits those chunks, and
        // then scans the next ones.
        let mut results: Option<ResultSet> = None;
        while !self.state.streams_in_mode(TableMode::Backfill).is_empty() {
            let watermark = Uuid::new_v4().to_string();
            self.write_watermark(&watermark).await?;
            self.stream_to_watermark(replication, &watermark, results.as_mut())
                .await?;
            if let Some(buffered) = results.take() {
                self.emit_buffered(buffered).await?;
            }
            results = Some(self.backfill_streams().await?);
        }
        tracing::debug!("finished backfilling tables");

        // Once there is no more backfilling to do, just stream changes
        // forever and emit state checkpoints on every transaction commit.
        self.stream_to_watermark(replication, NONEXISTENT_WATERMARK, None)
            .await
    }

    /// Reconciles the persisted stream states against the current set of
    /// bindings, then emits a checkpoint of the result.
    async fn update_state(&mut self) -> CaptureResult<()> {
        // Streams may be added to the catalog at various times. Initialize
        // state entries for new streams, and sanity-check the primary key
        // configuration while we're at it.
        let bound = self.bindings.keys().cloned().sorted().collect_vec();
        for stream_id in &bound {
            let binding = &self.bindings[stream_id];
            let Some(info) = self.discovery.get(stream_id) else {
                return Err(CaptureError::TableNotDiscovered(stream_id.clone()));
            };

            // Select the backfill key from the first available source, in
            // order of priority: the resource-config override, then the
            // collection key, then (as a fallback which shouldn't be
            // reachable anymore) the discovered primary key.
            tracing::debug!(
                stream = %stream_id,
                resource = ?binding.resource.primary_key,
                collection = ?binding.collection_key,
                discovery = ?info.primary_key,
                "selecting primary key",
            );
            let primary_key = if !binding.resource.primary_key.is_empty() {
                tracing::debug!(stream = %stream_id, key = ?binding.resource.primary_key, "using resource primary key");
                binding.resource.primary_key.clone()
            } else if !binding.collection_key.is_empty() {
                let key = binding
                    .collection_key
                    .iter()
                    .map(|pointer| pointer.trim_start_matches('/').to_owned())
                    .collect_vec();
                tracing::debug!(stream = %stream_id, key = ?key, "using collection primary key");
                key
            } else if !info.primary_key.is_empty() {
                tracing::warn!(stream = %stream_id, key = ?info.primary_key, "using discovery primary key -- this is DEPRECATED and also shouldn't be possible");
                info.primary_key.clone()
            } else {
                return Err(CaptureError::MissingPrimaryKey(stream_id.clone()));
            };

            if primary_key != info.primary_key {
                tracing::warn!(
                    stream = %stream_id,
                    backfill_key = ?primary_key,
                    database_key = ?info.primary_key,
                    "primary key for backfill differs from database table primary key",
                );
            }

            // Initialize the stream if it isn't already, and error out if
            // it was previously initialized with a different key.
            let reinitialize = match self.state.streams.get(stream_id) {
                None => true,
                Some(state) if state.mode == TableMode::Ignore => true,
                Some(state) => {
                    if state.key_columns != primary_key {
                        return Err(CaptureError::KeyColumnsChanged {
                            stream: stream_id.clone(),
                            selected: primary_key,
                            initialized: state.key_columns.clone(),
                        });
                    }
                    false
                }
            };
            if reinitialize {
                self.state
                    .streams
                    .insert(stream_id.clone(), TableState::pending(primary_key));
            }
        }

        // Likewise streams may be removed from the catalog. The state
        // entry is retained in Ignore mode, so re-adding the stream later
        // is an explicit fresh start.
        let unbound = self
            .state
            .streams
            .keys()
            .filter(|stream_id| !self.bindings.contains_key(*stream_id))
            .cloned()
            .collect_vec();
        for stream_id in unbound {
            tracing::info!(stream = %stream_id, "stream removed from catalog");
            self.state.streams.insert(stream_id, TableState::ignored());
        }

        // Emitting the new state here isn't strictly necessary, but it
        // makes the emitted sequence of state updates a lot more readable.
        self.emit_state().await
    }

    /// Consumes replication events until observing the commit of our own
    /// write of `watermark`. Change events on backfilled regions are
    /// forwarded; events racing the in-flight chunks are patched into
    /// `results`; flush events checkpoint.
    async fn stream_to_watermark(
        &mut self,
        replication: &mut D::Replication,
        watermark: &str,
        mut results: Option<&mut ResultSet>,
    ) -> CaptureResult<()> {
        tracing::info!(watermark, "streaming to watermark");
        let watermarks_table = self.database.watermarks_table();
        let tailing = watermark == NONEXISTENT_WATERMARK;
        let mut watermark_reached = false;

        let mut event_count = 0u64;
        let mut next_progress = Instant::now() + STREAM_PROGRESS_INTERVAL;

        loop {
            // Wait for the next event, surfacing idleness as a diagnostic:
            // a warning while we expect to catch up to a watermark, merely
            // informational while tailing. During backfills no single
            // stream-to-watermark call should sit idle this long, so if
            // one does that's very useful information.
            let event = loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(CaptureError::Canceled),
                    next = tokio::time::timeout(STREAM_IDLE_WARNING, replication.next_event()) => {
                        match next {
                            Ok(event) => break event.context("error reading replication event")?,
                            Err(_) if tailing => {
                                tracing::info!(timeout = ?STREAM_IDLE_WARNING, "replication stream idle");
                            }
                            Err(_) => {
                                tracing::warn!(timeout = ?STREAM_IDLE_WARNING, "replication stream idle");
                            }
                        }
                    }
                }
            };
            let Some(event) = event else {
                // The stream closed without reaching the watermark.
                break;
            };

            event_count += 1;
            if Instant::now() >= next_progress {
                tracing::info!(count = event_count, "replication stream progress");
                next_progress = Instant::now() + STREAM_PROGRESS_INTERVAL;
            }

            match event {
                // Flush events update the checkpointed cursor and trigger
                // a state update. The commit after the target watermark
                // also ends the loop.
                ReplicationEvent::Flush { cursor } => {
                    self.state.cursor = cursor;
                    self.emit_state().await?;
                    if watermark_reached {
                        return Ok(());
                    }
                }
                // Metadata events only update the per-table metadata and
                // dirty flag; the new metadata goes out with the next
                // state checkpoint.
                ReplicationEvent::Metadata {
                    stream_id,
                    metadata,
                } => {
                    if let Some(state) = self.state.streams.get_mut(&stream_id) {
                        tracing::trace!(stream = %stream_id, "stream metadata changed");
                        state.metadata = Some(metadata);
                        state.dirty = true;
                    }
                }
                ReplicationEvent::Change(event) => {
                    let stream_id = event.stream_id();

                    // Note when the expected watermark is finally
                    // observed; the subsequent commit exits the loop.
                    if stream_id == watermarks_table && event.operation != ChangeOp::Delete {
                        let actual = event
                            .after
                            .as_ref()
                            .and_then(|after| after.get(WATERMARK_COLUMN))
                            .and_then(Value::as_str);
                        tracing::debug!(expected = watermark, actual, "watermark change");
                        if actual == Some(watermark) {
                            watermark_reached = true;
                        }
                    }

                    match self.state.streams.get(&stream_id).map(|state| state.mode) {
                        // Events on ignored (or untracked) tables are
                        // dropped; this also keeps watermark writes out of
                        // the output.
                        None | Some(TableMode::Ignore) => {
                            tracing::debug!(stream = %stream_id, op = ?event.operation, "ignoring stream");
                        }
                        Some(TableMode::Active) => self.emit_change(event).await?,
                        Some(TableMode::Backfill) => {
                            // While a table is being backfilled, events on
                            // rows at or before the scan cursor are
                            // emitted, while events past it are patched
                            // (or dropped) into the buffered result set.
                            let scanned = self
                                .state
                                .streams
                                .get(&stream_id)
                                .and_then(|state| state.scanned.clone());
                            if event.row_key.as_ref() <= scanned.as_deref().unwrap_or_default() {
                                self.emit_change(event).await?;
                            } else {
                                match results.as_deref_mut() {
                                    Some(results) => results.patch(&stream_id, event)?,
                                    None => {
                                        return Err(CaptureError::NoResultSet(stream_id));
                                    }
                                }
                            }
                        }
                        Some(mode) => {
                            return Err(CaptureError::InvalidStreamMode {
                                stream: stream_id,
                                mode,
                            });
                        }
                    }
                }
            }
        }

        if self.shutdown.is_cancelled() {
            return Err(CaptureError::Canceled);
        }
        if tailing {
            Err(CaptureError::ReplicationClosed)
        } else {
            Err(CaptureError::ReplicationClosedEarly)
        }
    }

    /// Emits the buffered results of one backfill pass and advances each
    /// stream's scan cursor (or retires the stream to Active when its
    /// table is exhausted).
    async fn emit_buffered(&mut self, mut results: ResultSet) -> CaptureResult<()> {
        for stream_id in results.streams() {
            for event in results.take_changes(&stream_id) {
                self.emit_change(event).await?;
            }

            let complete = results.complete(&stream_id);
            let scanned = results.scanned(&stream_id);
            if let Some(state) = self.state.streams.get_mut(&stream_id) {
                if complete {
                    state.mode = TableMode::Active;
                    state.scanned = None;
                } else {
                    state.scanned = scanned;
                }
                tracing::trace!(stream = %stream_id, "stream mode/cursor changed");
                state.dirty = true;
            }
        }

        // The global cursor was advanced by the watermark's commit event
        // and the per-stream scan cursors just above, so checkpoint.
        self.emit_state().await
    }

    /// Scans the next chunk of every stream still backfilling into a
    /// fresh result set. Chunks for different streams are fetched
    /// concurrently; their results funnel back into the controller task
    /// before merging with replication events.
    async fn backfill_streams(&mut self) -> CaptureResult<ResultSet> {
        let streams = self.state.streams_in_mode(TableMode::Backfill);
        tracing::info!(streams = ?streams, "backfilling streams");
        let mut results = ResultSet::new(self.config.backfill_chunk_size);

        let mut scans = Vec::with_capacity(streams.len());
        for stream_id in &streams {
            let Some(state) = self.state.streams.get(stream_id) else {
                continue;
            };
            let Some(info) = self.discovery.get(stream_id) else {
                return Err(CaptureError::TableNotDiscovered(stream_id.clone()));
            };
            let database = &self.database;
            scans.push(async move {
                let events = database
                    .scan_table_chunk(info, &state.key_columns, state.scanned.as_deref())
                    .await
                    .with_context(|| format!("error scanning table {:?}", stream_id))?;
                Ok::<_, CaptureError>((stream_id.clone(), state.scanned.clone(), events))
            });
        }
        let chunks = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(CaptureError::Canceled),
            chunks = try_join_all(scans) => chunks?,
        };

        for (stream_id, scanned, events) in chunks {
            if let Some(first) = events.first() {
                // The database must always return rows whose serialized
                // key is greater than the previous cursor value; together
                // with the ordering check in the result set this keeps
                // the scan cursor strictly increasing.
                if scanned
                    .as_deref()
                    .is_some_and(|scanned| first.row_key.as_ref() <= scanned)
                {
                    return Err(CaptureError::ScanKeyOrder {
                        stream: stream_id,
                        last: scanned,
                        next: first.row_key.clone(),
                    });
                }
            }
            results.buffer(&stream_id, events)?;
        }
        Ok(results)
    }

    async fn activate_table(
        &mut self,
        replication: &mut D::Replication,
        stream_id: &StreamId,
        key_columns: &[String],
        metadata: Option<&Value>,
    ) -> CaptureResult<()> {
        let Some(info) = self.discovery.get(stream_id) else {
            return Err(CaptureError::TableNotDiscovered(stream_id.clone()));
        };
        replication
            .activate_table(stream_id, key_columns, info, metadata)
            .await
            .with_context(|| format!("error activating table {:?}", stream_id))?;
        Ok(())
    }

    async fn write_watermark(&mut self, watermark: &str) -> CaptureResult<()> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(CaptureError::Canceled),
            result = self.database.write_watermark(watermark) => {
                result.context("error writing next watermark")?;
                Ok(())
            }
        }
    }

    async fn emit_change(&mut self, event: ChangeEvent) -> CaptureResult<()> {
        self.emit(EmitMessage::Change(event)).await
    }

    /// Emits a checkpoint containing only the streams which changed since
    /// the previous one; the runtime merges it with prior state.
    async fn emit_state(&mut self) -> CaptureResult<()> {
        let checkpoint = self.state.checkpoint();
        self.emit(EmitMessage::State(checkpoint)).await
    }

    async fn emit(&mut self, message: EmitMessage) -> CaptureResult<()> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(CaptureError::Canceled),
            result = self.emitter.emit(message) => result,
        }
    }

    async fn cancellable<T>(
        &self,
        operation: impl std::future::Future<Output = T>,
    ) -> CaptureResult<T> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(CaptureError::Canceled),
            value = operation => Ok(value),
        }
    }
}
