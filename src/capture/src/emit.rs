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

//! The asynchronous emit pipeline.
//!
//! A bounded queue decouples output serialization from capture processing:
//! the controller enqueues change events and state snapshots, and a worker
//! task serializes them and writes them to the runtime in FIFO order.
//! Since checkpoints are only enqueued after their flush event, every
//! document ahead of a checkpoint in the queue belongs to a committed
//! transaction.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::source::{ChangeEvent, ChangeOp, SourceMetadata};
use crate::state::PersistentState;
use crate::{CaptureError, CaptureResult, StreamId};

/// Queue capacity. Assuming change events average ~2kB then 64k * 2kB =
/// 128MB of buffered output at most.
const EMITTER_BUFFER_SIZE: usize = 64 * 1024;

/// The runtime-side sink for captured documents and state checkpoints.
#[async_trait]
pub trait CaptureOutput: Send + 'static {
    /// Notifies the runtime that the capture has started up.
    async fn ready(&mut self) -> anyhow::Result<()>;

    /// Writes one serialized document to the collection bound at `binding`.
    async fn document(&mut self, binding: u32, doc: Bytes) -> anyhow::Result<()>;

    /// Writes a serialized state checkpoint. With `merge` set the consumer
    /// folds it into prior state; without, it replaces the state outright.
    async fn checkpoint(&mut self, state: Bytes, merge: bool) -> anyhow::Result<()>;
}

pub(crate) enum EmitMessage {
    Change(ChangeEvent),
    State(PersistentState),
    /// An empty non-merge checkpoint, wiping the persisted state so the
    /// next run starts from scratch.
    Reset,
}

/// Controller-side handle to the emit worker.
pub(crate) struct Emitter {
    queue: mpsc::Sender<EmitMessage>,
    errors: mpsc::Receiver<CaptureError>,
}

impl Emitter {
    pub(crate) fn start<O: CaptureOutput>(output: O, bindings: HashMap<StreamId, u32>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(EMITTER_BUFFER_SIZE);
        let (error_tx, error_rx) = mpsc::channel(1);
        tokio::spawn(emit_worker(output, bindings, queue_rx, error_tx));
        Self {
            queue: queue_tx,
            errors: error_rx,
        }
    }

    /// Queues a message for the worker, at the same time checking for a
    /// worker error so that output failures cleanly shut down the capture.
    pub(crate) async fn emit(&mut self, message: EmitMessage) -> CaptureResult<()> {
        match self.errors.try_recv() {
            Ok(error) => return Err(error),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => {}
        }
        if self.queue.send(message).await.is_err() {
            // The worker is gone; its exit status is on the error channel.
            return Err(self
                .errors
                .recv()
                .await
                .unwrap_or_else(|| anyhow::anyhow!("emit worker stopped unexpectedly").into()));
        }
        Ok(())
    }

    /// Closes the queue, waits for the worker to drain the remaining
    /// messages, and reports the first error if there was one.
    pub(crate) async fn finish(self) -> CaptureResult<()> {
        let Emitter { queue, mut errors } = self;
        drop(queue);
        let mut result = Ok(());
        while let Some(error) = errors.recv().await {
            if result.is_ok() {
                result = Err(error);
            }
        }
        result
    }
}

async fn emit_worker<O: CaptureOutput>(
    mut output: O,
    bindings: HashMap<StreamId, u32>,
    mut queue: mpsc::Receiver<EmitMessage>,
    errors: mpsc::Sender<CaptureError>,
) {
    while let Some(message) = queue.recv().await {
        if let Err(error) = emit_message(&mut output, &bindings, message).await {
            let _ = errors.send(error).await;
            return;
        }
    }
}

async fn emit_message<O: CaptureOutput>(
    output: &mut O,
    bindings: &HashMap<StreamId, u32>,
    message: EmitMessage,
) -> CaptureResult<()> {
    match message {
        EmitMessage::Change(event) => {
            let stream_id = event.stream_id();
            let Some(&binding) = bindings.get(&stream_id) else {
                return Err(CaptureError::UnknownBinding(stream_id));
            };
            let doc = encode_document(event)?;
            output.document(binding, doc).await.map_err(CaptureError::Database)
        }
        EmitMessage::State(state) => {
            let encoded = serde_json::to_vec(&state)?;
            tracing::trace!(state = %String::from_utf8_lossy(&encoded), "emitting state update");
            output
                .checkpoint(Bytes::from(encoded), true)
                .await
                .map_err(CaptureError::Database)
        }
        EmitMessage::Reset => output
            .checkpoint(Bytes::from_static(b"{}"), false)
            .await
            .map_err(CaptureError::Database),
    }
}

#[derive(Serialize)]
struct DocumentMeta<'a> {
    op: ChangeOp,
    source: &'a SourceMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<Map<String, Value>>,
}

/// Builds the output document for a change event: the row contents (the
/// new ones, or the old ones for a delete) with the provenance envelope
/// attached under `_meta`.
fn encode_document(event: ChangeEvent) -> CaptureResult<Bytes> {
    let ChangeEvent {
        operation,
        source,
        before,
        after,
        ..
    } = event;
    let (record, meta_before) = match operation {
        ChangeOp::Insert => (after, None),
        ChangeOp::Update => (after, before),
        ChangeOp::Delete => (before, None),
    };
    let mut record = record.unwrap_or_else(|| {
        tracing::warn!(op = ?operation, "change event data map is missing");
        Map::new()
    });
    let meta = DocumentMeta {
        op: operation,
        source: &source,
        before: meta_before,
    };
    record.insert("_meta".to_owned(), serde_json::to_value(&meta)?);
    Ok(Bytes::from(serde_json::to_vec(&record)?))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// What a [`TestOutput`] saw, in order.
    #[derive(Debug, Clone)]
    pub(crate) enum Emitted {
        Document { binding: u32, doc: Value },
        Checkpoint { state: Value, merge: bool },
    }

    /// An in-memory runtime sink recording everything it receives.
    #[derive(Clone, Default)]
    pub(crate) struct TestOutput {
        pub(crate) transcript: Arc<Mutex<Vec<Emitted>>>,
        pub(crate) fail_documents: bool,
    }

    impl TestOutput {
        pub(crate) fn transcript(&self) -> Vec<Emitted> {
            self.transcript.lock().unwrap().clone()
        }

        pub(crate) fn documents(&self) -> Vec<(u32, Value)> {
            self.transcript()
                .into_iter()
                .filter_map(|emitted| match emitted {
                    Emitted::Document { binding, doc } => Some((binding, doc)),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn checkpoints(&self) -> Vec<(Value, bool)> {
            self.transcript()
                .into_iter()
                .filter_map(|emitted| match emitted {
                    Emitted::Checkpoint { state, merge } => Some((state, merge)),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl CaptureOutput for TestOutput {
        async fn ready(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn document(&mut self, binding: u32, doc: Bytes) -> anyhow::Result<()> {
            if self.fail_documents {
                anyhow::bail!("document write refused");
            }
            let doc = serde_json::from_slice(&doc)?;
            self.transcript
                .lock()
                .unwrap()
                .push(Emitted::Document { binding, doc });
            Ok(())
        }

        async fn checkpoint(&mut self, state: Bytes, merge: bool) -> anyhow::Result<()> {
            let state = serde_json::from_slice(&state)?;
            self.transcript
                .lock()
                .unwrap()
                .push(Emitted::Checkpoint { state, merge });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use expect_test::expect;
    use serde_json::json;

    use super::testing::{Emitted, TestOutput};
    use super::*;
    use crate::tuple::{encode_tuple, Element};

    fn event(op: ChangeOp, before: Option<Value>, after: Option<Value>) -> ChangeEvent {
        ChangeEvent {
            operation: op,
            source: SourceMetadata {
                ts_ms: Some(1700000000000),
                schema: "public".to_owned(),
                snapshot: false,
                table: "t1".to_owned(),
                cursor: "0/1234".to_owned(),
                extra: Map::new(),
            },
            row_key: Bytes::from(encode_tuple(&[Element::Int(1)])),
            before: before.map(|v| v.as_object().unwrap().clone()),
            after: after.map(|v| v.as_object().unwrap().clone()),
        }
    }

    #[test]
    fn test_insert_document_shape() {
        let doc = encode_document(event(
            ChangeOp::Insert,
            None,
            Some(json!({"id": 1, "v": "a"})),
        ))
        .unwrap();
        expect![[r#"{"_meta":{"op":"c","source":{"schema":"public","table":"t1","ts_ms":1700000000000}},"id":1,"v":"a"}"#]]
            .assert_eq(std::str::from_utf8(&doc).unwrap());
    }

    #[test]
    fn test_update_document_carries_before_in_meta() {
        let doc = encode_document(event(
            ChangeOp::Update,
            Some(json!({"id": 1, "v": "a"})),
            Some(json!({"id": 1, "v": "a2"})),
        ))
        .unwrap();
        expect![[r#"{"_meta":{"before":{"id":1,"v":"a"},"op":"u","source":{"schema":"public","table":"t1","ts_ms":1700000000000}},"id":1,"v":"a2"}"#]]
            .assert_eq(std::str::from_utf8(&doc).unwrap());
    }

    #[test]
    fn test_delete_document_is_the_before_image() {
        let doc = encode_document(event(
            ChangeOp::Delete,
            Some(json!({"id": 1, "v": "a"})),
            None,
        ))
        .unwrap();
        expect![[r#"{"_meta":{"op":"d","source":{"schema":"public","table":"t1","ts_ms":1700000000000}},"id":1,"v":"a"}"#]]
            .assert_eq(std::str::from_utf8(&doc).unwrap());
    }

    #[test]
    fn test_snapshot_flag_serializes_when_set() {
        let mut event = event(ChangeOp::Insert, None, Some(json!({"id": 1})));
        event.source.snapshot = true;
        event.source.ts_ms = None;
        let doc = encode_document(event).unwrap();
        expect![[r#"{"_meta":{"op":"c","source":{"schema":"public","snapshot":true,"table":"t1"}},"id":1}"#]]
            .assert_eq(std::str::from_utf8(&doc).unwrap());
    }

    #[tokio::test]
    async fn test_emitter_routes_documents_and_checkpoints() {
        let output = TestOutput::default();
        let bindings = HashMap::from([(StreamId::new("public", "t1"), 3)]);
        let mut emitter = Emitter::start(output.clone(), bindings);
        emitter
            .emit(EmitMessage::Change(event(
                ChangeOp::Insert,
                None,
                Some(json!({"id": 1})),
            )))
            .await
            .unwrap();
        emitter
            .emit(EmitMessage::State(PersistentState::default()))
            .await
            .unwrap();
        emitter.emit(EmitMessage::Reset).await.unwrap();
        emitter.finish().await.unwrap();

        let transcript = output.transcript();
        assert_eq!(transcript.len(), 3);
        assert_matches!(&transcript[0], Emitted::Document { binding: 3, .. });
        assert_matches!(
            &transcript[1],
            Emitted::Checkpoint { merge: true, state } if state == &json!({"cursor": ""})
        );
        assert_matches!(
            &transcript[2],
            Emitted::Checkpoint { merge: false, state } if state == &json!({})
        );
    }

    #[tokio::test]
    async fn test_worker_error_reaches_the_controller() {
        let output = TestOutput {
            fail_documents: true,
            ..Default::default()
        };
        let bindings = HashMap::from([(StreamId::new("public", "t1"), 0)]);
        let mut emitter = Emitter::start(output, bindings);
        // The first enqueue may succeed before the worker hits the failure;
        // keep emitting until the error surfaces.
        let mut seen = None;
        for _ in 0..16 {
            if let Err(error) = emitter
                .emit(EmitMessage::Change(event(
                    ChangeOp::Insert,
                    None,
                    Some(json!({"id": 1})),
                )))
                .await
            {
                seen = Some(error);
                break;
            }
            tokio::task::yield_now().await;
        }
        let error = match seen {
            Some(error) => error,
            None => emitter.finish().await.unwrap_err(),
        };
        assert!(error.to_string().contains("document write refused"));
    }

    #[tokio::test]
    async fn test_unknown_stream_fails_emission() {
        let output = TestOutput::default();
        let mut emitter = Emitter::start(output, HashMap::new());
        emitter
            .emit(EmitMessage::Change(event(
                ChangeOp::Insert,
                None,
                Some(json!({"id": 1})),
            )))
            .await
            .unwrap();
        assert_matches!(
            emitter.finish().await,
            Err(CaptureError::UnknownBinding(stream)) if stream == StreamId::new("public", "t1")
        );
    }
}
