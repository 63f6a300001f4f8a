//! Pluggable research-data persistence.
//!
//! A [`DataSink`] receives append-only participant records and match
//! assignments plus last-write-wins session metadata. The core never blocks
//! a tick on the sink: handlers enqueue onto a bounded in-memory queue
//! drained by a background writer task, dropping the oldest command (with
//! telemetry) on overflow.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;

use crate::protocol::{ParticipantId, SceneId, SessionId};
use crate::telemetry::{self, TelemetryKind};

/// Storage backend for researcher-facing artifacts.
#[async_trait]
pub trait DataSink: Send + Sync {
    /// Append one participant record to the scene's data log.
    async fn append_participant_data(
        &self,
        scene_id: &SceneId,
        participant_id: &ParticipantId,
        record: serde_json::Value,
    ) -> Result<()>;

    /// Append one formed-group record to the scene's assignment log. This
    /// is the researcher's primary audit artifact.
    async fn write_match_assignment(
        &self,
        scene_id: &SceneId,
        group_record: serde_json::Value,
    ) -> Result<()>;

    /// Persist session metadata, replacing any previous write.
    async fn write_session_metadata(
        &self,
        session_id: &SessionId,
        metadata: serde_json::Value,
    ) -> Result<()>;
}

/// JSON-lines sink rooted at a local directory:
///
/// ```text
/// <root>/<scene_id>/participant_data.jsonl
/// <root>/<scene_id>/assignments.jsonl
/// <root>/sessions/<session_id>.json
/// ```
pub struct JsonLinesSink {
    root: PathBuf,
}

impl JsonLinesSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn scene_dir(&self, scene_id: &SceneId) -> PathBuf {
        self.root.join(sanitize(scene_id.as_str()))
    }

    async fn append_line(&self, path: &Path, value: &serde_json::Value) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(&line).await?;
        Ok(())
    }
}

/// Path components come from researcher config and session ids; keep them
/// filesystem-safe.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl DataSink for JsonLinesSink {
    async fn append_participant_data(
        &self,
        scene_id: &SceneId,
        participant_id: &ParticipantId,
        record: serde_json::Value,
    ) -> Result<()> {
        let enriched = serde_json::json!({
            "participant_id": participant_id,
            "record": record,
        });
        let path = self.scene_dir(scene_id).join("participant_data.jsonl");
        self.append_line(&path, &enriched).await
    }

    async fn write_match_assignment(
        &self,
        scene_id: &SceneId,
        group_record: serde_json::Value,
    ) -> Result<()> {
        let path = self.scene_dir(scene_id).join("assignments.jsonl");
        self.append_line(&path, &group_record).await
    }

    async fn write_session_metadata(
        &self,
        session_id: &SessionId,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let dir = self.root.join("sessions");
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(format!("{}.json", sanitize(session_id.as_str())));
        let body = serde_json::to_vec_pretty(&metadata)?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// One queued persistence command.
#[derive(Debug)]
enum SinkCommand {
    AppendParticipantData {
        scene_id: SceneId,
        participant_id: ParticipantId,
        record: serde_json::Value,
    },
    WriteMatchAssignment {
        scene_id: SceneId,
        group_record: serde_json::Value,
    },
    WriteSessionMetadata {
        session_id: SessionId,
        metadata: serde_json::Value,
    },
}

/// Handle for the non-blocking writer. Cloneable; handlers call the
/// `enqueue_*` methods and return immediately.
#[derive(Clone)]
pub struct SinkWriter {
    inner: Arc<SinkWriterInner>,
}

struct SinkWriterInner {
    sink: Arc<dyn DataSink>,
    queue: Mutex<VecDeque<SinkCommand>>,
    capacity: usize,
    notify: Notify,
    idle: Notify,
    busy: AtomicBool,
    dropped: AtomicU64,
}

impl SinkWriter {
    /// Create the handle and spawn the background writer task.
    pub fn spawn(sink: Arc<dyn DataSink>, capacity: usize) -> Self {
        let writer = Self {
            inner: Arc::new(SinkWriterInner {
                sink,
                queue: Mutex::new(VecDeque::new()),
                capacity: capacity.max(1),
                notify: Notify::new(),
                idle: Notify::new(),
                busy: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        };

        let worker = writer.clone();
        tokio::spawn(async move {
            worker.run().await;
        });

        writer
    }

    pub fn enqueue_participant_data(
        &self,
        scene_id: SceneId,
        participant_id: ParticipantId,
        record: serde_json::Value,
    ) {
        self.push(SinkCommand::AppendParticipantData {
            scene_id,
            participant_id,
            record,
        });
    }

    pub fn enqueue_match_assignment(&self, scene_id: SceneId, group_record: serde_json::Value) {
        self.push(SinkCommand::WriteMatchAssignment {
            scene_id,
            group_record,
        });
    }

    pub fn enqueue_session_metadata(&self, session_id: SessionId, metadata: serde_json::Value) {
        self.push(SinkCommand::WriteSessionMetadata {
            session_id,
            metadata,
        });
    }

    /// Commands dropped to overflow since startup.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn push(&self, command: SinkCommand) {
        {
            let mut queue = match self.inner.queue.lock() {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };
            queue.push_back(command);
            if queue.len() > self.inner.capacity {
                queue.pop_front();
                drop(queue);
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                telemetry::emit(TelemetryKind::SinkOverflow)
                    .details(serde_json::json!({
                        "capacity": self.inner.capacity,
                        "dropped_total": self.dropped_count(),
                    }))
                    .emit();
            }
        }
        self.inner.notify.notify_one();
    }

    fn pop(&self) -> Option<SinkCommand> {
        let mut queue = match self.inner.queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.pop_front()
    }

    fn is_empty(&self) -> bool {
        let queue = match self.inner.queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.is_empty()
    }

    /// Wait until every queued command has been executed. Used by graceful
    /// shutdown, bounded by the caller's timeout.
    pub async fn drain(&self) {
        loop {
            // Register interest before re-checking so a notify between the
            // check and the await is not lost.
            let notified = self.inner.idle.notified();
            if self.is_empty() && !self.inner.busy.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    async fn run(&self) {
        loop {
            match self.pop() {
                Some(command) => {
                    self.inner.busy.store(true, Ordering::Release);
                    if let Err(err) = self.execute(command).await {
                        tracing::warn!(error = %err, "data sink write failed");
                    }
                    self.inner.busy.store(false, Ordering::Release);
                    if self.is_empty() {
                        self.inner.idle.notify_waiters();
                    }
                }
                None => {
                    self.inner.idle.notify_waiters();
                    self.inner.notify.notified().await;
                }
            }
        }
    }

    async fn execute(&self, command: SinkCommand) -> Result<()> {
        match command {
            SinkCommand::AppendParticipantData {
                scene_id,
                participant_id,
                record,
            } => {
                self.inner
                    .sink
                    .append_participant_data(&scene_id, &participant_id, record)
                    .await
            }
            SinkCommand::WriteMatchAssignment {
                scene_id,
                group_record,
            } => {
                self.inner
                    .sink
                    .write_match_assignment(&scene_id, group_record)
                    .await
            }
            SinkCommand::WriteSessionMetadata {
                session_id,
                metadata,
            } => {
                self.inner
                    .sink
                    .write_session_metadata(&session_id, metadata)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn json_lines_sink_appends_participant_records() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::new(dir.path());
        let scene = SceneId::from("coop_game");
        let pid = ParticipantId::from("p1");

        sink.append_participant_data(&scene, &pid, serde_json::json!({"score": 3}))
            .await
            .unwrap();
        sink.append_participant_data(&scene, &pid, serde_json::json!({"score": 5}))
            .await
            .unwrap();

        let contents =
            std::fs::read_to_string(dir.path().join("coop_game/participant_data.jsonl")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["participant_id"], "p1");
        assert_eq!(first["record"]["score"], 3);
    }

    #[tokio::test]
    async fn session_metadata_is_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::new(dir.path());
        let sid = SessionId("sess01".into());

        sink.write_session_metadata(&sid, serde_json::json!({"partial": false}))
            .await
            .unwrap();
        sink.write_session_metadata(&sid, serde_json::json!({"partial": true}))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(dir.path().join("sessions/sess01.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value["partial"], true);
    }

    #[tokio::test]
    async fn writer_drains_queued_commands() {
        let dir = tempfile::tempdir().unwrap();
        let sink: Arc<dyn DataSink> = Arc::new(JsonLinesSink::new(dir.path()));
        let writer = SinkWriter::spawn(sink, 16);

        for i in 0..4 {
            writer.enqueue_match_assignment(
                SceneId::from("scene"),
                serde_json::json!({"group": i}),
            );
        }

        timeout(Duration::from_secs(2), writer.drain())
            .await
            .expect("drain finished");

        let contents =
            std::fs::read_to_string(dir.path().join("scene/assignments.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 4);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_command() {
        struct NullSink;
        #[async_trait]
        impl DataSink for NullSink {
            async fn append_participant_data(
                &self,
                _: &SceneId,
                _: &ParticipantId,
                _: serde_json::Value,
            ) -> Result<()> {
                Ok(())
            }
            async fn write_match_assignment(
                &self,
                _: &SceneId,
                _: serde_json::Value,
            ) -> Result<()> {
                Ok(())
            }
            async fn write_session_metadata(
                &self,
                _: &SessionId,
                _: serde_json::Value,
            ) -> Result<()> {
                Ok(())
            }
        }

        // Fill the queue synchronously before the writer can drain: the
        // oldest entries beyond capacity are dropped and counted.
        let writer = SinkWriter {
            inner: Arc::new(SinkWriterInner {
                sink: Arc::new(NullSink),
                queue: Mutex::new(VecDeque::new()),
                capacity: 2,
                notify: Notify::new(),
                idle: Notify::new(),
                busy: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        };

        for i in 0..5 {
            writer.enqueue_match_assignment(SceneId::from("s"), serde_json::json!({"i": i}));
        }
        assert_eq!(writer.dropped_count(), 3);
    }
}
