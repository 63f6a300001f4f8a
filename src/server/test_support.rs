//! Shared fixtures for the server submodule tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::{CoreConfig, ExperimentConfig, SceneSpec};
use crate::persistence::JsonLinesSink;
use crate::protocol::{
    ClientMessage, ConnectionId, Globals, ParticipantId, ServerMessage, SessionId,
};

use super::ExperimentServer;

pub(super) struct TestClient {
    pub connection_id: ConnectionId,
    pub rx: mpsc::Receiver<Arc<ServerMessage>>,
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub session_token: String,
}

pub(super) struct TestHarness {
    pub server: Arc<ExperimentServer>,
    _data_dir: tempfile::TempDir,
}

impl TestHarness {
    /// Server with the given scene graph and a throwaway data directory.
    pub fn new(experiment: ExperimentConfig) -> Self {
        Self::with_config(CoreConfig::default(), experiment)
    }

    pub fn with_config(config: CoreConfig, experiment: ExperimentConfig) -> Self {
        let data_dir = tempfile::tempdir().expect("tempdir");
        let mut config = config;
        config.data_dir = data_dir.path().to_string_lossy().to_string();
        let sink = Arc::new(JsonLinesSink::new(data_dir.path()));
        let server = ExperimentServer::new(config, experiment, sink).expect("server");
        Self {
            server,
            _data_dir: data_dir,
        }
    }

    /// Attach a channel-backed connection.
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<Arc<ServerMessage>>) {
        let (tx, rx) = mpsc::channel(256);
        (self.server.attach_connection(tx), rx)
    }

    /// Register a fresh participant and pull the admission messages off the
    /// queue.
    pub async fn register(&self, claimed: Option<&str>) -> TestClient {
        let (connection_id, mut rx) = self.connect();
        self.server
            .handle_register(
                connection_id,
                claimed.map(ParticipantId::from),
                None,
                Globals::new(),
            )
            .await;

        let config = recv_until(&mut rx, |msg| {
            matches!(msg, ServerMessage::ExperimentConfig(_))
        })
        .await
        .expect("experiment_config");
        let ServerMessage::ExperimentConfig(payload) = config.as_ref() else {
            unreachable!();
        };

        TestClient {
            connection_id,
            rx,
            session_id: payload.session_id.clone(),
            participant_id: payload.participant_id.clone(),
            session_token: payload.session_token.clone(),
        }
    }

    /// Register and enqueue into the current (gym) scene.
    pub async fn register_and_enqueue(&self, claimed: Option<&str>) -> TestClient {
        let client = self.register(claimed).await;
        self.server
            .handle_client_message(
                client.connection_id,
                ClientMessage::EnqueueForScene {
                    session_id: client.session_id.clone(),
                    attributes: Globals::new(),
                },
            )
            .await;
        client
    }
}

/// Two-player peer-authoritative gym scene with fast timings for tests.
pub(super) fn quick_gym_scene(scene_id: &str) -> SceneSpec {
    let mut scene = SceneSpec::gym_scene(scene_id, 2);
    scene.countdown_seconds = 0;
    scene.tick_rate = 20;
    scene.redirect_url = Some("https://example.org/full".to_string());
    scene
}

pub(super) fn gym_experiment(scene: SceneSpec) -> ExperimentConfig {
    ExperimentConfig {
        experiment_id: "test".into(),
        scenes: vec![scene, SceneSpec::static_scene("debrief")],
        ..Default::default()
    }
}

/// Receive until a message matches, with a bounded wait.
pub(super) async fn recv_until(
    rx: &mut mpsc::Receiver<Arc<ServerMessage>>,
    predicate: impl Fn(&ServerMessage) -> bool,
) -> Option<Arc<ServerMessage>> {
    // Generous bound: tests run under a paused clock, where waiting is
    // instantaneous but must outlast every in-game timer.
    tokio::time::timeout(Duration::from_secs(300), async {
        loop {
            let message = rx.recv().await?;
            if predicate(message.as_ref()) {
                return Some(message);
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Everything currently sitting in the queue, without waiting.
pub(super) fn drain_now(rx: &mut mpsc::Receiver<Arc<ServerMessage>>) -> Vec<Arc<ServerMessage>> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}
