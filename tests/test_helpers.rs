//! Shared fixtures for the integration suites: channel-backed clients
//! driven through the wire-level message enums.

// Each integration suite compiles this module separately and uses a
// different subset of it.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use cohort_server::config::{CoreConfig, ExperimentConfig, SceneSpec};
use cohort_server::persistence::JsonLinesSink;
use cohort_server::protocol::{
    ClientMessage, ConnectionId, Globals, ParticipantId, ServerMessage, SessionId,
};
use cohort_server::server::ExperimentServer;

pub struct Harness {
    pub server: Arc<ExperimentServer>,
    pub data_dir: tempfile::TempDir,
}

pub struct Client {
    pub connection_id: ConnectionId,
    pub rx: mpsc::Receiver<Arc<ServerMessage>>,
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub session_token: String,
}

impl Harness {
    pub fn new(experiment: ExperimentConfig) -> Self {
        let data_dir = tempfile::tempdir().expect("tempdir");
        let mut config = CoreConfig::default();
        config.data_dir = data_dir.path().to_string_lossy().to_string();
        let sink = Arc::new(JsonLinesSink::new(data_dir.path()));
        let server = ExperimentServer::new(config, experiment, sink).expect("server boots");
        Self { server, data_dir }
    }

    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<Arc<ServerMessage>>) {
        let (tx, rx) = mpsc::channel(256);
        (self.server.attach_connection(tx), rx)
    }

    /// Register over the wire and collect the admission payload.
    pub async fn register(&self, claimed: Option<&str>) -> Client {
        let (connection_id, mut rx) = self.connect();
        self.server
            .handle_client_message(
                connection_id,
                ClientMessage::Register {
                    claimed_participant_id: claimed.map(ParticipantId::from),
                    session_token: None,
                    globals: Globals::new(),
                },
            )
            .await;

        let config = recv_until(&mut rx, |m| {
            matches!(m, ServerMessage::ExperimentConfig(_))
        })
        .await
        .expect("experiment_config");
        let ServerMessage::ExperimentConfig(payload) = config.as_ref() else {
            unreachable!();
        };

        Client {
            connection_id,
            rx,
            session_id: payload.session_id.clone(),
            participant_id: payload.participant_id.clone(),
            session_token: payload.session_token.clone(),
        }
    }

    pub async fn enqueue(&self, client: &Client) {
        self.server
            .handle_client_message(
                client.connection_id,
                ClientMessage::EnqueueForScene {
                    session_id: client.session_id.clone(),
                    attributes: Globals::new(),
                },
            )
            .await;
    }
}

/// Two-scene experiment: one gym scene, then a static debrief.
pub fn two_player_experiment(mut scene: SceneSpec) -> ExperimentConfig {
    if scene.redirect_url.is_none() {
        scene.redirect_url = Some("https://example.org/sorry".to_string());
    }
    ExperimentConfig {
        experiment_id: "integration".into(),
        scenes: vec![scene, SceneSpec::static_scene("debrief")],
        ..Default::default()
    }
}

pub fn quick_scene(scene_id: &str) -> SceneSpec {
    let mut scene = SceneSpec::gym_scene(scene_id, 2);
    scene.countdown_seconds = 0;
    scene.tick_rate = 10;
    scene
}

pub async fn recv_until(
    rx: &mut mpsc::Receiver<Arc<ServerMessage>>,
    predicate: impl Fn(&ServerMessage) -> bool,
) -> Option<Arc<ServerMessage>> {
    // Long bound: the clock is paused in these tests, so waiting costs
    // nothing but must outlast in-game timers.
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

/// Assert that no matching message arrives within the window.
pub async fn assert_never(
    rx: &mut mpsc::Receiver<Arc<ServerMessage>>,
    window: Duration,
    predicate: impl Fn(&ServerMessage) -> bool,
) {
    let hit = tokio::time::timeout(window, async {
        loop {
            match rx.recv().await {
                Some(message) if predicate(message.as_ref()) => return,
                Some(_) => {}
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(hit.is_err(), "unexpected message arrived");
}
