use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngExt as _;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{CoreConfig, ExperimentConfig, SceneSpec};
use crate::matchmaker::{build_matcher, Matcher};
use crate::persistence::{DataSink, SinkWriter};
use crate::protocol::{
    ConnectionId, ErrorCode, ParticipantId, SceneId, ServerMessage, SessionId, TerminationReason,
};
use crate::registry::Registry;
use crate::stepper::Stepper;

mod connections;
mod dispatch;
mod game_lifecycle;
#[cfg(test)]
mod game_lifecycle_tests;
mod orchestrator;
#[cfg(test)]
mod orchestrator_tests;
mod peer_broker;
#[cfg(test)]
mod test_support;
mod waitroom;

use connections::ConnectionManager;
pub use orchestrator::ScreeningCallback;

type HmacSha256 = Hmac<Sha256>;

/// The coordination core: registry plus the four subsystems (orchestrator,
/// matchmaker/waitroom, game lifecycle, peer broker), each implemented as
/// handler methods in its own submodule.
pub struct ExperimentServer {
    /// Single owner of all entities; handlers receive it by reference.
    registry: Registry,
    /// Live transport connections (outbound queues, ping freshness).
    connections: ConnectionManager,
    config: CoreConfig,
    /// Immutable researcher-supplied scene tree, validated at startup.
    experiment: ExperimentConfig,
    /// Matcher per gym scene, resolved once from config.
    matchers: HashMap<SceneId, Arc<dyn Matcher>>,
    /// Steppers for server-authoritative scenes, registered by the host.
    steppers: std::sync::RwLock<HashMap<SceneId, Arc<dyn Stepper>>>,
    /// Screening callbacks by `screening.callback_id`.
    screening_callbacks: std::sync::RwLock<HashMap<String, Arc<dyn ScreeningCallback>>>,
    /// Non-blocking research data writer.
    sink: SinkWriter,
    /// HMAC key for session tokens.
    token_key: Vec<u8>,
    /// Cleared when graceful shutdown begins; no registrations after that.
    accepting: AtomicBool,
    /// Cancelled at shutdown; every spawned timer observes it.
    shutdown: CancellationToken,
    /// Weak self-handle used to spawn grace/waitroom/tick tasks from
    /// handler methods.
    self_ref: std::sync::Weak<ExperimentServer>,
}

impl ExperimentServer {
    pub fn new(
        config: CoreConfig,
        experiment: ExperimentConfig,
        sink: Arc<dyn DataSink>,
    ) -> anyhow::Result<Arc<Self>> {
        experiment.validate()?;

        let matchers = experiment
            .scenes
            .iter()
            .map(|scene| (scene.scene_id.clone(), build_matcher(&scene.matcher)))
            .collect();

        let token_key = match &config.session_secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                tracing::warn!(
                    "no session_secret configured; generating an ephemeral key \
                     (session tokens will not survive a restart)"
                );
                let mut key = vec![0u8; 32];
                rand::rng().fill(&mut key[..]);
                key
            }
        };

        let sink_writer = SinkWriter::spawn(sink, config.sink_queue_capacity);

        Ok(Arc::new_cyclic(|self_ref| Self {
            registry: Registry::new(),
            connections: ConnectionManager::new(),
            config,
            experiment,
            matchers,
            steppers: std::sync::RwLock::new(HashMap::new()),
            screening_callbacks: std::sync::RwLock::new(HashMap::new()),
            sink: sink_writer,
            token_key,
            accepting: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            self_ref: self_ref.clone(),
        }))
    }

    /// Strong self-handle for spawning background tasks from handlers.
    /// Only fails during teardown, when spawning is pointless anyway.
    pub(crate) fn strong(&self) -> Option<Arc<ExperimentServer>> {
        self.self_ref.upgrade()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn experiment(&self) -> &ExperimentConfig {
        &self.experiment
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register a server-authoritative simulator for a scene.
    pub fn register_stepper(&self, scene_id: SceneId, stepper: Arc<dyn Stepper>) {
        if let Ok(mut steppers) = self.steppers.write() {
            steppers.insert(scene_id, stepper);
        }
    }

    pub(crate) fn stepper_for(&self, scene_id: &SceneId) -> Option<Arc<dyn Stepper>> {
        self.steppers.read().ok()?.get(scene_id).cloned()
    }

    /// Register a researcher screening callback under its configured id.
    pub fn register_screening_callback(&self, id: String, callback: Arc<dyn ScreeningCallback>) {
        if let Ok(mut callbacks) = self.screening_callbacks.write() {
            callbacks.insert(id, callback);
        }
    }

    pub(crate) fn screening_callback(&self, id: &str) -> Option<Arc<dyn ScreeningCallback>> {
        self.screening_callbacks.read().ok()?.get(id).cloned()
    }

    pub(crate) fn matcher_for(&self, scene_id: &SceneId) -> Arc<dyn Matcher> {
        self.matchers
            .get(scene_id)
            .cloned()
            .unwrap_or_else(|| build_matcher("fifo"))
    }

    pub(crate) fn scene_at(&self, index: usize) -> Option<&SceneSpec> {
        self.experiment.scene_at(index)
    }

    /// Effective disconnect grace for a scene (scene override, then the
    /// game/non-game core defaults).
    pub(crate) fn grace_for(&self, scene: &SceneSpec) -> Duration {
        let secs = scene.grace_seconds.unwrap_or(if scene.is_multiplayer_game() {
            self.config.game_grace_secs
        } else {
            self.config.grace_secs
        });
        Duration::from_secs(secs)
    }

    // -------------------------------------------------------------------
    // Transport attach/detach (called by the websocket adapter)
    // -------------------------------------------------------------------

    /// Attach a transport connection and hand back its id.
    pub fn attach_connection(&self, sender: mpsc::Sender<Arc<ServerMessage>>) -> ConnectionId {
        let connection_id = self.connections.register(sender);
        crate::telemetry::emit(crate::telemetry::TelemetryKind::ConnectionOpened)
            .details(serde_json::json!({"connection_id": connection_id.to_string()}))
            .emit();
        connection_id
    }

    // -------------------------------------------------------------------
    // Outbound helpers
    // -------------------------------------------------------------------

    pub(crate) fn send_to_connection(&self, connection_id: &ConnectionId, message: ServerMessage) {
        self.connections.send(connection_id, Arc::new(message));
    }

    pub(crate) fn send_shared(&self, connection_id: &ConnectionId, message: Arc<ServerMessage>) {
        self.connections.send(connection_id, message);
    }

    pub(crate) fn send_error(
        &self,
        connection_id: &ConnectionId,
        message: String,
        error_code: ErrorCode,
    ) {
        self.send_to_connection(
            connection_id,
            ServerMessage::Error {
                message,
                error_code: Some(error_code),
            },
        );
    }

    /// Send to a participant's live connection, if any. Returns whether a
    /// connection existed.
    pub(crate) async fn send_to_participant(
        &self,
        participant_id: &ParticipantId,
        message: ServerMessage,
    ) -> bool {
        let connection = {
            let table = self.registry.participants.read().await;
            table.get(participant_id).and_then(|p| p.connection)
        };
        match connection {
            Some(connection_id) => {
                self.send_to_connection(&connection_id, message);
                true
            }
            None => false,
        }
    }

    /// Resolve an inbound session reference. Unknown sessions get an
    /// `invalid_session` reply and the connection is closed.
    pub(crate) async fn resolve_session(
        &self,
        connection_id: &ConnectionId,
        session_id: &SessionId,
    ) -> Option<ParticipantId> {
        let table = self.registry.participants.read().await;
        match table.participant_of_session(session_id) {
            Some(participant_id) => Some(participant_id.clone()),
            None => {
                drop(table);
                tracing::warn!(%connection_id, %session_id, "message referenced unknown session");
                self.send_to_connection(
                    connection_id,
                    ServerMessage::InvalidSession {
                        error_code: ErrorCode::UnknownSession,
                    },
                );
                self.connections.remove(connection_id);
                None
            }
        }
    }

    // -------------------------------------------------------------------
    // Session tokens
    // -------------------------------------------------------------------

    /// HMAC-SHA256 over `session_id:participant_id`, base64url. Binds a
    /// restore attempt to the session it claims.
    pub(crate) fn sign_session_token(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
    ) -> String {
        // Key length is unconstrained for HMAC; new_from_slice cannot fail.
        let mut mac = match HmacSha256::new_from_slice(&self.token_key) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(session_id.as_str().as_bytes());
        mac.update(b":");
        mac.update(participant_id.as_str().as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    pub(crate) fn verify_session_token(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        presented: &str,
    ) -> bool {
        let expected = self.sign_session_token(session_id, participant_id);
        expected.as_bytes().ct_eq(presented.as_bytes()).into()
    }

    // -------------------------------------------------------------------
    // Background tasks & process lifecycle
    // -------------------------------------------------------------------

    /// Background prune loop: reaps connections whose ping went stale,
    /// treating them as transport-level disconnects.
    pub async fn maintenance_task(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.maintenance_interval_secs.max(1));
        let timeout = Duration::from_secs(self.config.ping_timeout_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for connection_id in self.connections.collect_stale(timeout) {
                tracing::info!(%connection_id, "reaping connection with stale ping");
                self.handle_connection_drop(connection_id).await;
            }
        }
    }

    /// Graceful shutdown: stop accepting registrations, terminate every
    /// active game with a `server_shutdown` reason, and drain the sink for
    /// a bounded interval.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        self.shutdown.cancel();

        let games: Vec<_> = {
            let table = self.registry.games.read().await;
            table.all().cloned().collect()
        };
        for game in games {
            self.terminate_game(&game, TerminationReason::ServerShutdown)
                .await;
        }

        let drain = Duration::from_secs(self.config.shutdown_drain_secs.max(1));
        if tokio::time::timeout(drain, self.sink.drain()).await.is_err() {
            tracing::warn!(
                dropped = self.sink.dropped_count(),
                "sink drain timed out during shutdown"
            );
        }
    }

    /// Read-only counters for the admin snapshot endpoint.
    pub async fn admin_state(&self) -> serde_json::Value {
        let (participants, sessions) = {
            let table = self.registry.participants.read().await;
            (table.participant_count(), table.session_count())
        };
        let waiting = {
            let rooms = self.registry.waiting.lock().await;
            rooms.total_waiting()
        };
        let games = {
            let table = self.registry.games.read().await;
            table.active_count()
        };
        serde_json::json!({
            "experiment_id": self.experiment.experiment_id,
            "participants": participants,
            "sessions": sessions,
            "waiting": waiting,
            "active_games": games,
            "connections": self.connections.active_count(),
            "accepting": self.is_accepting(),
        })
    }
}
