use std::collections::HashMap;

use chrono::Utc;

use crate::protocol::{
    ActivateScenePayload, ConnectionId, ErrorCode, ExperimentConfigPayload, Globals,
    ParticipantEvent, ParticipantId, ParticipantState, SceneId, ScreeningContext, ServerMessage,
    SessionId, SessionRestoredPayload, TerminationReason,
};
use crate::registry::{Participant, ScreeningOutcome, Session};
use crate::telemetry::{emit, TelemetryKind};

use super::ExperimentServer;

/// Researcher-supplied admission hook consulted after the built-in rules.
/// Failure is treated as admit (fail-open) and logged.
pub trait ScreeningCallback: Send + Sync {
    fn evaluate(
        &self,
        participant_id: &ParticipantId,
        context: &ScreeningContext,
    ) -> anyhow::Result<bool>;
}

impl ExperimentServer {
    /// Bind a connection to a participant: restore an existing session or
    /// admit a fresh one.
    pub async fn handle_register(
        &self,
        connection_id: ConnectionId,
        claimed_participant_id: Option<ParticipantId>,
        session_token: Option<String>,
        client_globals: Globals,
    ) {
        if !self.is_accepting() {
            self.send_to_connection(
                &connection_id,
                ServerMessage::Error {
                    message: "The study server is shutting down.".to_string(),
                    error_code: Some(ErrorCode::ServerShuttingDown),
                },
            );
            return;
        }

        let exists = if let Some(pid) = &claimed_participant_id {
            let table = self.registry.participants.read().await;
            table.contains(pid)
        } else {
            false
        };

        if exists {
            // Restoration path; claimed_participant_id is Some by the check
            // above.
            if let Some(pid) = claimed_participant_id {
                self.restore_session(connection_id, pid, session_token)
                    .await;
            }
        } else {
            let participant_id = claimed_participant_id.unwrap_or_else(ParticipantId::generate);
            self.admit_participant(connection_id, participant_id, client_globals)
                .await;
        }
    }

    /// Admission of a never-seen participant: capacity check, session
    /// creation, config delivery, first activation.
    async fn admit_participant(
        &self,
        connection_id: ConnectionId,
        participant_id: ParticipantId,
        client_globals: Globals,
    ) {
        let screening_required = self.experiment.screening.required;

        let payload = {
            let mut table = self.registry.participants.write().await;

            if let Some(cap) = self.experiment.participant_cap {
                if table.session_count() >= cap {
                    drop(table);
                    tracing::info!(%participant_id, cap, "admission denied: participant cap reached");
                    emit(TelemetryKind::AdmissionDenied)
                        .participant(&participant_id)
                        .details(serde_json::json!({"cap": cap}))
                        .emit();
                    self.send_to_connection(
                        &connection_id,
                        ServerMessage::Error {
                            message: "The experiment is currently full.".to_string(),
                            error_code: Some(ErrorCode::AdmissionDenied),
                        },
                    );
                    self.connections.remove(&connection_id);
                    return;
                }
            }

            table.insert(Participant::new(participant_id.clone()));
            table.bind_connection(&participant_id, connection_id);

            let mut session = Session::new(
                participant_id.clone(),
                self.experiment.scenes.clone(),
                client_globals,
            );
            if let Some(scene) = session.current_scene() {
                session
                    .metadata
                    .scene_entries
                    .push((scene.scene_id.clone(), Utc::now()));
            }
            let session_id = session.id.clone();
            table.insert_session(session);

            ExperimentConfigPayload {
                session_id: session_id.clone(),
                participant_id: participant_id.clone(),
                session_token: self.sign_session_token(&session_id, &participant_id),
                scene_count: self.experiment.scenes.len(),
                screening_required,
                ice_servers: self.config.ice_servers.clone(),
                runtime_preload: self.experiment.runtime_preload.clone(),
            }
        };

        emit(TelemetryKind::ParticipantRegistered)
            .participant(&participant_id)
            .session(&payload.session_id)
            .emit();

        self.send_to_connection(
            &connection_id,
            ServerMessage::ExperimentConfig(Box::new(payload)),
        );

        // Screening gates the first activation; otherwise the participant
        // lands directly on scene 0.
        if !screening_required {
            self.activate_current_scene(&participant_id).await;
        }
    }

    /// Rebind an existing participant: evict any older connection, cancel
    /// the grace timer, replay session and game context.
    async fn restore_session(
        &self,
        connection_id: ConnectionId,
        participant_id: ParticipantId,
        session_token: Option<String>,
    ) {
        let (evicted, restored, config_payload) = {
            let mut table = self.registry.participants.write().await;

            let Some(session) = table.session_of(&participant_id) else {
                // Participant exists but was never admitted; treat like a
                // fresh connect.
                drop(table);
                self.admit_participant(connection_id, participant_id, Globals::new())
                    .await;
                return;
            };
            let session_id = session.id.clone();

            match &session_token {
                Some(token) => {
                    if !self.verify_session_token(&session_id, &participant_id, token) {
                        drop(table);
                        tracing::warn!(%participant_id, "session token mismatch on restore");
                        self.send_to_connection(
                            &connection_id,
                            ServerMessage::InvalidSession {
                                error_code: ErrorCode::InvalidSessionToken,
                            },
                        );
                        self.connections.remove(&connection_id);
                        return;
                    }
                }
                None => {
                    // Not a security boundary; allow but record it.
                    tracing::debug!(%participant_id, "restore without session token");
                }
            }

            let evicted = table.bind_connection(&participant_id, connection_id);
            if let Some(participant) = table.get_mut(&participant_id) {
                participant.cancel_grace();
            }

            let session = match table.session_of(&participant_id) {
                Some(session) => session,
                None => return,
            };
            let scene_id = session
                .current_scene()
                .map(|s| s.scene_id.clone())
                .unwrap_or_else(|| SceneId::from(""));
            let state = table
                .get(&participant_id)
                .map(|p| p.state)
                .unwrap_or_default();

            let restored = SessionRestoredPayload {
                session_id: session.id.clone(),
                participant_id: participant_id.clone(),
                scene_index: session.current_scene_index,
                scene_id,
                state,
                scene_state: session.scene_state.clone(),
            };
            let config_payload = ExperimentConfigPayload {
                session_id: session.id.clone(),
                participant_id: participant_id.clone(),
                session_token: self.sign_session_token(&session.id, &participant_id),
                scene_count: self.experiment.scenes.len(),
                screening_required: false,
                ice_servers: self.config.ice_servers.clone(),
                runtime_preload: self.experiment.runtime_preload.clone(),
            };
            (evicted, restored, config_payload)
        };

        if let Some(old_connection) = evicted {
            emit(TelemetryKind::DuplicateSessionEvicted)
                .participant(&participant_id)
                .session(&restored.session_id)
                .emit();
            self.send_to_connection(
                &old_connection,
                ServerMessage::DuplicateSession {
                    message: "This session was opened somewhere else.".to_string(),
                },
            );
            self.connections.remove(&old_connection);
        }

        emit(TelemetryKind::SessionRestored)
            .participant(&participant_id)
            .session(&restored.session_id)
            .emit();

        let was_game_ended = restored.state == ParticipantState::GameEnded;
        self.send_to_connection(
            &connection_id,
            ServerMessage::SessionRestored(Box::new(restored)),
        );
        self.send_to_connection(
            &connection_id,
            ServerMessage::ExperimentConfig(Box::new(config_payload)),
        );

        // A live game gets its assignment replayed and buffered signaling
        // flushed; a scene that terminated during the disconnect advances.
        if self.replay_game_context(&participant_id, connection_id).await {
            return;
        }
        if was_game_ended {
            self.advance_past_terminated_scene(&participant_id).await;
            return;
        }

        self.activate_current_scene(&participant_id).await;
    }

    /// If the participant is in a live game, re-send `player_assigned`,
    /// clear the disconnect mark, and flush parked signaling. Returns true
    /// when a live game was found.
    async fn replay_game_context(
        &self,
        participant_id: &ParticipantId,
        connection_id: ConnectionId,
    ) -> bool {
        let game = {
            let table = self.registry.games.read().await;
            table.game_of(participant_id)
        };
        let Some(game) = game else {
            return false;
        };
        let Some(player_index) = game.group.index_of(participant_id) else {
            return false;
        };
        // A game lingering in its teardown drain is already over; treat it
        // as absent so the session advances instead of replaying.
        if game.state.lock().await.status == crate::registry::GameStatus::Done {
            return false;
        }

        self.activate_current_scene(participant_id).await;
        self.send_to_connection(
            &connection_id,
            ServerMessage::PlayerAssigned(Box::new(crate::protocol::PlayerAssignedPayload {
                game_id: game.id,
                scene_id: game.scene_id.clone(),
                player_index,
                seed: game.seed,
                expected_player_count: game.expected_player_count,
            })),
        );

        let parked = {
            let mut state = game.state.lock().await;
            state.disconnected.remove(&player_index);
            state
                .peer
                .as_mut()
                .map(|peer| peer.drain_signaling(player_index))
                .unwrap_or_default()
        };
        for message in parked {
            self.send_to_connection(&connection_id, message);
        }
        true
    }

    /// The participant's game ended while they were away: move them onto
    /// the next scene so the experiment can continue.
    async fn advance_past_terminated_scene(&self, participant_id: &ParticipantId) {
        let advanced = {
            let mut table = self.registry.participants.write().await;
            let Some(participant) = table.get_mut(participant_id) else {
                return;
            };
            if !participant.transition(ParticipantEvent::Advance) {
                return;
            }
            table
                .session_of_mut(participant_id)
                .and_then(Session::advance_scene)
        };

        if advanced.is_some() {
            self.flush_session_metadata(participant_id).await;
            self.activate_current_scene(participant_id).await;
        }
    }

    /// Evaluate device/browser/latency rules plus the researcher callback.
    pub async fn handle_submit_screening(
        &self,
        connection_id: ConnectionId,
        session_id: SessionId,
        context: ScreeningContext,
    ) {
        let Some(participant_id) = self.resolve_session(&connection_id, &session_id).await else {
            return;
        };

        let rules = &self.experiment.screening;
        let mut admitted = true;
        let mut reason: Option<String> = None;

        if !rules.allowed_browsers.is_empty() {
            let browser = context.browser.clone().unwrap_or_default().to_lowercase();
            if !rules
                .allowed_browsers
                .iter()
                .any(|allowed| browser.contains(&allowed.to_lowercase()))
            {
                admitted = false;
                reason = Some("This browser is not supported for this study.".to_string());
            }
        }

        if admitted && rules.block_mobile {
            let device = context.device.clone().unwrap_or_default().to_lowercase();
            if device.contains("mobile") || device.contains("tablet") || device.contains("phone") {
                admitted = false;
                reason = Some("Mobile devices are not supported for this study.".to_string());
            }
        }

        if admitted {
            if let (Some(max), Some(measured)) = (rules.max_server_rtt_ms, context.measured_rtt_ms)
            {
                if measured > max {
                    admitted = false;
                    reason = Some("Your connection latency is too high for this study.".to_string());
                }
            }
        }

        if admitted {
            if let Some(callback_id) = &rules.callback_id {
                match self.screening_callback(callback_id) {
                    Some(callback) => match callback.evaluate(&participant_id, &context) {
                        Ok(true) => {}
                        Ok(false) => {
                            admitted = false;
                            reason = Some("You are not eligible for this study.".to_string());
                        }
                        Err(err) => {
                            // Fail-open: this is a research tool, not a
                            // security boundary.
                            tracing::warn!(
                                %participant_id,
                                callback_id = %callback_id,
                                error = %err,
                                "screening callback failed; admitting"
                            );
                        }
                    },
                    None => {
                        tracing::warn!(
                            %participant_id,
                            callback_id = %callback_id,
                            "screening callback not registered; admitting"
                        );
                    }
                }
            }
        }

        {
            let mut table = self.registry.participants.write().await;
            if let Some(participant) = table.get_mut(&participant_id) {
                participant.rtt_to_server_ms = context.measured_rtt_ms;
                if !admitted {
                    participant.end_session("screening denied");
                }
            }
            if let Some(session) = table.session_mut(&session_id) {
                session.metadata.screening = Some(ScreeningOutcome {
                    admitted,
                    reason: reason.clone(),
                    decided_at: Utc::now(),
                });
            }
        }

        emit(TelemetryKind::ScreeningDecision)
            .participant(&participant_id)
            .session(&session_id)
            .details(serde_json::json!({"admitted": admitted, "reason": reason.clone()}))
            .emit();
        if !admitted {
            emit(TelemetryKind::AdmissionDenied)
                .participant(&participant_id)
                .session(&session_id)
                .emit();
        }

        self.send_to_connection(
            &connection_id,
            ServerMessage::ScreeningResult {
                admitted,
                reason,
            },
        );
        self.flush_session_metadata(&participant_id).await;

        if admitted {
            self.activate_current_scene(&participant_id).await;
        }
    }

    /// Move the session forward one scene. Replays are no-ops when the
    /// acknowledged `scene_index` trails the session's current scene.
    pub async fn handle_advance(
        &self,
        connection_id: ConnectionId,
        session_id: SessionId,
        scene_index: Option<usize>,
    ) {
        let Some(participant_id) = self.resolve_session(&connection_id, &session_id).await else {
            return;
        };

        if let Some(acknowledged) = scene_index {
            let table = self.registry.participants.read().await;
            let current = table
                .session_of(&participant_id)
                .map(|s| s.current_scene_index);
            drop(table);
            match current {
                Some(current) if acknowledged != current => {
                    tracing::debug!(
                        %participant_id,
                        acknowledged,
                        current,
                        "ignoring replayed advance"
                    );
                    return;
                }
                _ => {}
            }
        }

        enum Outcome {
            Activated,
            Finished,
            Rejected(&'static str),
        }

        let (outcome, prior_scene_was_game) = {
            let mut table = self.registry.participants.write().await;
            let Some(participant) = table.get_mut(&participant_id) else {
                return;
            };

            match participant.state {
                ParticipantState::Ended => (Outcome::Rejected("session already ended"), false),
                ParticipantState::InWaitroom => {
                    (Outcome::Rejected("cannot advance while queued"), false)
                }
                ParticipantState::InGame => {
                    (Outcome::Rejected("cannot advance during a game"), false)
                }
                state @ (ParticipantState::Idle | ParticipantState::GameEnded) => {
                    let Some(session) = table.session_of(&participant_id) else {
                        return;
                    };
                    let prior_scene_was_game = session
                        .current_scene()
                        .is_some_and(crate::config::SceneSpec::is_multiplayer_game);

                    if session.is_on_final_scene() {
                        if let Some(participant) = table.get_mut(&participant_id) {
                            participant.transition(ParticipantEvent::FinalSceneAcknowledged);
                        }
                        (Outcome::Finished, prior_scene_was_game)
                    } else {
                        if state == ParticipantState::GameEnded {
                            if let Some(participant) = table.get_mut(&participant_id) {
                                participant.transition(ParticipantEvent::Advance);
                            }
                        }
                        match table.session_of_mut(&participant_id).and_then(Session::advance_scene)
                        {
                            Some(_) => (Outcome::Activated, prior_scene_was_game),
                            None => (Outcome::Finished, prior_scene_was_game),
                        }
                    }
                }
            }
        };

        // Interactive-scene exit releases any peer state immediately so no
        // stale events reach later scenes.
        if prior_scene_was_game {
            self.release_peer_state(&participant_id).await;
        }

        match outcome {
            Outcome::Rejected(why) => {
                tracing::warn!(%participant_id, why, "advance rejected");
            }
            Outcome::Finished => {
                emit(TelemetryKind::StateTransition)
                    .participant(&participant_id)
                    .session(&session_id)
                    .details(serde_json::json!({"to": "ended"}))
                    .emit();
                self.flush_session_metadata(&participant_id).await;
            }
            Outcome::Activated => {
                emit(TelemetryKind::SceneAdvanced)
                    .participant(&participant_id)
                    .session(&session_id)
                    .emit();
                self.flush_session_metadata(&participant_id).await;
                self.activate_current_scene(&participant_id).await;
            }
        }
    }

    /// Merge client-shipped globals. Reserved keys stay server-owned; the
    /// `focus` and `rtt_ms` keys update live participant telemetry.
    pub async fn handle_sync_globals(
        &self,
        connection_id: ConnectionId,
        session_id: SessionId,
        globals: Globals,
    ) {
        let Some(participant_id) = self.resolve_session(&connection_id, &session_id).await else {
            return;
        };

        let focus = globals.get("focus").and_then(serde_json::Value::as_bool);
        let rtt = globals
            .get("rtt_ms")
            .and_then(serde_json::Value::as_u64)
            .and_then(|v| u32::try_from(v).ok());

        let mut table = self.registry.participants.write().await;
        if let Some(participant) = table.get_mut(&participant_id) {
            if let Some(focus) = focus {
                participant.in_focus = focus;
            }
            if let Some(rtt) = rtt {
                participant.rtt_to_server_ms = Some(rtt);
            }
        }
        if let Some(session) = table.session_mut(&session_id) {
            session.merge_globals(globals);
        }
    }

    /// Persist form data collected from a static scene, filtered by the
    /// scene's declared element ids.
    pub async fn handle_static_scene_data(
        &self,
        connection_id: ConnectionId,
        session_id: SessionId,
        scene_id: SceneId,
        mut elements: HashMap<String, serde_json::Value>,
    ) {
        let Some(participant_id) = self.resolve_session(&connection_id, &session_id).await else {
            return;
        };

        let Some((_, scene)) = self.experiment.scene_by_id(&scene_id) else {
            tracing::warn!(%participant_id, %scene_id, "static data for unknown scene dropped");
            return;
        };

        let declared = &scene.data_collection.elements;
        if !declared.is_empty() {
            elements.retain(|key, _| declared.contains(key));
        }

        // Scene-local data survives reconnects: a restored client gets its
        // last submission back in `session_restored`.
        {
            let mut table = self.registry.participants.write().await;
            if let Some(session) = table.session_mut(&session_id) {
                if session
                    .current_scene()
                    .is_some_and(|current| current.scene_id == scene_id)
                {
                    session.scene_state = serde_json::json!({ "elements": elements.clone() });
                }
            }
        }

        self.sink.enqueue_participant_data(
            scene_id,
            participant_id,
            serde_json::json!({
                "kind": "static_scene_data",
                "elements": elements,
                "collected_at": Utc::now(),
            }),
        );
    }

    /// Heartbeat: refresh the ping timestamp and echo `pong`.
    pub async fn handle_ping(&self, connection_id: ConnectionId) {
        self.connections.record_ping(&connection_id);
        self.send_to_connection(&connection_id, ServerMessage::Pong);
    }

    /// Transport detach. The participant row survives; a grace timer
    /// decides whether this becomes a dropout.
    pub async fn handle_connection_drop(&self, connection_id: ConnectionId) {
        self.connections.remove(&connection_id);

        let dropped = {
            let mut table = self.registry.participants.write().await;
            let Some(participant_id) = table.unbind_connection(&connection_id) else {
                return;
            };

            let Some(participant) = table.get_mut(&participant_id) else {
                return;
            };
            if participant.state == ParticipantState::Ended {
                (participant_id, None)
            } else {
                let grace_token = tokio_util::sync::CancellationToken::new();
                participant.cancel_grace();
                participant.grace_timer = Some(grace_token.clone());

                let grace = table
                    .session_of(&participant_id)
                    .and_then(|s| s.current_scene())
                    .map(|scene| self.grace_for(scene))
                    .unwrap_or(std::time::Duration::from_secs(self.config.grace_secs));
                (participant_id, Some((grace_token, grace)))
            }
        };

        let (participant_id, grace) = dropped;
        emit(TelemetryKind::ConnectionClosed)
            .participant(&participant_id)
            .emit();

        let Some((grace_token, grace)) = grace else {
            return;
        };

        // Mark the member disconnected in any live game so the broker
        // buffers signaling instead of sending into the void.
        let game = {
            let table = self.registry.games.read().await;
            table.game_of(&participant_id)
        };
        if let Some(game) = &game {
            if let Some(index) = game.group.index_of(&participant_id) {
                let mut state = game.state.lock().await;
                state.disconnected.insert(index);
            }
        }

        let Some(server) = self.strong() else {
            return;
        };
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = grace_token.cancelled() => {}
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(grace) => {
                    server.handle_grace_expired(&participant_id).await;
                }
            }
        });
    }

    /// The grace window closed without a reconnect. Waitroom entries become
    /// dropouts; live games terminate down the dropout path.
    pub(crate) async fn handle_grace_expired(&self, participant_id: &ParticipantId) {
        emit(TelemetryKind::GraceExpired)
            .participant(participant_id)
            .emit();

        {
            let mut table = self.registry.participants.write().await;
            if let Some(participant) = table.get_mut(participant_id) {
                participant.grace_timer = None;
            }
        }

        let state = {
            let table = self.registry.participants.read().await;
            table.get(participant_id).map(|p| p.state)
        };

        match state {
            Some(ParticipantState::InWaitroom) => {
                self.handle_waitroom_dropout(participant_id).await;
            }
            Some(ParticipantState::InGame) => {
                let game = {
                    let table = self.registry.games.read().await;
                    table.game_of(participant_id)
                };
                if let Some(game) = game {
                    self.finish_game(
                        &game,
                        TerminationReason::PartnerDropout,
                        Some(participant_id),
                    )
                    .await;
                }
            }
            _ => {
                // Static scene: the session stays resumable in memory.
                self.flush_session_metadata(participant_id).await;
            }
        }
    }

    // -------------------------------------------------------------------
    // Scene activation
    // -------------------------------------------------------------------

    /// Send `activate_scene` for the session's current scene. Safe to call
    /// repeatedly: activation is idempotent under reconnect, and a scene
    /// index below the session's high-water mark is never sent.
    pub(crate) async fn activate_current_scene(&self, participant_id: &ParticipantId) {
        let payload = {
            let table = self.registry.participants.read().await;
            let Some(participant) = table.get(participant_id) else {
                return;
            };
            if participant.state.is_terminal() {
                return;
            }
            let Some(session) = table.session_of(participant_id) else {
                return;
            };
            if session.current_scene_index < session.highest_activated_index {
                tracing::warn!(
                    %participant_id,
                    current = session.current_scene_index,
                    highest = session.highest_activated_index,
                    "refusing to activate scene below high-water mark"
                );
                return;
            }
            let Some(scene) = session.current_scene() else {
                return;
            };
            ActivateScenePayload {
                scene_id: scene.scene_id.clone(),
                scene_index: session.current_scene_index,
                kind: scene.kind,
                content: scene.content.clone(),
            }
        };

        self.send_to_participant(
            participant_id,
            ServerMessage::ActivateScene(Box::new(payload)),
        )
        .await;
    }

    /// Serialize and enqueue the session's metadata record
    /// (last-write-wins at the sink).
    pub(crate) async fn flush_session_metadata(&self, participant_id: &ParticipantId) {
        let record = {
            let table = self.registry.participants.read().await;
            let Some(session) = table.session_of(participant_id) else {
                return;
            };
            let metadata = serde_json::to_value(&session.metadata)
                .unwrap_or(serde_json::Value::Null);
            (session.id.clone(), metadata)
        };
        self.sink.enqueue_session_metadata(record.0, record.1);
    }
}
