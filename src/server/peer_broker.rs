use std::sync::Arc;

use crate::protocol::{
    ConnectionId, ErrorCode, GameId, ParticipantEvent, ParticipantId, ServerMessage, SessionId,
    TerminationReason,
};
use crate::telemetry::{emit, TelemetryKind};

use super::ExperimentServer;

impl ExperimentServer {
    /// Relay an opaque signaling blob to every other member, in order.
    /// Fire-and-forget; the payload is never parsed. Members inside their
    /// disconnect grace get the blob parked for replay on restore.
    pub async fn handle_signaling(
        &self,
        connection_id: ConnectionId,
        session_id: SessionId,
        game_id: GameId,
        payload: serde_json::Value,
    ) {
        let Some(participant_id) = self.resolve_session(&connection_id, &session_id).await else {
            return;
        };
        let Some((game, sender_index)) = self.game_membership(&participant_id, game_id).await
        else {
            self.send_to_connection(
                &connection_id,
                ServerMessage::Error {
                    message: "Not a member of that game.".to_string(),
                    error_code: Some(ErrorCode::NotAGameMember),
                },
            );
            return;
        };

        let targets = self.game_member_connections(&game).await;
        let mut outbox: Vec<(ConnectionId, Arc<ServerMessage>)> = Vec::new();

        {
            let mut state = game.state.lock().await;
            // Terminal games relay nothing further.
            if state.termination_reason.is_some() {
                return;
            }
            for (index, _, connection) in &targets {
                if *index == sender_index {
                    continue;
                }
                let message = ServerMessage::Signaling {
                    game_id,
                    from_player_index: sender_index,
                    payload: payload.clone(),
                };
                match connection {
                    Some(connection) if !state.disconnected.contains(index) => {
                        outbox.push((*connection, Arc::new(message)));
                    }
                    _ => {
                        if let Some(peer) = state.peer.as_mut() {
                            peer.buffer_signaling(*index, message);
                        }
                    }
                }
            }
        }

        for (connection, message) in outbox {
            self.send_shared(&connection, message);
        }
    }

    /// Record one peer's confirmed-state hash for a sampled tick. A full
    /// set of samples either prunes silently or surfaces a desync.
    pub async fn handle_state_hash_sample(
        &self,
        connection_id: ConnectionId,
        session_id: SessionId,
        game_id: GameId,
        tick: u64,
        hash: u64,
    ) {
        let Some(participant_id) = self.resolve_session(&connection_id, &session_id).await else {
            return;
        };
        let Some((game, player_index)) = self.game_membership(&participant_id, game_id).await
        else {
            return;
        };
        let authoritative_resync = self
            .scene_at(game.scene_index)
            .is_some_and(|scene| scene.authoritative_resync);

        let resync_target = {
            let mut state = game.state.lock().await;
            let expected = game.human_count();
            let disconnected = state.disconnected.clone();
            let Some(peer) = state.peer.as_mut() else {
                return;
            };
            let Some(desync) = peer.record_hash(tick, player_index, hash, expected) else {
                return;
            };

            let hashes: serde_json::Map<String, serde_json::Value> = desync
                .hashes
                .iter()
                .map(|(index, hash)| {
                    (index.to_string(), serde_json::json!(format!("{hash:#x}")))
                })
                .collect();
            emit(TelemetryKind::DesyncDetected)
                .game(game_id)
                .scene(&game.scene_id)
                .details(serde_json::json!({
                    "tick": desync.tick,
                    "hashes": hashes,
                }))
                .emit();

            // Policy is log-and-continue; resync only when the scene opted
            // in and none is already in flight. Lowest connected index is
            // asked for its full state.
            if !authoritative_resync || peer.resync_in_flight.is_some() {
                None
            } else {
                peer.resync_in_flight = Some(desync.tick);
                game.group
                    .ordered_members
                    .iter()
                    .enumerate()
                    .map(|(i, m)| (i as u8, m.clone()))
                    .find(|(i, _)| !disconnected.contains(i))
                    .map(|(_, member)| (member, tick))
            }
        };

        if let Some((member, tick)) = resync_target {
            emit(TelemetryKind::ResyncRequested)
                .game(game_id)
                .participant(&member)
                .details(serde_json::json!({"tick": tick}))
                .emit();
            self.send_to_participant(&member, ServerMessage::ResyncRequest { game_id, tick })
                .await;
        }
    }

    /// Full-state reply from the peer chosen after a desync. Broadcast to
    /// every other member and bump the validation epoch.
    pub async fn handle_resync_state(
        &self,
        connection_id: ConnectionId,
        session_id: SessionId,
        game_id: GameId,
        tick: u64,
        state_blob: serde_json::Value,
    ) {
        let Some(participant_id) = self.resolve_session(&connection_id, &session_id).await else {
            return;
        };
        let Some((game, sender_index)) = self.game_membership(&participant_id, game_id).await
        else {
            return;
        };

        let accepted = {
            let mut state = game.state.lock().await;
            match state.peer.as_mut() {
                Some(peer) if peer.resync_in_flight.is_some() => {
                    peer.resync_in_flight = None;
                    peer.validation_epoch += 1;
                    true
                }
                _ => false,
            }
        };
        if !accepted {
            tracing::debug!(%game_id, "unsolicited resync_state dropped");
            return;
        }

        let message = Arc::new(ServerMessage::AuthoritativeState {
            game_id,
            tick,
            state: state_blob,
        });
        for (index, _, connection) in self.game_member_connections(&game).await {
            if index == sender_index {
                continue;
            }
            if let Some(connection) = connection {
                self.send_shared(&connection, message.clone());
            }
        }
    }

    /// A peer reports itself excluded (sustained latency, tab hidden). The
    /// partners get a neutral notification and the game terminates with
    /// both sides' data marked partial.
    pub async fn handle_self_exclude(
        &self,
        connection_id: ConnectionId,
        session_id: SessionId,
        game_id: GameId,
        reason: String,
    ) {
        let Some(participant_id) = self.resolve_session(&connection_id, &session_id).await else {
            return;
        };
        let Some((game, _)) = self.game_membership(&participant_id, game_id).await else {
            return;
        };

        emit(TelemetryKind::Exclusion)
            .participant(&participant_id)
            .session(&session_id)
            .game(game_id)
            .scene(&game.scene_id)
            .details(serde_json::json!({"self_reported_reason": reason}))
            .emit();

        {
            let mut table = self.registry.participants.write().await;
            if let Some(participant) = table.get_mut(&participant_id) {
                participant.transition(ParticipantEvent::ExcludedSelf);
            }
        }

        self.finish_game(
            &game,
            TerminationReason::PartnerExclusion,
            Some(&participant_id),
        )
        .await;
    }

    /// Scene-exit teardown: drop everything peer-specific for a member so
    /// no stale events reach subsequent scenes.
    pub(crate) async fn release_peer_state(&self, participant_id: &ParticipantId) {
        let game = {
            let table = self.registry.games.read().await;
            table.game_of(participant_id)
        };
        let Some(game) = game else {
            return;
        };
        let Some(index) = game.group.index_of(participant_id) else {
            return;
        };

        let mut state = game.state.lock().await;
        if let Some(peer) = state.peer.as_mut() {
            peer.signaling_buffer.remove(&index);
            for samples in peer.hash_ring.values_mut() {
                samples.remove(&index);
            }
        }
        state.queued_actions.remove(&index);
        state.last_actions.remove(&index);
    }
}
