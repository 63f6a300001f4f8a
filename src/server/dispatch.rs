use crate::protocol::{ClientMessage, ConnectionId};

use super::ExperimentServer;

impl ExperimentServer {
    /// Dispatch one inbound message by opcode. Thin table only: each arm
    /// forwards to the owning subsystem's handler.
    pub async fn handle_client_message(&self, connection_id: ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::Register {
                claimed_participant_id,
                session_token,
                globals,
            } => {
                self.handle_register(connection_id, claimed_participant_id, session_token, globals)
                    .await;
            }
            ClientMessage::SubmitScreening {
                session_id,
                context,
            } => {
                self.handle_submit_screening(connection_id, session_id, context)
                    .await;
            }
            ClientMessage::Advance {
                session_id,
                scene_index,
            } => {
                self.handle_advance(connection_id, session_id, scene_index)
                    .await;
            }
            ClientMessage::SyncGlobals {
                session_id,
                globals,
            } => {
                self.handle_sync_globals(connection_id, session_id, globals)
                    .await;
            }
            ClientMessage::StaticSceneData {
                session_id,
                scene_id,
                elements,
            } => {
                self.handle_static_scene_data(connection_id, session_id, scene_id, elements)
                    .await;
            }
            ClientMessage::EnqueueForScene {
                session_id,
                attributes,
            } => {
                self.handle_enqueue_for_scene(connection_id, session_id, attributes)
                    .await;
            }
            ClientMessage::LeaveWaitroom { session_id } => {
                self.handle_leave_waitroom(connection_id, session_id).await;
            }
            ClientMessage::ProbeReady {
                session_id,
                probe_id,
            } => {
                self.handle_probe_ready(connection_id, session_id, probe_id)
                    .await;
            }
            ClientMessage::ProbeResult {
                session_id,
                probe_id,
                rtt_ms,
                success,
            } => {
                self.handle_probe_result(connection_id, session_id, probe_id, rtt_ms, success)
                    .await;
            }
            ClientMessage::Action {
                session_id,
                game_id,
                tick,
                action,
                episode_done,
            } => {
                self.handle_action(connection_id, session_id, game_id, tick, action, episode_done)
                    .await;
            }
            ClientMessage::StateHashSample {
                session_id,
                game_id,
                tick,
                hash,
            } => {
                self.handle_state_hash_sample(connection_id, session_id, game_id, tick, hash)
                    .await;
            }
            ClientMessage::ResetComplete {
                session_id,
                game_id,
                episode,
            } => {
                self.handle_reset_complete(connection_id, session_id, game_id, episode)
                    .await;
            }
            ClientMessage::Signaling {
                session_id,
                game_id,
                payload,
            } => {
                self.handle_signaling(connection_id, session_id, game_id, payload)
                    .await;
            }
            ClientMessage::ResyncState {
                session_id,
                game_id,
                tick,
                state,
            } => {
                self.handle_resync_state(connection_id, session_id, game_id, tick, state)
                    .await;
            }
            ClientMessage::SelfExclude {
                session_id,
                game_id,
                reason,
            } => {
                self.handle_self_exclude(connection_id, session_id, game_id, reason)
                    .await;
            }
            ClientMessage::Ping => {
                self.handle_ping(connection_id).await;
            }
        }
    }
}
