use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;

use crate::config::{ActionPopulationPolicy, PeerMode, SceneSpec};
use crate::protocol::{
    ConnectionId, GameId, ParticipantEvent, ParticipantId, ParticipantState,
    PlayerAssignedPayload, PlayerIndex, ServerMessage, SessionId, TerminationReason,
};
use crate::registry::{AssignmentRecord, Game, GameStatus, PlayerGroup, QueuedAction};
use crate::telemetry::{emit, TelemetryKind};

use super::ExperimentServer;

/// Queued actions beyond this depth drop from the front; a peer flooding
/// actions cannot grow memory unboundedly.
const ACTION_QUEUE_DEPTH: usize = 128;

/// Member errors inside one game beyond this mark the member for exclusion.
const MEMBER_ERROR_THRESHOLD: u32 = 32;

/// How a finished tick steers the loop.
enum TickFlow {
    Continue,
    EpisodeEnd,
    Stop,
}

impl ExperimentServer {
    /// Create a game for a matched (and confirmed) group: allocate the
    /// seed, transition members, persist the assignment record, emit
    /// `player_assigned`, and start the tick loop.
    pub(crate) async fn create_game(
        &self,
        scene: &SceneSpec,
        group: PlayerGroup,
        bot_slots: Vec<PlayerIndex>,
        probe_results: serde_json::Value,
    ) {
        let scene_index = self
            .experiment
            .scene_by_id(&scene.scene_id)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let seed: u64 = rand::random();
        let peer_enabled = scene.peer_mode != PeerMode::None;

        let game = Arc::new(Game::new(
            scene.scene_id.clone(),
            scene_index,
            group,
            seed,
            bot_slots,
            peer_enabled,
        ));

        let mut prior_partner_history = serde_json::Map::new();
        {
            let mut table = self.registry.participants.write().await;
            let members: Vec<ParticipantId> = game.group.ordered_members.to_vec();

            for member in &members {
                if let Some(participant) = table.get_mut(member) {
                    if participant.state == ParticipantState::InWaitroom {
                        participant.transition(ParticipantEvent::Matched);
                    }
                    prior_partner_history.insert(
                        member.0.clone(),
                        serde_json::to_value(
                            participant
                                .prior_partners
                                .iter()
                                .map(|p| p.0.clone())
                                .collect::<Vec<_>>(),
                        )
                        .unwrap_or(serde_json::Value::Null),
                    );
                    for other in &members {
                        if other != member {
                            participant.prior_partners.insert(other.clone());
                        }
                    }
                }
                let player_index = game.group.index_of(member).unwrap_or(0);
                let partners: Vec<ParticipantId> = members
                    .iter()
                    .filter(|m| *m != member)
                    .cloned()
                    .collect();
                if let Some(session) = table.session_of_mut(member) {
                    session.metadata.assignments.push(AssignmentRecord {
                        scene_id: scene.scene_id.clone(),
                        game_id: game.id.to_string(),
                        player_index,
                        partners,
                        assigned_at: Utc::now(),
                    });
                }
            }

            let mut games = self.registry.games.write().await;
            games.insert(game.clone());
        }

        {
            let mut state = game.state.lock().await;
            state.set_status(game.id, GameStatus::Active);
        }

        // The assignment log is the researcher's primary audit artifact.
        self.sink.enqueue_match_assignment(
            scene.scene_id.clone(),
            serde_json::json!({
                "group_id": game.group.group_id.to_string(),
                "game_id": game.id.to_string(),
                "members": game.group.ordered_members.to_vec(),
                "bot_slots": game.bot_slots.clone(),
                "formed_at": game.group.formed_at,
                "seed": game.seed,
                "probe_results": probe_results,
                "prior_partner_history": prior_partner_history,
            }),
        );

        emit(TelemetryKind::GameCreated)
            .game(game.id)
            .scene(&scene.scene_id)
            .details(serde_json::json!({
                "members": game.group.ordered_members.to_vec(),
                "expected_player_count": game.expected_player_count,
            }))
            .emit();

        for member in &game.group.ordered_members {
            let Some(player_index) = game.group.index_of(member) else {
                continue;
            };
            self.send_to_participant(
                member,
                ServerMessage::PlayerAssigned(Box::new(PlayerAssignedPayload {
                    game_id: game.id,
                    scene_id: scene.scene_id.clone(),
                    player_index,
                    seed: game.seed,
                    expected_player_count: game.expected_player_count,
                })),
            )
            .await;
        }

        self.spawn_tick_loop(game, scene.clone());
    }

    /// Run the tick loop in its own task. Panics are caught and isolated to
    /// the affected game; they never bring down the process.
    fn spawn_tick_loop(&self, game: Arc<Game>, scene: SceneSpec) {
        let Some(server) = self.strong() else {
            return;
        };
        tokio::spawn(async move {
            let looped = std::panic::AssertUnwindSafe(run_tick_loop(
                server.clone(),
                game.clone(),
                scene,
            ))
            .catch_unwind()
            .await;
            if looped.is_err() {
                tracing::error!(game_id = %game.id, "tick loop panicked; terminating game");
                server
                    .finish_game(&game, TerminationReason::Fatal, None)
                    .await;
            }
        });
    }

    /// Queue one member action. In peer-authoritative mode the action is
    /// also relayed to the other members (direct-channel fallback).
    pub async fn handle_action(
        &self,
        connection_id: ConnectionId,
        session_id: SessionId,
        game_id: GameId,
        tick: u64,
        action: serde_json::Value,
        episode_done: bool,
    ) {
        let Some(participant_id) = self.resolve_session(&connection_id, &session_id).await else {
            return;
        };
        let Some((game, player_index)) = self.game_membership(&participant_id, game_id).await
        else {
            return;
        };
        let scene = self.scene_at(game.scene_index).cloned();

        let over_threshold = {
            let mut state = game.state.lock().await;
            if state.status != GameStatus::Active {
                // Ill-timed actions are dropped; repeats mark the member.
                let errors = state.member_errors.entry(player_index).or_insert(0);
                *errors += 1;
                *errors > MEMBER_ERROR_THRESHOLD
            } else {
                let queue = state.queued_actions.entry(player_index).or_default();
                queue.push_back(QueuedAction {
                    tick,
                    action: action.clone(),
                    episode_done,
                });
                while queue.len() > ACTION_QUEUE_DEPTH {
                    queue.pop_front();
                }
                if episode_done {
                    state.episode_done_requested = true;
                }
                if let Some(peer) = state.peer.as_mut() {
                    peer.fallback_relay_enabled = true;
                }
                false
            }
        };
        game.action_notify.notify_waiters();

        if over_threshold {
            tracing::warn!(
                %participant_id,
                %game_id,
                "member exceeded error threshold; excluding"
            );
            self.handle_self_exclude(
                connection_id,
                session_id,
                game_id,
                "repeated protocol errors".to_string(),
            )
            .await;
            return;
        }

        // Relay fallback: each action reaches the other expected members
        // exactly once. Late actions are forwarded as-is; rollback or
        // discard is the peer-side netcode's call.
        if scene.is_some_and(|s| s.peer_mode == PeerMode::PeerAuthoritative) {
            let relay = Arc::new(ServerMessage::RelayAction {
                game_id,
                player_index,
                tick,
                action,
            });
            let targets = self.game_member_connections(&game).await;
            for (index, _, connection) in targets {
                if index == player_index {
                    continue;
                }
                if let Some(connection) = connection {
                    self.send_shared(&connection, relay.clone());
                }
            }
        }
    }

    /// A member acknowledged an episode reset.
    pub async fn handle_reset_complete(
        &self,
        connection_id: ConnectionId,
        session_id: SessionId,
        game_id: GameId,
        episode: u32,
    ) {
        let Some(participant_id) = self.resolve_session(&connection_id, &session_id).await else {
            return;
        };
        let Some((game, player_index)) = self.game_membership(&participant_id, game_id).await
        else {
            return;
        };

        let mut state = game.state.lock().await;
        if state.status == GameStatus::Resetting && state.episode == episode {
            state.reset_acks.insert(player_index);
        }
        drop(state);
        game.action_notify.notify_waiters();
    }

    /// Terminate a game (public path used by shutdown and natural end).
    pub(crate) async fn terminate_game(&self, game: &Arc<Game>, reason: TerminationReason) {
        self.finish_game(game, reason, None).await;
    }

    /// Full termination path. `excluded` names the member whose departure
    /// caused a non-natural end; the surviving partners get a neutral
    /// `partner_excluded` notification.
    pub(crate) async fn finish_game(
        &self,
        game: &Arc<Game>,
        reason: TerminationReason,
        excluded: Option<&ParticipantId>,
    ) {
        {
            let mut state = game.state.lock().await;
            if state.status == GameStatus::Done {
                return;
            }
            state.set_status(game.id, GameStatus::Done);
            state.partial = reason.is_partial();
            state.termination_reason = Some(reason.clone());
        }
        game.cancel.cancel();

        let reason_label = serde_json::to_value(&reason)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "fatal".to_string());

        emit(TelemetryKind::GameTerminated)
            .game(game.id)
            .scene(&game.scene_id)
            .details(serde_json::json!({
                "reason": reason_label.clone(),
                "partial": reason.is_partial(),
            }))
            .emit();

        {
            let mut table = self.registry.participants.write().await;
            for member in &game.group.ordered_members {
                if let Some(participant) = table.get_mut(member) {
                    // The self-excluded member already ended; everyone else
                    // lands in GameEnded and can advance.
                    if participant.state == ParticipantState::InGame {
                        participant.transition(ParticipantEvent::GameEndedNormally);
                    }
                }
                if let Some(session) = table.session_of_mut(member) {
                    if reason.is_partial() {
                        // Both sides of the pair carry the partial mark,
                        // even when one side's episode data was complete.
                        session.metadata.partial = true;
                    }
                    session.metadata.termination_reason = Some(reason_label.clone());
                }
            }
        }

        let neutral = reason.neutral_message().to_string();
        let partial = reason.is_partial();
        let targets = self.game_member_connections(game).await;
        for (_, member, connection) in &targets {
            if excluded.is_some_and(|leaver| leaver != member)
                && matches!(
                    reason,
                    TerminationReason::PartnerDropout | TerminationReason::PartnerExclusion
                )
            {
                if let Some(connection) = connection {
                    self.send_to_connection(
                        connection,
                        ServerMessage::PartnerExcluded {
                            game_id: game.id,
                            message: neutral.clone(),
                        },
                    );
                }
            }
            if let Some(connection) = connection {
                self.send_to_connection(
                    connection,
                    ServerMessage::EndGame {
                        game_id: game.id,
                        reason: neutral.clone(),
                        partial,
                        request_export: true,
                    },
                );
            }
        }

        for member in &game.group.ordered_members {
            self.flush_session_metadata(member).await;
        }

        // Short drain before the registry forgets the game, so trailing
        // messages still resolve membership.
        let Some(server) = self.strong() else {
            return;
        };
        let game_id = game.id;
        let drain = Duration::from_millis(self.config.teardown_drain_ms);
        tokio::spawn(async move {
            tokio::time::sleep(drain).await;
            let mut games = server.registry.games.write().await;
            games.remove(&game_id);
        });
    }

    /// Resolve a game reference and the sender's slot in it.
    pub(crate) async fn game_membership(
        &self,
        participant_id: &ParticipantId,
        game_id: GameId,
    ) -> Option<(Arc<Game>, PlayerIndex)> {
        let table = self.registry.games.read().await;
        let game = table.get(&game_id)?;
        drop(table);
        match game.group.index_of(participant_id) {
            Some(index) => Some((game, index)),
            None => {
                tracing::warn!(
                    %participant_id,
                    %game_id,
                    "message for a game the participant is not a member of"
                );
                None
            }
        }
    }

    /// Human members with their current connections, in player-index order.
    pub(crate) async fn game_member_connections(
        &self,
        game: &Arc<Game>,
    ) -> Vec<(PlayerIndex, ParticipantId, Option<ConnectionId>)> {
        let table = self.registry.participants.read().await;
        game.group
            .ordered_members
            .iter()
            .enumerate()
            .map(|(i, member)| {
                (
                    i as PlayerIndex,
                    member.clone(),
                    table.get(member).and_then(|p| p.connection),
                )
            })
            .collect()
    }
}

/// One game's tick loop: drains actions, applies the population policy,
/// advances the tick counter, samples hashes on the configured stride, and
/// walks the episode/reset state machine.
async fn run_tick_loop(server: Arc<ExperimentServer>, game: Arc<Game>, scene: SceneSpec) {
    let period = Duration::from_secs_f64(1.0 / f64::from(scene.tick_rate.max(1)));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = game.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match tick_once(&server, &game, &scene, period).await {
            TickFlow::Continue => {}
            TickFlow::Stop => break,
            TickFlow::EpisodeEnd => {
                let finished_episodes = {
                    let state = game.state.lock().await;
                    state.episode + 1
                };
                if finished_episodes >= scene.episodes {
                    server
                        .finish_game(&game, TerminationReason::Natural, None)
                        .await;
                    break;
                }
                if !run_reset(&server, &game, &scene).await {
                    break;
                }
            }
        }
    }
}

/// Advance the game by one tick. Returns how the loop should proceed.
async fn tick_once(
    server: &Arc<ExperimentServer>,
    game: &Arc<Game>,
    scene: &SceneSpec,
    period: Duration,
) -> TickFlow {
    let human_indices: Vec<PlayerIndex> = (0..game.expected_player_count as u8)
        .filter(|i| !game.is_bot_slot(*i))
        .collect();

    // Block policy: stall until all actions arrive or the 2x-period
    // deadline elapses, then fall back to PreviousAction.
    if scene.action_population_policy == ActionPopulationPolicy::Block {
        let deadline = tokio::time::Instant::now() + period * 2;
        loop {
            let all_present = {
                let state = game.state.lock().await;
                if state.status != GameStatus::Active {
                    return TickFlow::Continue;
                }
                human_indices.iter().all(|i| {
                    state.disconnected.contains(i)
                        || state
                            .queued_actions
                            .get(i)
                            .is_some_and(|q| !q.is_empty())
                })
            };
            if all_present {
                break;
            }
            tokio::select! {
                () = game.cancel.cancelled() => return TickFlow::Stop,
                () = game.action_notify.notified() => {}
                () = tokio::time::sleep_until(deadline) => {
                    emit(TelemetryKind::ActionDeadlineExceeded)
                        .game(game.id)
                        .scene(&scene.scene_id)
                        .emit();
                    break;
                }
            }
        }
    }

    let (tick, actions, episode_done, request_hash) = {
        let mut state = game.state.lock().await;
        if state.status != GameStatus::Active {
            return TickFlow::Continue;
        }

        let tick = state.tick_seq + 1;
        let mut actions: HashMap<PlayerIndex, serde_json::Value> = HashMap::new();

        for index in 0..game.expected_player_count as u8 {
            let queued = state
                .queued_actions
                .get_mut(&index)
                .and_then(std::collections::VecDeque::pop_front);
            let action = match queued {
                Some(queued) => {
                    if queued.episode_done {
                        state.episode_done_requested = true;
                    }
                    queued.action
                }
                None => match scene.action_population_policy {
                    ActionPopulationPolicy::DefaultAction => scene.default_action.clone(),
                    // Block already waited; anything still missing falls
                    // back to the previous action.
                    ActionPopulationPolicy::PreviousAction | ActionPopulationPolicy::Block => {
                        state
                            .last_actions
                            .get(&index)
                            .cloned()
                            .unwrap_or_else(|| scene.default_action.clone())
                    }
                },
            };
            state.last_actions.insert(index, action.clone());
            actions.insert(index, action);
        }

        state.tick_seq = tick;

        if let Some(horizon) = scene.episode_max_ticks {
            if tick - state.episode_start_tick >= horizon {
                state.episode_done_requested = true;
            }
        }

        let episode_done = state.episode_done_requested;
        let request_hash = scene.peer_mode == PeerMode::PeerAuthoritative
            && scene.hash_sampling_every > 0
            && tick % scene.hash_sampling_every == 0;
        (tick, actions, episode_done, request_hash)
    };

    // Server-authoritative stepping happens outside the game lock; the
    // stepper is a collaborator, not part of the registry.
    let mut episode_done = episode_done;
    let mut authoritative: Option<serde_json::Value> = None;
    let mut hud: Option<serde_json::Value> = None;
    if scene.peer_mode == PeerMode::ServerAuthoritative {
        match server.stepper_for(&scene.scene_id) {
            Some(stepper) => match stepper.step(game.id, tick, &actions) {
                Ok(outcome) => {
                    episode_done |= outcome.episode_done;
                    if outcome.episode_done {
                        let mut state = game.state.lock().await;
                        state.episode_done_requested = true;
                    }
                    authoritative = Some(outcome.render_state);
                    hud = outcome.hud;
                }
                Err(err) => {
                    tracing::error!(game_id = %game.id, error = %err, "stepper failed");
                    server
                        .finish_game(game, TerminationReason::Fatal, None)
                        .await;
                    return TickFlow::Stop;
                }
            },
            None => {
                tracing::error!(
                    game_id = %game.id,
                    scene_id = %scene.scene_id,
                    "server-authoritative scene has no registered stepper"
                );
                server
                    .finish_game(game, TerminationReason::Fatal, None)
                    .await;
                return TickFlow::Stop;
            }
        }
    }

    let targets = server.game_member_connections(game).await;
    let broadcast = Arc::new(ServerMessage::TickBroadcast {
        game_id: game.id,
        tick,
        hud,
        request_hash,
    });
    for (_, _, connection) in &targets {
        if let Some(connection) = connection {
            server.send_shared(connection, broadcast.clone());
        }
    }
    if let Some(state) = authoritative {
        let message = Arc::new(ServerMessage::AuthoritativeState {
            game_id: game.id,
            tick,
            state,
        });
        for (_, _, connection) in &targets {
            if let Some(connection) = connection {
                server.send_shared(connection, message.clone());
            }
        }
    }

    if episode_done {
        TickFlow::EpisodeEnd
    } else {
        TickFlow::Continue
    }
}

/// Episode boundary: freeze, collect `reset_complete` acks (or time out),
/// then re-enter Active. The seed is never regenerated; determinism flows
/// from the original seed plus the tick counter.
async fn run_reset(server: &Arc<ExperimentServer>, game: &Arc<Game>, scene: &SceneSpec) -> bool {
    let next_episode = {
        let mut state = game.state.lock().await;
        if !state.set_status(game.id, GameStatus::Resetting) {
            return false;
        }
        state.episode += 1;
        state.episode_start_tick = state.tick_seq;
        state.episode_done_requested = false;
        state.reset_acks.clear();
        state.queued_actions.clear();
        state.episode
    };

    if scene.peer_mode == PeerMode::ServerAuthoritative {
        if let Some(stepper) = server.stepper_for(&scene.scene_id) {
            stepper.reset(game.id, next_episode);
        }
    }

    emit(TelemetryKind::GameReset)
        .game(game.id)
        .scene(&scene.scene_id)
        .details(serde_json::json!({"episode": next_episode}))
        .emit();

    let reset_message = Arc::new(ServerMessage::ResetGame {
        game_id: game.id,
        episode: next_episode,
        freeze_sec: scene.reset_freeze_sec,
    });
    let targets = server.game_member_connections(game).await;
    for (_, _, connection) in &targets {
        if let Some(connection) = connection {
            server.send_shared(connection, reset_message.clone());
        }
    }

    // Wait for every connected human member to ack, or the hard timeout,
    // whichever comes first.
    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(server.config().reset_ack_timeout_secs);
    loop {
        let all_acked = {
            let state = game.state.lock().await;
            if state.status != GameStatus::Resetting {
                return state.status == GameStatus::Active;
            }
            targets.iter().all(|(index, _, _)| {
                game.is_bot_slot(*index)
                    || state.disconnected.contains(index)
                    || state.reset_acks.contains(index)
            })
        };
        if all_acked {
            break;
        }
        tokio::select! {
            () = game.cancel.cancelled() => return false,
            () = game.action_notify.notified() => {}
            () = tokio::time::sleep_until(deadline) => {
                tracing::warn!(game_id = %game.id, "reset acks timed out; resuming");
                break;
            }
        }
    }

    if scene.reset_freeze_sec > 0 {
        tokio::select! {
            () = game.cancel.cancelled() => return false,
            () = tokio::time::sleep(Duration::from_secs(scene.reset_freeze_sec)) => {}
        }
    }

    let mut state = game.state.lock().await;
    state.set_status(game.id, GameStatus::Active)
}
