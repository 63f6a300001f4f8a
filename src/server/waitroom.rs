use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SceneSpec;
use crate::matchmaker::{DropoutAction, TimeoutAction};
use crate::protocol::{
    ConnectionId, ErrorCode, Globals, ParticipantEvent, ParticipantId, ProbeId, SceneId,
    ServerMessage, SessionId, WaitroomStatus,
};
use crate::registry::{
    PendingGroup, PendingPhase, PlayerGroup, ProbeSession, WaitingEntry,
};
use crate::telemetry::{emit, TelemetryKind};

use super::ExperimentServer;

impl ExperimentServer {
    /// Join the waiting room of the session's current scene. The matcher is
    /// invoked synchronously under the waitroom lock, so find+remove is
    /// atomic under concurrent arrivals.
    pub async fn handle_enqueue_for_scene(
        &self,
        connection_id: ConnectionId,
        session_id: SessionId,
        attributes: Globals,
    ) {
        let Some(participant_id) = self.resolve_session(&connection_id, &session_id).await else {
            return;
        };

        // Validate the scene before any state changes.
        let scene = {
            let table = self.registry.participants.read().await;
            table
                .session_of(&participant_id)
                .and_then(|s| s.current_scene())
                .cloned()
        };
        let Some(scene) = scene else {
            return;
        };
        if scene.kind != crate::config::SceneKind::Gym {
            self.send_to_connection(
                &connection_id,
                ServerMessage::Error {
                    message: "The current scene has no waiting room.".to_string(),
                    error_code: Some(ErrorCode::InvalidSceneKind),
                },
            );
            return;
        }

        // Scene-level server RTT admission threshold.
        if let Some(max) = scene.max_server_rtt_ms {
            let over = {
                let mut table = self.registry.participants.write().await;
                let scene_index = table
                    .session_of(&participant_id)
                    .map(|s| s.current_scene_index)
                    .unwrap_or(0);
                let Some(participant) = table.get_mut(&participant_id) else {
                    return;
                };
                match participant.rtt_to_server_ms {
                    Some(rtt) if rtt > max => {
                        participant.end_session("server rtt over scene threshold");
                        Some(scene_index)
                    }
                    _ => None,
                }
            };
            if let Some(scene_index) = over {
                emit(TelemetryKind::AdmissionDenied)
                    .participant(&participant_id)
                    .scene(&scene.scene_id)
                    .details(serde_json::json!({"max_server_rtt_ms": max}))
                    .emit();
                self.send_to_connection(
                    &connection_id,
                    ServerMessage::TerminateScene {
                        scene_id: scene.scene_id.clone(),
                        scene_index,
                        redirect_url: scene.redirect_url.clone(),
                        reason: Some(
                            "Your connection latency is too high for this scene.".to_string(),
                        ),
                    },
                );
                self.flush_session_metadata(&participant_id).await;
                return;
            }
        }

        // Solo gym scenes skip the waitroom entirely.
        if scene.group_size == 1 {
            let formed = {
                let mut table = self.registry.participants.write().await;
                let Some(participant) = table.get_mut(&participant_id) else {
                    return;
                };
                participant.transition(ParticipantEvent::EnterWaitroom)
                    && participant.transition(ParticipantEvent::Matched)
            };
            if formed {
                let group = PlayerGroup::new(scene.scene_id.clone(), [participant_id.clone()]);
                self.create_game(&scene, group, Vec::new(), serde_json::Value::Null)
                    .await;
            }
            return;
        }

        let mut outbox: Vec<(ConnectionId, ServerMessage)> = Vec::new();
        let mut formed: Option<(PendingGroup, SceneSpec)> = None;
        let mut timer: Option<(CancellationToken, Duration)> = None;

        {
            let mut table = self.registry.participants.write().await;
            let mut rooms = self.registry.waiting.lock().await;

            // A participant appears in at most one waiting entry globally.
            if rooms.find_participant(&participant_id).is_some() {
                outbox.push((
                    connection_id,
                    ServerMessage::Error {
                        message: "Already waiting for a match.".to_string(),
                        error_code: Some(ErrorCode::AlreadyWaiting),
                    },
                ));
                drop(rooms);
                drop(table);
                for (conn, msg) in outbox {
                    self.send_to_connection(&conn, msg);
                }
                return;
            }

            let Some(participant) = table.get_mut(&participant_id) else {
                return;
            };
            if !participant.transition(ParticipantEvent::EnterWaitroom) {
                return;
            }
            let rtt = participant.rtt_to_server_ms;
            let prior_partners = participant.prior_partners.clone();

            let entry = WaitingEntry::new(
                participant_id.clone(),
                scene.scene_id.clone(),
                attributes,
                rtt,
                prior_partners,
            );
            let entry_timer = entry.timeout_timer.clone();

            let room = rooms.room_mut(&scene.scene_id);
            room.entries.push(entry);

            let matcher = self.matcher_for(&scene.scene_id);
            let arriving = match room.entries.last() {
                Some(last) => last.clone(),
                None => return,
            };
            let matched = matcher.find_match(&arriving, &room.entries, scene.group_size);

            emit(TelemetryKind::MatchDecision)
                .participant(&participant_id)
                .scene(&scene.scene_id)
                .details(serde_json::json!({
                    "waiting": room.entries.len(),
                    "group_size": scene.group_size,
                    "matched": matched.is_some(),
                }))
                .emit();

            match matched {
                Some(member_ids) => {
                    let entries = room.remove_all(&member_ids);
                    let group = PlayerGroup::new(scene.scene_id.clone(), member_ids);
                    let pending = self.park_group(group, entries, 0, &scene);
                    formed = Some((pending, scene.clone()));
                }
                None => {
                    timer = Some((
                        entry_timer,
                        Duration::from_secs(scene.waitroom_max_wait_sec),
                    ));
                }
            }
        }

        emit(TelemetryKind::WaitroomJoined)
            .participant(&participant_id)
            .session(&session_id)
            .scene(&scene.scene_id)
            .emit();

        for (conn, msg) in outbox {
            self.send_to_connection(&conn, msg);
        }

        if let Some((token, wait)) = timer {
            self.arm_waitroom_timer(participant_id.clone(), token, wait);
        }

        self.broadcast_waitroom_status(&scene.scene_id).await;

        if let Some((pending, scene)) = formed {
            self.launch_pending_group(pending, &scene).await;
        }
    }

    /// Voluntarily leave the waiting room; ends this participant's run like
    /// a dropout would.
    pub async fn handle_leave_waitroom(&self, connection_id: ConnectionId, session_id: SessionId) {
        let Some(participant_id) = self.resolve_session(&connection_id, &session_id).await else {
            return;
        };

        let scene_id = {
            let mut table = self.registry.participants.write().await;
            let mut rooms = self.registry.waiting.lock().await;

            let Some(scene_id) = rooms.find_participant(&participant_id).cloned() else {
                drop(rooms);
                drop(table);
                self.send_to_connection(
                    &connection_id,
                    ServerMessage::Error {
                        message: "Not currently waiting.".to_string(),
                        error_code: Some(ErrorCode::NotWaiting),
                    },
                );
                return;
            };

            rooms.room_mut(&scene_id).remove(&participant_id);
            if let Some(participant) = table.get_mut(&participant_id) {
                participant.transition(ParticipantEvent::WaitroomDropout);
            }
            scene_id
        };

        emit(TelemetryKind::WaitroomLeft)
            .participant(&participant_id)
            .session(&session_id)
            .scene(&scene_id)
            .emit();

        self.flush_session_metadata(&participant_id).await;
        self.broadcast_waitroom_status(&scene_id).await;
    }

    /// Waitroom timer fired. The entry may already be gone (matched or
    /// dropped out in the same instant): at most one termination results.
    pub(crate) async fn handle_waitroom_timeout(&self, participant_id: &ParticipantId) {
        let scene = {
            let table = self.registry.participants.read().await;
            table
                .session_of(participant_id)
                .and_then(|s| s.current_scene())
                .cloned()
        };
        let Some(scene) = scene else {
            return;
        };
        let matcher = self.matcher_for(&scene.scene_id);

        enum Resolution {
            Rearmed(CancellationToken),
            Redirected(Option<String>, usize),
            Bots(PendingGroup),
        }

        let resolution = {
            let mut table = self.registry.participants.write().await;
            let mut rooms = self.registry.waiting.lock().await;
            let room = rooms.room_mut(&scene.scene_id);

            let Some(position) = room.position_of(participant_id) else {
                // Matched or removed concurrently; nothing fires twice.
                drop(rooms);
                drop(table);
                return;
            };

            match matcher.on_timeout(&room.entries[position], &scene) {
                TimeoutAction::Continue => {
                    let token = CancellationToken::new();
                    room.entries[position].timeout_timer = token.clone();
                    Resolution::Rearmed(token)
                }
                TimeoutAction::Redirect { url } => {
                    room.remove(participant_id);
                    let scene_index = table
                        .session_of(participant_id)
                        .map(|s| s.current_scene_index)
                        .unwrap_or(0);
                    if let Some(participant) = table.get_mut(participant_id) {
                        participant.transition(ParticipantEvent::WaitroomTimeout);
                    }
                    Resolution::Redirected(url, scene_index)
                }
                TimeoutAction::PairWithBots => {
                    let entry = match room.remove(participant_id) {
                        Some(entry) => entry,
                        None => return,
                    };
                    let bot_count = scene.group_size.saturating_sub(1);
                    let group =
                        PlayerGroup::new(scene.scene_id.clone(), [participant_id.clone()]);
                    let pending = self.park_group(group, vec![entry], bot_count, &scene);
                    Resolution::Bots(pending)
                }
            }
        };

        match resolution {
            Resolution::Rearmed(token) => {
                self.arm_waitroom_timer(
                    participant_id.clone(),
                    token,
                    Duration::from_secs(scene.waitroom_max_wait_sec),
                );
            }
            Resolution::Redirected(url, scene_index) => {
                emit(TelemetryKind::MatchTimeout)
                    .participant(participant_id)
                    .scene(&scene.scene_id)
                    .details(serde_json::json!({"action": "redirect"}))
                    .emit();
                self.send_to_participant(
                    participant_id,
                    ServerMessage::TerminateScene {
                        scene_id: scene.scene_id.clone(),
                        scene_index,
                        redirect_url: url,
                        reason: Some("No partner could be found in time.".to_string()),
                    },
                )
                .await;
                self.flush_session_metadata(participant_id).await;
                self.broadcast_waitroom_status(&scene.scene_id).await;
            }
            Resolution::Bots(pending) => {
                emit(TelemetryKind::MatchTimeout)
                    .participant(participant_id)
                    .scene(&scene.scene_id)
                    .details(serde_json::json!({"action": "pair_with_bots"}))
                    .emit();
                self.launch_pending_group(pending, &scene).await;
            }
        }
    }

    /// Grace expiry for a queued participant. Default matcher policy keeps
    /// everyone else waiting.
    pub(crate) async fn handle_waitroom_dropout(&self, participant_id: &ParticipantId) {
        let scene = {
            let table = self.registry.participants.read().await;
            table
                .session_of(participant_id)
                .and_then(|s| s.current_scene())
                .cloned()
        };
        let Some(scene) = scene else {
            return;
        };
        let matcher = self.matcher_for(&scene.scene_id);

        let mut dissolved: Option<PendingGroup> = None;
        let mut cancelled_ids: Vec<ParticipantId> = Vec::new();

        {
            let mut table = self.registry.participants.write().await;
            let mut rooms = self.registry.waiting.lock().await;
            let room = rooms.room_mut(&scene.scene_id);

            if let Some(pending) = room.pending_group_of(participant_id) {
                // Grace-timer expiry cancels any probe session for this
                // participant: the whole pending group dissolves.
                let group_id = pending.group.group_id;
                if let Some(pending) = room.take_pending_group(&group_id) {
                    pending.timer.cancel();
                    dissolved = Some(pending);
                }
            } else if let Some(position) = room.position_of(participant_id) {
                let entry = room.entries[position].clone();
                let remaining = room.entries.len() - 1;
                match matcher.on_dropout(&entry, remaining) {
                    DropoutAction::ContinueWaiting => {
                        room.remove(participant_id);
                    }
                    DropoutAction::Cancel => {
                        let drained: Vec<WaitingEntry> = std::mem::take(&mut room.entries);
                        for entry in drained {
                            entry.timeout_timer.cancel();
                            cancelled_ids.push(entry.participant_id);
                        }
                    }
                }
            } else {
                drop(rooms);
                drop(table);
                return;
            }

            if let Some(participant) = table.get_mut(participant_id) {
                participant.transition(ParticipantEvent::WaitroomDropout);
            }
        }

        emit(TelemetryKind::WaitroomLeft)
            .participant(participant_id)
            .scene(&scene.scene_id)
            .details(serde_json::json!({"cause": "dropout"}))
            .emit();

        if let Some(pending) = dissolved {
            self.requeue_dissolved_group(pending, &scene, Some(participant_id))
                .await;
        }

        let scene_index = self
            .experiment
            .scene_by_id(&scene.scene_id)
            .map(|(i, _)| i)
            .unwrap_or(0);
        for other in cancelled_ids {
            if other != *participant_id {
                self.send_to_participant(
                    &other,
                    ServerMessage::TerminateScene {
                        scene_id: scene.scene_id.clone(),
                        scene_index,
                        redirect_url: scene.redirect_url.clone(),
                        reason: Some("Matching for this scene was cancelled.".to_string()),
                    },
                )
                .await;
            }
        }

        self.flush_session_metadata(participant_id).await;
        self.broadcast_waitroom_status(&scene.scene_id).await;
    }

    // -------------------------------------------------------------------
    // Probing
    // -------------------------------------------------------------------

    /// One side of a probe pair reports its transient channel up. When both
    /// sides are ready the RTT exchange starts.
    pub async fn handle_probe_ready(
        &self,
        connection_id: ConnectionId,
        session_id: SessionId,
        probe_id: ProbeId,
    ) {
        let Some(participant_id) = self.resolve_session(&connection_id, &session_id).await else {
            return;
        };
        let Some(scene_id) = self.scene_of_participant(&participant_id).await else {
            return;
        };

        let start_pair = {
            let mut rooms = self.registry.waiting.lock().await;
            let room = rooms.room_mut(&scene_id);
            let Some(pending) = room.pending_with_probe(&probe_id) else {
                return;
            };
            let Some(probe) = pending.probe_by_id(&probe_id) else {
                return;
            };
            probe.ready.insert(participant_id.clone());
            probe.both_ready().then(|| probe.pair.clone())
        };

        if let Some((a, b)) = start_pair {
            for member in [a, b] {
                self.send_to_participant(&member, ServerMessage::ProbeStart { probe_id })
                    .await;
            }
        }
    }

    /// A pair finished (or failed) its RTT measurement. When every pairwise
    /// probe has resolved, the group is confirmed or dissolved.
    pub async fn handle_probe_result(
        &self,
        connection_id: ConnectionId,
        session_id: SessionId,
        probe_id: ProbeId,
        rtt_ms: Option<u32>,
        success: bool,
    ) {
        let Some(participant_id) = self.resolve_session(&connection_id, &session_id).await else {
            return;
        };
        let Some(scene) = self.scene_spec_of_participant(&participant_id).await else {
            return;
        };

        enum ProbeOutcome {
            Incomplete,
            Confirmed(PendingGroup),
            Dissolved(PendingGroup),
        }

        let outcome = {
            let mut rooms = self.registry.waiting.lock().await;
            let room = rooms.room_mut(&scene.scene_id);
            let Some(pending) = room.pending_with_probe(&probe_id) else {
                return;
            };
            let group_id = pending.group.group_id;

            if let Some(probe) = pending.probe_by_id(&probe_id) {
                if success {
                    // Both sides report; keep the slower measurement.
                    probe.measured_rtt_ms =
                        Some(probe.measured_rtt_ms.unwrap_or(0).max(rtt_ms.unwrap_or(0)));
                } else {
                    probe.failed = true;
                }
            }

            let resolved = pending
                .probes
                .iter()
                .all(|p| p.failed || p.measured_rtt_ms.is_some());
            if !resolved {
                ProbeOutcome::Incomplete
            } else if pending.any_probe_failed(scene.max_peer_rtt_ms) {
                match room.take_pending_group(&group_id) {
                    Some(pending) => {
                        pending.timer.cancel();
                        ProbeOutcome::Dissolved(pending)
                    }
                    None => ProbeOutcome::Incomplete,
                }
            } else if pending.all_probes_succeeded(scene.max_peer_rtt_ms) {
                pending.timer.cancel();
                pending.phase = PendingPhase::Countdown;
                match room.take_pending_group(&group_id) {
                    Some(pending) => ProbeOutcome::Confirmed(pending),
                    None => ProbeOutcome::Incomplete,
                }
            } else {
                ProbeOutcome::Incomplete
            }
        };

        match outcome {
            ProbeOutcome::Incomplete => {}
            ProbeOutcome::Confirmed(pending) => {
                self.start_countdown(pending, &scene).await;
            }
            ProbeOutcome::Dissolved(pending) => {
                emit(TelemetryKind::ProbeFailed)
                    .participant(&participant_id)
                    .scene(&scene.scene_id)
                    .emit();
                self.requeue_dissolved_group(pending, &scene, None).await;
            }
        }
    }

    /// Probe timer fired without every pair resolving: dissolve.
    pub(crate) async fn handle_probe_timeout(&self, scene_id: SceneId, group_id: Uuid) {
        let Some(scene) = self.scene_spec_by_id(&scene_id) else {
            return;
        };

        let dissolved = {
            let mut rooms = self.registry.waiting.lock().await;
            let room = rooms.room_mut(&scene_id);
            match room.take_pending_group(&group_id) {
                Some(pending) if pending.phase == PendingPhase::Probing => Some(pending),
                Some(pending) => {
                    // Countdown already started; put it back untouched.
                    room.pending.push(pending);
                    None
                }
                None => None,
            }
        };

        if let Some(pending) = dissolved {
            emit(TelemetryKind::ProbeFailed)
                .scene(&scene_id)
                .details(serde_json::json!({"cause": "timeout"}))
                .emit();
            self.requeue_dissolved_group(pending, &scene, None).await;
        }
    }

    // -------------------------------------------------------------------
    // Group launch plumbing
    // -------------------------------------------------------------------

    /// Build the pending-group record for a freshly matched set. Runs under
    /// the waitroom lock; pure bookkeeping, no sends.
    fn park_group(
        &self,
        group: PlayerGroup,
        entries: Vec<WaitingEntry>,
        bot_slots: usize,
        scene: &SceneSpec,
    ) -> PendingGroup {
        let phase = if scene.probe_required && group.len() > 1 {
            PendingPhase::Probing
        } else {
            PendingPhase::Countdown
        };
        let probes = if phase == PendingPhase::Probing {
            group
                .pairs()
                .into_iter()
                .map(|(a, b)| ProbeSession::new(a, b))
                .collect()
        } else {
            Vec::new()
        };
        PendingGroup {
            group,
            phase,
            probes,
            entries,
            bot_slots,
            timer: CancellationToken::new(),
        }
    }

    /// Kick off probing or the countdown for a parked group. Called after
    /// the waitroom lock is released.
    async fn launch_pending_group(&self, pending: PendingGroup, scene: &SceneSpec) {
        match pending.phase {
            PendingPhase::Probing => {
                let probe_msgs: Vec<(ParticipantId, ServerMessage)> = pending
                    .probes
                    .iter()
                    .flat_map(|probe| {
                        [
                            (
                                probe.pair.0.clone(),
                                ServerMessage::ProbePrepare {
                                    probe_id: probe.probe_id,
                                    scene_id: scene.scene_id.clone(),
                                    is_initiator: true,
                                },
                            ),
                            (
                                probe.pair.1.clone(),
                                ServerMessage::ProbePrepare {
                                    probe_id: probe.probe_id,
                                    scene_id: scene.scene_id.clone(),
                                    is_initiator: false,
                                },
                            ),
                        ]
                    })
                    .collect();

                emit(TelemetryKind::ProbeStarted)
                    .scene(&scene.scene_id)
                    .details(serde_json::json!({"pairs": pending.probes.len()}))
                    .emit();

                let timer = pending.timer.clone();
                let group_id = pending.group.group_id;
                let scene_id = scene.scene_id.clone();
                {
                    let mut rooms = self.registry.waiting.lock().await;
                    rooms.room_mut(&scene.scene_id).pending.push(pending);
                }

                for (member, msg) in probe_msgs {
                    self.send_to_participant(&member, msg).await;
                }

                if let Some(server) = self.strong() {
                    let wait = Duration::from_secs(self.config.probe_timeout_secs);
                    let shutdown = self.shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            () = timer.cancelled() => {}
                            () = shutdown.cancelled() => {}
                            () = tokio::time::sleep(wait) => {
                                server.handle_probe_timeout(scene_id, group_id).await;
                            }
                        }
                    });
                }
            }
            PendingPhase::Countdown => {
                self.start_countdown(pending, scene).await;
            }
        }
    }

    /// Confirmed group: emit the countdown and arm the start timer. The
    /// countdown gives all clients a deterministic ready-check preamble.
    async fn start_countdown(&self, pending: PendingGroup, scene: &SceneSpec) {
        let members: Vec<ParticipantId> = pending.group.ordered_members.to_vec();
        let seconds = scene.countdown_seconds;

        for member in &members {
            self.send_to_participant(
                member,
                ServerMessage::MatchCountdown {
                    scene_id: scene.scene_id.clone(),
                    seconds,
                },
            )
            .await;
        }

        let timer = CancellationToken::new();
        let group_id = pending.group.group_id;
        let scene_id = scene.scene_id.clone();
        let mut pending = pending;
        pending.timer = timer.clone();
        pending.phase = PendingPhase::Countdown;
        {
            let mut rooms = self.registry.waiting.lock().await;
            rooms.room_mut(&scene.scene_id).pending.push(pending);
        }

        if let Some(server) = self.strong() {
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = timer.cancelled() => {}
                    () = shutdown.cancelled() => {}
                    () = tokio::time::sleep(Duration::from_secs(seconds)) => {
                        server.finalize_pending_group(scene_id, group_id).await;
                    }
                }
            });
        }
    }

    /// Countdown elapsed: pull the group out of the waitroom domain and
    /// hand it to the game lifecycle manager.
    pub(crate) async fn finalize_pending_group(&self, scene_id: SceneId, group_id: Uuid) {
        let Some(scene) = self.scene_spec_by_id(&scene_id) else {
            return;
        };

        let pending = {
            let mut rooms = self.registry.waiting.lock().await;
            rooms.room_mut(&scene_id).take_pending_group(&group_id)
        };
        let Some(pending) = pending else {
            return;
        };

        let probe_results: Vec<serde_json::Value> = pending
            .probes
            .iter()
            .map(|p| {
                serde_json::json!({
                    "pair": [p.pair.0, p.pair.1],
                    "rtt_ms": p.measured_rtt_ms,
                    "failed": p.failed,
                })
            })
            .collect();

        let bot_slots: Vec<u8> = (pending.group.len()
            ..pending.group.len() + pending.bot_slots)
            .map(|i| i as u8)
            .collect();

        self.create_game(
            &scene,
            pending.group,
            bot_slots,
            serde_json::Value::Array(probe_results),
        )
        .await;
    }

    /// A probing/countdown group fell apart: restore every surviving member
    /// to the queue with a fresh timeout window.
    async fn requeue_dissolved_group(
        &self,
        pending: PendingGroup,
        scene: &SceneSpec,
        exclude: Option<&ParticipantId>,
    ) {
        let mut timers: Vec<(ParticipantId, CancellationToken)> = Vec::new();

        {
            let mut rooms = self.registry.waiting.lock().await;
            let room = rooms.room_mut(&scene.scene_id);
            for mut entry in pending.entries {
                if Some(&entry.participant_id) == exclude {
                    continue;
                }
                entry.timeout_timer = CancellationToken::new();
                entry.arrived_at = tokio::time::Instant::now();
                timers.push((entry.participant_id.clone(), entry.timeout_timer.clone()));
                room.entries.push(entry);
            }
        }

        for (member, token) in timers {
            self.arm_waitroom_timer(
                member,
                token,
                Duration::from_secs(scene.waitroom_max_wait_sec),
            );
        }

        self.broadcast_waitroom_status(&scene.scene_id).await;
    }

    // -------------------------------------------------------------------
    // Status heartbeat
    // -------------------------------------------------------------------

    /// Queue snapshot for every member of a scene's waiting room, sent on
    /// each queue change and on the periodic status tick.
    pub(crate) async fn broadcast_waitroom_status(&self, scene_id: &SceneId) {
        let Some(scene) = self.scene_spec_by_id(scene_id) else {
            return;
        };

        let snapshot: Vec<(ParticipantId, u64)> = {
            let rooms = self.registry.waiting.lock().await;
            let Some(room) = rooms.rooms.get(scene_id) else {
                return;
            };
            room.entries
                .iter()
                .map(|e| {
                    (
                        e.participant_id.clone(),
                        e.arrived_at.elapsed().as_secs(),
                    )
                })
                .collect()
        };

        let waiting_count = snapshot.len();
        for (member, elapsed_sec) in snapshot {
            self.send_to_participant(
                &member,
                ServerMessage::WaitingRoomStatus(WaitroomStatus {
                    scene_id: scene_id.clone(),
                    waiting_count,
                    group_size: scene.group_size,
                    elapsed_sec,
                    max_wait_sec: scene.waitroom_max_wait_sec,
                }),
            )
            .await;
        }
    }

    /// Periodic waitroom status heartbeat, spawned at startup.
    pub async fn waitroom_status_task(self: std::sync::Arc<Self>) {
        let interval =
            Duration::from_secs(self.config.waitroom_status_interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let scene_ids: Vec<SceneId> = {
                let rooms = self.registry.waiting.lock().await;
                rooms
                    .rooms
                    .iter()
                    .filter(|(_, room)| !room.entries.is_empty())
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for scene_id in scene_ids {
                self.broadcast_waitroom_status(&scene_id).await;
            }
        }
    }

    // -------------------------------------------------------------------
    // Small lookups
    // -------------------------------------------------------------------

    fn arm_waitroom_timer(
        &self,
        participant_id: ParticipantId,
        token: CancellationToken,
        wait: Duration,
    ) {
        let Some(server) = self.strong() else {
            return;
        };
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(wait) => {
                    server.handle_waitroom_timeout(&participant_id).await;
                }
            }
        });
    }

    async fn scene_of_participant(&self, participant_id: &ParticipantId) -> Option<SceneId> {
        let table = self.registry.participants.read().await;
        table
            .session_of(participant_id)
            .and_then(|s| s.current_scene())
            .map(|scene| scene.scene_id.clone())
    }

    async fn scene_spec_of_participant(
        &self,
        participant_id: &ParticipantId,
    ) -> Option<SceneSpec> {
        let table = self.registry.participants.read().await;
        table
            .session_of(participant_id)
            .and_then(|s| s.current_scene())
            .cloned()
    }

    fn scene_spec_by_id(&self, scene_id: &SceneId) -> Option<SceneSpec> {
        self.experiment
            .scene_by_id(scene_id)
            .map(|(_, scene)| scene.clone())
    }
}
