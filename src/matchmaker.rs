//! Pluggable matchmaking strategies.
//!
//! A [`Matcher`] decides which queued participants form a group, what
//! happens when an entry times out, and how a mid-wait dropout affects the
//! rest of the queue. The waitroom invokes it synchronously while holding
//! the scene's waitroom lock, so `find_match` plus the subsequent removal
//! are atomic under concurrent arrivals.

use std::sync::Arc;

use crate::config::{SceneSpec, WaitroomTimeoutBehavior};
use crate::protocol::ParticipantId;
use crate::registry::WaitingEntry;

/// What to do with an entry whose waitroom timer fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutAction {
    /// End the scene and send the participant elsewhere.
    Redirect { url: Option<String> },
    /// Keep the entry queued and re-arm the timer.
    Continue,
    /// Form a group now, padding the missing slots with synthetic members.
    PairWithBots,
}

/// What to do when a queued participant's disconnect grace expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropoutAction {
    /// Dissolve the queue for this scene entirely.
    Cancel,
    /// Remove only the dropped entry; everyone else keeps waiting.
    ContinueWaiting,
}

/// Strategy for grouping arriving participants into fixed-size groups.
pub trait Matcher: Send + Sync {
    /// Pick a full group including `arriving`, or `None` to keep waiting.
    /// `waiting` is a queue-ordered snapshot that already contains the
    /// arriving entry. The returned ids must be drawn from `waiting`; their
    /// order becomes the group's player-index order.
    fn find_match(
        &self,
        arriving: &WaitingEntry,
        waiting: &[WaitingEntry],
        group_size: usize,
    ) -> Option<Vec<ParticipantId>>;

    /// Policy for an entry that outlived the scene's waitroom window. The
    /// default follows the scene configuration.
    fn on_timeout(&self, _entry: &WaitingEntry, scene: &SceneSpec) -> TimeoutAction {
        match scene.waitroom_timeout_behavior {
            WaitroomTimeoutBehavior::Redirect => TimeoutAction::Redirect {
                url: scene.redirect_url.clone(),
            },
            WaitroomTimeoutBehavior::Continue => TimeoutAction::Continue,
            WaitroomTimeoutBehavior::PairWithBots => TimeoutAction::PairWithBots,
        }
    }

    /// Policy for a dropout mid-wait. The default removes the entry and
    /// keeps the remaining participants queued.
    fn on_dropout(&self, _entry: &WaitingEntry, _remaining: usize) -> DropoutAction {
        DropoutAction::ContinueWaiting
    }
}

/// First-in-first-out matching: the first `group_size` queued entries form
/// a group as soon as the queue is deep enough.
#[derive(Debug, Default)]
pub struct FifoMatcher;

impl Matcher for FifoMatcher {
    fn find_match(
        &self,
        _arriving: &WaitingEntry,
        waiting: &[WaitingEntry],
        group_size: usize,
    ) -> Option<Vec<ParticipantId>> {
        if waiting.len() < group_size {
            return None;
        }
        Some(
            waiting[..group_size]
                .iter()
                .map(|e| e.participant_id.clone())
                .collect(),
        )
    }
}

/// Resolve a matcher implementation by its configured name. Unknown names
/// fall back to FIFO with a warning so a typo degrades instead of wedging
/// the scene.
pub fn build_matcher(name: &str) -> Arc<dyn Matcher> {
    match name {
        "fifo" => Arc::new(FifoMatcher),
        other => {
            tracing::warn!(matcher = %other, "unknown matcher name, falling back to fifo");
            Arc::new(FifoMatcher)
        }
    }
}
