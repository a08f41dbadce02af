//! Per-slot render state.
//!
//! The state is owned by the slot and shared with pipeline stages through
//! [`SharedRenderState`]. The lock is synchronous and is never held across
//! an `.await`; callers mutate through short closures.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use serde::Serialize;

use crate::frame::FrameKind;
use crate::headers::{CreativeSize, RenderMode};
use crate::render::{EmbedHandle, FrameId};

/// Mutable render state of one slot.
#[derive(Default)]
pub struct SlotRenderState {
    /// The frame currently attached to the slot.
    pub active_frame: Option<(FrameId, FrameKind)>,
    /// Handle to the friendly embed, for first-party renders.
    pub embed: Option<Arc<dyn EmbedHandle>>,
    /// A refresh is in progress; the old creative is being held.
    pub is_refreshing: bool,
    /// The slot has been collapsed.
    pub is_collapsed: bool,
    /// Slot size before the first size change, restored on teardown.
    pub original_size: Option<CreativeSize>,
    /// Ad URL of the current generation.
    pub ad_url: Option<String>,
    /// Raw creative retained for cross-domain rendering.
    pub creative_body: Option<Bytes>,
    /// Creative size from the response, if any.
    pub creative_size: Option<CreativeSize>,
    /// Cross-domain render mode, `None` for the default GET iframe.
    pub render_mode: Option<RenderMode>,
    /// Safeframe version in use.
    pub safeframe_version: String,
    /// Post-response experiment features.
    pub experiment_features: BTreeMap<String, String>,
    /// The rendered creative passed validation.
    pub is_verified_amp_creative: bool,
    /// The rendered creative is first-party.
    pub is_first_party: bool,
}

impl SlotRenderState {
    /// Creates the initial state.
    #[must_use]
    pub fn new(safeframe_version: impl Into<String>) -> Self {
        Self {
            safeframe_version: safeframe_version.into(),
            ..Self::default()
        }
    }

    /// Detaches the current frame and embed.
    ///
    /// While refreshing the old creative is held unless `force` is set.
    /// Returns the detached frame, if any, so the caller can remove it from
    /// the host outside the lock.
    pub fn take_frame(&mut self, force: bool) -> Option<DetachedFrame> {
        if self.is_refreshing && !force {
            return None;
        }
        let frame = self.active_frame.take();
        let embed = self.embed.take();
        self.is_first_party = false;
        if frame.is_none() && embed.is_none() {
            return None;
        }
        Some(DetachedFrame {
            frame: frame.map(|(id, _)| id),
            embed,
        })
    }

    /// Returns a serializable view of the state.
    #[must_use]
    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            frame_kind: self.active_frame.as_ref().map(|(_, kind)| *kind),
            is_refreshing: self.is_refreshing,
            is_collapsed: self.is_collapsed,
            original_size: self.original_size,
            ad_url: self.ad_url.clone(),
            has_creative_body: self.creative_body.is_some(),
            creative_size: self.creative_size,
            render_mode: self.render_mode,
            safeframe_version: self.safeframe_version.clone(),
            experiment_features: self.experiment_features.clone(),
            is_verified_amp_creative: self.is_verified_amp_creative,
            is_first_party: self.is_first_party,
        }
    }
}

impl fmt::Debug for SlotRenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotRenderState")
            .field("active_frame", &self.active_frame)
            .field("has_embed", &self.embed.is_some())
            .field("is_refreshing", &self.is_refreshing)
            .field("is_collapsed", &self.is_collapsed)
            .field("render_mode", &self.render_mode)
            .finish_non_exhaustive()
    }
}

/// A frame removed from the state, pending host cleanup.
pub struct DetachedFrame {
    /// Frame to remove from the host.
    pub frame: Option<FrameId>,
    /// Embed to destroy.
    pub embed: Option<Arc<dyn EmbedHandle>>,
}

/// Serializable view of [`SlotRenderState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    /// Kind of the attached frame.
    pub frame_kind: Option<FrameKind>,
    /// A refresh is in progress.
    pub is_refreshing: bool,
    /// The slot is collapsed.
    pub is_collapsed: bool,
    /// Saved original size.
    pub original_size: Option<CreativeSize>,
    /// Current ad URL.
    pub ad_url: Option<String>,
    /// A creative body is retained.
    pub has_creative_body: bool,
    /// Creative size from the response.
    pub creative_size: Option<CreativeSize>,
    /// Cross-domain render mode.
    pub render_mode: Option<RenderMode>,
    /// Safeframe version.
    pub safeframe_version: String,
    /// Experiment features.
    pub experiment_features: BTreeMap<String, String>,
    /// The creative passed validation.
    pub is_verified_amp_creative: bool,
    /// The creative is rendered first-party.
    pub is_first_party: bool,
}

/// Shared handle to a slot's render state.
#[derive(Debug, Clone, Default)]
pub struct SharedRenderState {
    inner: Arc<Mutex<SlotRenderState>>,
}

impl SharedRenderState {
    /// Wraps an initial state.
    #[must_use]
    pub fn new(state: SlotRenderState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Mutates the state under the lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut SlotRenderState) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Reads the state under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&SlotRenderState) -> R) -> R {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Returns a snapshot of the state.
    #[must_use]
    pub fn snapshot(&self) -> SlotSnapshot {
        self.read(SlotRenderState::snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_frame_holds_while_refreshing() {
        let mut state = SlotRenderState::new("1-0-40");
        state.active_frame = Some((FrameId(3), FrameKind::Safeframe));
        state.is_refreshing = true;

        assert!(state.take_frame(false).is_none());
        assert!(state.active_frame.is_some());

        let detached = state.take_frame(true).unwrap();
        assert_eq!(detached.frame, Some(FrameId(3)));
        assert!(state.active_frame.is_none());
    }

    #[test]
    fn test_take_frame_without_frame() {
        let mut state = SlotRenderState::new("1-0-40");
        assert!(state.take_frame(false).is_none());
    }

    #[test]
    fn test_snapshot() {
        let shared = SharedRenderState::new(SlotRenderState::new("1-0-40"));
        shared.update(|state| {
            state.creative_size = Some(CreativeSize::new(320, 50));
            state.render_mode = Some(RenderMode::Safeframe);
        });
        let snapshot = shared.snapshot();
        assert_eq!(snapshot.creative_size, Some(CreativeSize::new(320, 50)));
        assert_eq!(snapshot.render_mode, Some(RenderMode::Safeframe));
        assert_eq!(snapshot.safeframe_version, "1-0-40");
        assert!(!snapshot.has_creative_body);
    }
}
