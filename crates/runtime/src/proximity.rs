//! Classifies whether the user is physically present or talking remotely by
//! comparing the input embedding against four fixed anchor descriptions.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use hearth_memory::Embedder;
use hearth_memory::embedding::cosine_similarity;

/// Inputs shorter than this borrow the previous user message for context.
const SHORT_INPUT_CHARS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProximityState {
    Physical,
    Remote,
    TransitionToward,
    TransitionAway,
}

impl ProximityState {
    pub const ALL: [ProximityState; 4] = [
        Self::Physical,
        Self::Remote,
        Self::TransitionAway,
        Self::TransitionToward,
    ];

    /// Transitions collapse onto the state they lead to.
    pub fn settled(self) -> Self {
        match self {
            Self::TransitionToward => Self::Physical,
            Self::TransitionAway => Self::Remote,
            other => other,
        }
    }

    fn anchor_text(self) -> &'static str {
        match self {
            Self::Physical => {
                "search_document: user is sitting together physical presence face to face in the same room close proximity intimate"
            }
            Self::Remote => {
                "search_document: user is texting chatting remotely over phone messaging app discord far away not present"
            }
            Self::TransitionAway => {
                "search_document: user is leaving walking away exiting saying goodbye going out departing"
            }
            Self::TransitionToward => {
                "search_document: user is arriving entering the room sitting down coming closer approaching"
            }
        }
    }
}

impl fmt::Display for ProximityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Physical => "PHYSICAL",
            Self::Remote => "REMOTE",
            Self::TransitionToward => "TRANSITION_TOWARD",
            Self::TransitionAway => "TRANSITION_AWAY",
        };
        f.write_str(name)
    }
}

/// Session-scoped proximity state.  Only the detector mutates it.
#[derive(Debug, Clone)]
pub struct ProximityTracker {
    current: ProximityState,
    last_injected: Option<ProximityState>,
    pending: bool,
}

impl Default for ProximityTracker {
    fn default() -> Self {
        Self {
            current: ProximityState::Remote,
            last_injected: None,
            pending: false,
        }
    }
}

impl ProximityTracker {
    pub fn current(&self) -> ProximityState {
        self.current
    }

    pub fn last_injected(&self) -> Option<ProximityState> {
        self.last_injected
    }

    /// Record a confident detection.  Returns whether it differs from what
    /// was last injected into a prompt.
    fn observe(&mut self, detected: ProximityState) -> bool {
        let settled = detected.settled();
        self.current = settled;
        if self.last_injected == Some(settled) {
            return false;
        }
        self.last_injected = Some(settled);
        self.pending = true;
        true
    }

    /// Proximity text to inject this turn, or an empty string when nothing
    /// new needs saying.  The first turn of a session always gets one; later
    /// turns only after a detected change.  The packet wraps it in its
    /// `<distance_context>` section.
    pub fn get_proximity_block(&mut self, first_turn: bool, agent_name: &str) -> String {
        if !first_turn && !self.pending {
            return String::new();
        }
        self.pending = false;
        self.last_injected = Some(self.current);

        match self.current {
            ProximityState::Physical => format!("{agent_name} is right next to them."),
            ProximityState::Remote => {
                format!("{agent_name} is speaking through messages or thinking.")
            }
            other => format!("Current proximity state: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub state: ProximityState,
    pub changed: bool,
    pub score: f32,
}

pub struct ProximityDetector {
    embedder: Arc<dyn Embedder>,
    anchors: Vec<(ProximityState, Vec<f32>)>,
    threshold: f32,
}

impl ProximityDetector {
    /// Embed the four anchors.  If the embedder is unavailable the detector
    /// is built without anchors and never signals a change.
    pub async fn new(embedder: Arc<dyn Embedder>, threshold: f32) -> Self {
        let mut anchors = Vec::with_capacity(ProximityState::ALL.len());
        for state in ProximityState::ALL {
            match embedder.embed(state.anchor_text()).await {
                Ok(vector) => anchors.push((state, vector)),
                Err(err) => {
                    warn!(error = %err, "proximity anchors unavailable, detection disabled");
                    anchors.clear();
                    break;
                }
            }
        }
        Self {
            embedder,
            anchors,
            threshold,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.anchors.is_empty()
    }

    /// Classify `input`, updating `tracker` when the best anchor clears the
    /// threshold.
    pub async fn detect_state(
        &self,
        tracker: &mut ProximityTracker,
        input: &str,
        previous_input: Option<&str>,
    ) -> Detection {
        let unchanged = |score| Detection {
            state: tracker.current(),
            changed: false,
            score,
        };
        if !self.is_active() || input.trim().is_empty() {
            return unchanged(0.0);
        }

        let query = match previous_input {
            Some(prev) if input.chars().count() < SHORT_INPUT_CHARS && !prev.is_empty() => {
                format!("search_query: {prev} {input}")
            }
            _ => format!("search_query: {input}"),
        };
        let vector = match self.embedder.embed(&query).await {
            Ok(vector) => vector,
            Err(err) => {
                debug!(error = %err, "proximity embedding failed");
                return unchanged(0.0);
            }
        };

        let Some((best, score)) = self
            .anchors
            .iter()
            .map(|(state, anchor)| (*state, cosine_similarity(&vector, anchor)))
            .fold(None, |best: Option<(ProximityState, f32)>, (state, score)| match best {
                Some((_, top)) if top >= score => best,
                _ => Some((state, score)),
            })
        else {
            return unchanged(0.0);
        };

        if score <= self.threshold {
            return unchanged(score);
        }
        let changed = tracker.observe(best);
        if changed {
            debug!(detected = %best, state = %tracker.current(), score, "proximity changed");
        }
        Detection {
            state: tracker.current(),
            changed,
            score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::KeywordEmbedder;
    use hearth_memory::DisabledEmbedder;

    async fn detector() -> ProximityDetector {
        ProximityDetector::new(Arc::new(KeywordEmbedder), 0.45).await
    }

    #[test]
    fn transitions_settle() {
        assert_eq!(ProximityState::TransitionToward.settled(), ProximityState::Physical);
        assert_eq!(ProximityState::TransitionAway.settled(), ProximityState::Remote);
        assert_eq!(ProximityState::Physical.settled(), ProximityState::Physical);
    }

    #[tokio::test]
    async fn arrival_switches_to_physical_once() {
        let detector = detector().await;
        let mut tracker = ProximityTracker::default();
        // First turn injects the default remote state.
        assert!(tracker.get_proximity_block(true, "Wren").contains("messages"));

        let first = detector
            .detect_state(&mut tracker, "I walk in and sit down, arriving at last", None)
            .await;
        assert_eq!(first.state, ProximityState::Physical);
        assert!(first.changed);
        assert!(first.score > 0.45);

        let second = detector
            .detect_state(&mut tracker, "arriving and sitting closer", None)
            .await;
        assert_eq!(second.state, ProximityState::Physical);
        assert!(!second.changed);
    }

    #[tokio::test]
    async fn block_only_after_change() {
        let detector = detector().await;
        let mut tracker = ProximityTracker::default();
        assert!(!tracker.get_proximity_block(true, "Wren").is_empty());
        assert!(tracker.get_proximity_block(false, "Wren").is_empty());

        detector
            .detect_state(&mut tracker, "face to face in the same room", None)
            .await;
        let block = tracker.get_proximity_block(false, "Wren");
        assert_eq!(block, "Wren is right next to them.");
        assert!(tracker.get_proximity_block(false, "Wren").is_empty());
    }

    #[tokio::test]
    async fn weak_signal_keeps_state() {
        let detector = detector().await;
        let mut tracker = ProximityTracker::default();
        let detection = detector
            .detect_state(&mut tracker, "what is for dinner", None)
            .await;
        assert!(!detection.changed);
        assert_eq!(detection.state, ProximityState::Remote);
    }

    #[tokio::test]
    async fn unavailable_embedder_never_signals() {
        let detector = ProximityDetector::new(Arc::new(DisabledEmbedder { dimension: 8 }), 0.45).await;
        assert!(!detector.is_active());
        let mut tracker = ProximityTracker::default();
        let detection = detector
            .detect_state(&mut tracker, "walking away, goodbye", None)
            .await;
        assert_eq!(detection.state, ProximityState::Remote);
        assert!(!detection.changed);
    }
}
