//! Conversation state machine.
//!
//! Six states gate the half-duplex pipeline. The machine is a pure
//! function of (current state, event); it carries no other state beyond
//! the two VAD thresholds it derives from.

use crate::error::{Result, VoiceError};
use tracing::error;

/// The six conversation states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// Waiting for speech; microphone gated by VAD only.
    Idle,
    /// User is speaking; frames stream to STT.
    Listening,
    /// Committed transcript is being processed by the LLM (and tools).
    Processing,
    /// Assistant audio is playing; VAD threshold is elevated.
    Speaking,
    /// Turn finished; a short window where follow-ups skip the wake path.
    Active,
    /// Playback was interrupted by user speech; cleanup in progress.
    Interrupted,
}

impl ConversationState {
    /// Stable lowercase name, used in logs and HTTP responses.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::Active => "active",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Events that drive transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// VAD reported sustained speech.
    SpeechDetected,
    /// STT committed the utterance.
    UtteranceComplete,
    /// First TTS frame reached the staging channel.
    TtsStarted,
    /// The model requested tools; another LLM iteration follows.
    ToolIteration,
    /// Playback drained to completion.
    TtsComplete,
    /// Barge-in cleanup finished.
    InterruptHandled,
    /// The ACTIVE window elapsed without speech.
    ActiveTimeout,
}

impl StateEvent {
    /// Stable name for logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SpeechDetected => "speech_detected",
            Self::UtteranceComplete => "utterance_complete",
            Self::TtsStarted => "tts_started",
            Self::ToolIteration => "tool_iteration",
            Self::TtsComplete => "tts_complete",
            Self::InterruptHandled => "interrupt_handled",
            Self::ActiveTimeout => "active_timeout",
        }
    }
}

/// Listener invoked after every successful transition.
pub type TransitionListener =
    Box<dyn Fn(ConversationState, StateEvent, ConversationState) + Send + Sync>;

/// The conversation state machine.
///
/// Derives the VAD threshold from the current state: elevated while
/// `Speaking` (so speaker bleed needs a deliberate interruption), normal
/// everywhere else.
pub struct StateMachine {
    state: ConversationState,
    vad_normal: f32,
    vad_speaking: f32,
    listeners: Vec<TransitionListener>,
}

impl StateMachine {
    /// Create a machine in `Idle` with the given VAD thresholds.
    pub fn new(vad_normal: f32, vad_speaking: f32) -> Self {
        Self {
            state: ConversationState::Idle,
            vad_normal,
            vad_speaking,
            listeners: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConversationState {
        self.state
    }

    /// VAD threshold for the current state.
    pub fn vad_threshold(&self) -> f32 {
        if self.state == ConversationState::Speaking {
            self.vad_speaking
        } else {
            self.vad_normal
        }
    }

    /// Register a listener called after each successful transition.
    pub fn on_transition(&mut self, listener: TransitionListener) {
        self.listeners.push(listener);
    }

    /// The transition table. `None` means the pair is illegal.
    fn target(from: ConversationState, event: StateEvent) -> Option<ConversationState> {
        use ConversationState as S;
        use StateEvent as E;
        match (from, event) {
            (S::Idle, E::SpeechDetected) => Some(S::Listening),
            (S::Listening, E::UtteranceComplete) => Some(S::Processing),
            (S::Processing, E::TtsStarted) => Some(S::Speaking),
            (S::Processing, E::ToolIteration) => Some(S::Processing),
            // Audio for a pre-tool sentence may already be playing when the
            // model asks for a tool; the iteration returns to Processing.
            (S::Speaking, E::ToolIteration) => Some(S::Processing),
            (S::Speaking, E::TtsComplete) => Some(S::Active),
            (S::Speaking, E::SpeechDetected) => Some(S::Interrupted),
            (S::Interrupted, E::InterruptHandled) => Some(S::Listening),
            (S::Active, E::SpeechDetected) => Some(S::Listening),
            (S::Active, E::ActiveTimeout) => Some(S::Idle),
            _ => None,
        }
    }

    /// Apply an event, returning the new state.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidTransition` when the (state, event) pair is not
    /// in the table. In debug builds this also panics (programmer error);
    /// release callers log and ignore.
    pub fn apply(&mut self, event: StateEvent) -> Result<ConversationState> {
        let from = self.state;
        let Some(to) = Self::target(from, event) else {
            let err = VoiceError::InvalidTransition {
                from: from.as_str(),
                event: event.as_str(),
            };
            debug_assert!(false, "{err}");
            error!("{err}");
            return Err(err);
        };
        self.state = to;
        for listener in &self.listeners {
            listener(from, event, to);
        }
        Ok(to)
    }

    /// `Speaking -> Active`, but only if the state is still `Speaking`.
    ///
    /// This is the completion side of the barge-in race: whichever of
    /// `TtsComplete` and `SpeechDetected` takes the state lock first wins,
    /// and the loser observes the changed state and stands down.
    pub fn try_complete_speaking(&mut self) -> bool {
        if self.state != ConversationState::Speaking {
            return false;
        }
        let from = self.state;
        self.state = ConversationState::Active;
        for listener in &self.listeners {
            listener(from, StateEvent::TtsComplete, self.state);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use ConversationState as S;
    use StateEvent as E;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ALL_STATES: [S; 6] = [
        S::Idle,
        S::Listening,
        S::Processing,
        S::Speaking,
        S::Active,
        S::Interrupted,
    ];
    const ALL_EVENTS: [E; 7] = [
        E::SpeechDetected,
        E::UtteranceComplete,
        E::TtsStarted,
        E::ToolIteration,
        E::TtsComplete,
        E::InterruptHandled,
        E::ActiveTimeout,
    ];

    const LEGAL: [(S, E, S); 10] = [
        (S::Idle, E::SpeechDetected, S::Listening),
        (S::Listening, E::UtteranceComplete, S::Processing),
        (S::Processing, E::TtsStarted, S::Speaking),
        (S::Processing, E::ToolIteration, S::Processing),
        (S::Speaking, E::ToolIteration, S::Processing),
        (S::Speaking, E::TtsComplete, S::Active),
        (S::Speaking, E::SpeechDetected, S::Interrupted),
        (S::Interrupted, E::InterruptHandled, S::Listening),
        (S::Active, E::SpeechDetected, S::Listening),
        (S::Active, E::ActiveTimeout, S::Idle),
    ];

    fn machine_in(state: S) -> StateMachine {
        let mut sm = StateMachine::new(0.5, 0.8);
        sm.state = state;
        sm
    }

    #[test]
    fn initial_state_is_idle() {
        assert_eq!(StateMachine::new(0.5, 0.8).state(), S::Idle);
    }

    #[test]
    fn legal_transitions_all_accepted() {
        for (from, event, to) in LEGAL {
            let mut sm = machine_in(from);
            assert_eq!(sm.apply(event).unwrap(), to, "{from:?} --{event:?}--> ?");
        }
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn every_other_pair_is_rejected() {
        for from in ALL_STATES {
            for event in ALL_EVENTS {
                if LEGAL.iter().any(|(f, e, _)| *f == from && *e == event) {
                    continue;
                }
                let mut sm = machine_in(from);
                let err = sm.apply(event).unwrap_err();
                assert!(matches!(err, VoiceError::InvalidTransition { .. }));
                assert_eq!(sm.state(), from, "rejected event must not move the state");
            }
        }
    }

    #[test]
    fn illegal_pair_table_is_exhaustive() {
        // The table itself must reject everything not in LEGAL, including
        // in debug builds where `apply` would panic.
        for from in ALL_STATES {
            for event in ALL_EVENTS {
                let expected = LEGAL
                    .iter()
                    .find(|(f, e, _)| *f == from && *e == event)
                    .map(|(_, _, to)| *to);
                assert_eq!(StateMachine::target(from, event), expected);
            }
        }
    }

    #[test]
    fn vad_threshold_elevated_only_while_speaking() {
        for state in ALL_STATES {
            let sm = machine_in(state);
            let expected = if state == S::Speaking { 0.8 } else { 0.5 };
            assert_eq!(sm.vad_threshold(), expected, "{state:?}");
        }
    }

    #[test]
    fn listeners_fire_on_success_only() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut sm = StateMachine::new(0.5, 0.8);
        let c = Arc::clone(&count);
        sm.on_transition(Box::new(move |_, _, _| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        sm.apply(E::SpeechDetected).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn try_complete_speaking_wins_only_from_speaking() {
        let mut sm = machine_in(S::Speaking);
        assert!(sm.try_complete_speaking());
        assert_eq!(sm.state(), S::Active);

        // Already interrupted: completion loses the race and stands down.
        let mut sm = machine_in(S::Interrupted);
        assert!(!sm.try_complete_speaking());
        assert_eq!(sm.state(), S::Interrupted);
    }

    #[test]
    fn barge_in_path_round_trip() {
        let mut sm = machine_in(S::Speaking);
        sm.apply(E::SpeechDetected).unwrap();
        assert_eq!(sm.state(), S::Interrupted);
        sm.apply(E::InterruptHandled).unwrap();
        assert_eq!(sm.state(), S::Listening);
    }
}
