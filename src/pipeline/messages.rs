//! Message types passed between pipeline stages.

use bytes::Bytes;

/// Events crossing the microphone-thread boundary.
///
/// The capture callback runs on a real-time-ish OS thread and must never
/// block, so these are delivered through a bounded channel with
/// `try_send` (frames may be dropped under pressure; speech edges are
/// retried by the VAD on the next frame).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MicEvent {
    /// One raw input frame (s16le mono at the input sample rate).
    Frame(Bytes),
    /// The VAD crossed into speech on the microphone thread.
    SpeechStart,
}

/// Kind of transcript carried by a [`TranscriptEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptKind {
    /// May be superseded by later events.
    Partial,
    /// Committed; triggers utterance-end processing.
    Final,
}

/// A transcription result from the recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub kind: TranscriptKind,
    pub text: String,
}

/// Out-of-band events from the STT connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    /// The recognizer session is live.
    SessionStarted,
    /// A partial or committed transcript.
    Transcript(TranscriptEvent),
    /// The recognizer decided the utterance is over.
    UtteranceEnd,
    /// Connection-level failure; the client will reconnect on next send.
    Error(String),
}
