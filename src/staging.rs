//! Bounded staging channel carrying PCM frames from TTS to the player.
//!
//! Single-producer/single-consumer per turn. Sends block when the queue is
//! full (backpressure, no drop policy); a pressure warning fires when
//! occupancy crosses 75%. The consumer can drain the queue wholesale on
//! barge-in.

use crate::error::{Result, VoiceError};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

/// Staging queue capacity in frames.
pub const STAGING_CAPACITY: usize = 32;

/// A frame travelling from TTS to the player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedFrame {
    /// Raw PCM bytes (s16le mono). `seq` is the sentence ordinal within
    /// the turn; the bytes themselves stay opaque.
    Pcm {
        /// Sentence ordinal, used by the player-restart policy.
        seq: u64,
        /// PCM payload.
        bytes: Bytes,
    },
    /// Sentinel: no more audio for this utterance.
    EndOfUtterance,
}

/// Producer half of the staging channel.
pub struct StagingSender {
    tx: mpsc::Sender<StagedFrame>,
    depth: Arc<AtomicUsize>,
    capacity: usize,
}

/// Consumer half of the staging channel.
pub struct StagingReceiver {
    rx: mpsc::Receiver<StagedFrame>,
    depth: Arc<AtomicUsize>,
}

/// Create a staging channel of the given capacity.
///
/// The returned gauge tracks live occupancy and is shared with the
/// diagnostics endpoint.
pub fn staging_channel(capacity: usize) -> (StagingSender, StagingReceiver, Arc<AtomicUsize>) {
    let depth = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = staging_channel_with_gauge(capacity, Arc::clone(&depth));
    (tx, rx, depth)
}

/// Create a staging channel that reports occupancy through an existing
/// gauge. Used by consecutive turns so diagnostics see one continuous
/// meter.
pub fn staging_channel_with_gauge(
    capacity: usize,
    depth: Arc<AtomicUsize>,
) -> (StagingSender, StagingReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    depth.store(0, Ordering::SeqCst);
    (
        StagingSender {
            tx,
            depth: Arc::clone(&depth),
            capacity,
        },
        StagingReceiver { rx, depth },
    )
}

impl StagingSender {
    /// Send a frame, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Fails with `Channel` when the consumer has gone away.
    pub async fn send(&self, frame: StagedFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| VoiceError::Channel("audio staging receiver dropped".into()))?;
        let occupancy = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        let pressure_mark = (self.capacity * 3).div_ceil(4);
        if occupancy == pressure_mark {
            warn!(
                occupancy,
                capacity = self.capacity,
                "audio staging under pressure"
            );
        }
        Ok(())
    }
}

impl StagingReceiver {
    /// Receive the next frame, waiting while the queue is empty.
    /// Returns `None` when the producer has gone away and the queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<StagedFrame> {
        let frame = self.rx.recv().await?;
        saturating_dec(&self.depth);
        Some(frame)
    }

    /// Empty the queue without blocking. Returns how many frames were
    /// discarded. Used by the barge-in path.
    pub fn drain(&mut self) -> usize {
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            saturating_dec(&self.depth);
            discarded += 1;
        }
        discarded
    }
}

/// Decrement without wrapping: a recv can race the producer's increment
/// for the same frame, so the gauge is best-effort, never negative.
fn saturating_dec(depth: &AtomicUsize) {
    let _ = depth.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| Some(d.saturating_sub(1)));
}
