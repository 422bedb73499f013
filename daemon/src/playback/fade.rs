use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::EngineEvent;

/// How often a running fade reports an intermediate value
const FADE_TICK: Duration = Duration::from_millis(16);

/// Shape of a fade between its start and end value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FadeCurve {
    Linear,
    /// Smoothstep; flat at both ends
    #[default]
    Smooth,
    /// Half a cosine period
    Sine,
}

impl FadeCurve {
    /// Map elapsed fraction `t` to fade fraction, both in 0.0..=1.0
    pub fn apply(&self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Self::Linear => t,
            Self::Smooth => t * t * (3.0 - 2.0 * t),
            Self::Sine => (1.0 - (std::f32::consts::PI * t).cos()) / 2.0,
        }
    }
}

/// What a fade drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FadeTarget {
    /// Opacity of the cover drawn over every surface (1.0 hides the video)
    Cover,
    /// Audio volume of the current stream
    Volume,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FadeKind {
    Tick(f32),
    Done(f32),
}

/// Progress report from a running fade task
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FadeEvent {
    pub target: FadeTarget,
    pub fade_id: u64,
    pub generation: u64,
    pub kind: FadeKind,
}

/// Runs fades as cancellable tasks, at most one per target.
///
/// The tasks never touch playback state themselves; they only report values
/// back through the engine's event channel.
pub struct Fader {
    tx: mpsc::UnboundedSender<EngineEvent>,
    next_id: u64,
    active: HashMap<FadeTarget, (u64, AbortHandle)>,
    curve: FadeCurve,
}

impl Fader {
    pub fn new(tx: mpsc::UnboundedSender<EngineEvent>, curve: FadeCurve) -> Self {
        Self {
            tx,
            next_id: 0,
            active: HashMap::new(),
            curve,
        }
    }

    /// Start fading `target` from `from` to `to`, replacing any fade already
    /// running on that target
    pub fn start(
        &mut self,
        target: FadeTarget,
        generation: u64,
        from: f32,
        to: f32,
        duration: Duration,
    ) -> u64 {
        self.cancel(target);
        self.next_id += 1;
        let fade_id = self.next_id;

        log::debug!(
            "Fade {:?} #{} (gen {}): {:.2} -> {:.2} over {}ms",
            target,
            fade_id,
            generation,
            from,
            to,
            duration.as_millis()
        );

        let tx = self.tx.clone();
        let curve = self.curve;
        let send = move |kind| {
            let _ = tx.send(EngineEvent::Fade(FadeEvent {
                target,
                fade_id,
                generation,
                kind,
            }));
        };

        let task = tokio::spawn(async move {
            if !duration.is_zero() {
                let started = tokio::time::Instant::now();
                let mut ticker = tokio::time::interval(FADE_TICK);
                loop {
                    ticker.tick().await;
                    let t = started.elapsed().as_secs_f32() / duration.as_secs_f32();
                    if t >= 1.0 {
                        break;
                    }
                    send(FadeKind::Tick(from + (to - from) * curve.apply(t)));
                }
            }
            send(FadeKind::Done(to));
        });

        self.active.insert(target, (fade_id, task.abort_handle()));
        fade_id
    }

    pub fn cancel(&mut self, target: FadeTarget) {
        if let Some((id, handle)) = self.active.remove(&target) {
            log::debug!("Cancelling fade {:?} #{}", target, id);
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.active.drain() {
            handle.abort();
        }
    }

    /// Whether `fade_id` is the fade currently running on `target`
    pub fn is_current(&self, target: FadeTarget, fade_id: u64) -> bool {
        self.active.get(&target).is_some_and(|(id, _)| *id == fade_id)
    }

    pub fn finish(&mut self, target: FadeTarget) {
        self.active.remove(&target);
    }

    #[cfg(test)]
    pub fn is_running(&self, target: FadeTarget) -> bool {
        self.active.contains_key(&target)
    }
}

impl Drop for Fader {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
