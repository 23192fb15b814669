use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Playout mixer for decoded remote audio.
///
/// Each remote user writes into the shared timeline at its own cursor, so
/// two users speaking at once are summed rather than queued one after the
/// other. The platform output pulls mixed samples from the head.
///
/// Capacity is bounded: when the consumer falls behind, the oldest samples
/// are discarded.
pub struct AudioPlayoutBuffer {
    state: Mutex<MixState>,
    /// Maximum number of samples held (2 seconds at 48kHz mono = 96_000).
    max_samples: usize,
}

#[derive(Default)]
struct MixState {
    mix: VecDeque<i32>,
    /// Next write offset of each source, relative to the read head.
    cursors: HashMap<u64, usize>,
}

impl MixState {
    fn advance(&mut self, n: usize) {
        for cursor in self.cursors.values_mut() {
            *cursor = cursor.saturating_sub(n);
        }
    }
}

impl Default for AudioPlayoutBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioPlayoutBuffer {
    pub fn new() -> Self {
        Self::with_capacity(48_000 * 2)
    }

    pub fn with_capacity(max_samples: usize) -> Self {
        Self {
            state: Mutex::new(MixState {
                mix: VecDeque::with_capacity(max_samples),
                cursors: HashMap::new(),
            }),
            max_samples,
        }
    }

    /// Add `samples` from `source` to the timeline.
    pub fn mix(&self, source: u64, samples: &[i16]) {
        let mut state = self.state.lock().expect("playout lock poisoned");
        let start = *state.cursors.get(&source).unwrap_or(&0);
        let end = start + samples.len();
        if state.mix.len() < end {
            state.mix.resize(end, 0);
        }
        for (slot, sample) in state.mix.range_mut(start..end).zip(samples) {
            *slot += i32::from(*sample);
        }
        state.cursors.insert(source, end);

        let overflow = state.mix.len().saturating_sub(self.max_samples);
        if overflow > 0 {
            state.mix.drain(..overflow);
            state.advance(overflow);
        }
    }

    /// Single-source convenience, used for local loopback.
    pub fn push_samples(&self, samples: &[i16]) {
        self.mix(0, samples);
    }

    /// Pull up to `out.len()` mixed samples. Returns how many were written;
    /// the rest of `out` is zeroed (silence).
    pub fn pull_samples(&self, out: &mut [i16]) -> usize {
        let mut state = self.state.lock().expect("playout lock poisoned");
        let available = state.mix.len().min(out.len());

        for (slot, sample) in out.iter_mut().zip(state.mix.drain(..available)) {
            *slot = sample.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        }
        for sample in out[available..].iter_mut() {
            *sample = 0;
        }
        state.advance(available);
        available
    }

    /// Forget a source, e.g. when its user leaves.
    pub fn remove_source(&self, source: u64) {
        self.state
            .lock()
            .expect("playout lock poisoned")
            .cursors
            .remove(&source);
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().expect("playout lock poisoned").mix.len()
    }

    /// Clear all buffered samples (e.g., on disconnect).
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("playout lock poisoned");
        state.mix.clear();
        state.cursors.clear();
    }
}
