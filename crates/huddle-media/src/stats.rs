//! Receive-side statistics: frame rate, bitrate, loss and a coarse
//! three-level quality derived from loss.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    #[default]
    Unknown,
    Bad,
    Normal,
    Good,
}

impl NetworkQuality {
    pub fn from_loss_ratio(ratio: f64) -> Self {
        if ratio < 0.02 {
            NetworkQuality::Good
        } else if ratio < 0.10 {
            NetworkQuality::Normal
        } else {
            NetworkQuality::Bad
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamStatistics {
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    pub bitrate_kbps: u32,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub quality: NetworkQuality,
}

struct Sample {
    at: Instant,
    bytes: usize,
    lost: u64,
}

/// Rolling one-second view of one incoming stream.
pub struct StatsTracker {
    samples: VecDeque<Sample>,
    expected_next: Option<u64>,
    received: u64,
    lost: u64,
    width: u32,
    height: u32,
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsTracker {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            expected_next: None,
            received: 0,
            lost: 0,
            width: 0,
            height: 0,
        }
    }

    pub fn record(&mut self, now: Instant, sequence: u64, bytes: usize) {
        let lost = match self.expected_next {
            Some(expected) if sequence > expected => sequence - expected,
            _ => 0,
        };
        // Late packets do not move the expectation backwards.
        if self.expected_next.is_none_or(|e| sequence >= e) {
            self.expected_next = Some(sequence.saturating_add(1));
        }
        self.received = self.received.saturating_add(1);
        self.lost = self.lost.saturating_add(lost);
        self.samples.push_back(Sample { at: now, bytes, lost });
        self.trim(now);
    }

    pub fn set_dimensions(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    pub fn quality(&self) -> NetworkQuality {
        if self.samples.is_empty() {
            return NetworkQuality::Unknown;
        }
        let received = self.samples.len() as f64;
        let lost = self.samples.iter().fold(0u64, |acc, s| acc.saturating_add(s.lost));
        NetworkQuality::from_loss_ratio(lost as f64 / (received + lost as f64))
    }

    pub fn snapshot(&mut self, now: Instant) -> StreamStatistics {
        self.trim(now);
        let bytes = self
            .samples
            .iter()
            .fold(0u64, |acc, s| acc.saturating_add(s.bytes as u64));
        StreamStatistics {
            width: self.width,
            height: self.height,
            fps: self.samples.len() as f32 / WINDOW.as_secs_f32(),
            bitrate_kbps: u32::try_from(bytes.saturating_mul(8) / 1000).unwrap_or(u32::MAX),
            packets_received: self.received,
            packets_lost: self.lost,
            quality: self.quality(),
        }
    }

    fn trim(&mut self, now: Instant) {
        while let Some(front) = self.samples.front() {
            if now.saturating_duration_since(front.at) > WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_stream_is_good() {
        let mut t = StatsTracker::new();
        let t0 = Instant::now();
        for seq in 0..30 {
            t.record(t0 + Duration::from_millis(seq * 33), seq, 1000);
        }
        t.set_dimensions(640, 360);
        let stats = t.snapshot(t0 + Duration::from_millis(990));
        assert_eq!(stats.quality, NetworkQuality::Good);
        assert_eq!(stats.fps, 30.0);
        assert_eq!(stats.bitrate_kbps, 240);
        assert_eq!(stats.packets_lost, 0);
        assert_eq!((stats.width, stats.height), (640, 360));
    }

    #[test]
    fn gaps_degrade_quality() {
        let mut t = StatsTracker::new();
        let t0 = Instant::now();
        // Every third packet missing.
        for seq in (0..60).filter(|s| s % 3 != 2) {
            t.record(t0 + Duration::from_millis(seq * 10), seq, 100);
        }
        assert_eq!(t.quality(), NetworkQuality::Bad);
    }

    #[test]
    fn late_packets_do_not_count_as_loss() {
        let mut t = StatsTracker::new();
        let t0 = Instant::now();
        t.record(t0, 0, 10);
        t.record(t0, 2, 10);
        t.record(t0, 1, 10);
        t.record(t0, 3, 10);
        let stats = t.snapshot(t0);
        assert_eq!(stats.packets_lost, 1);
        assert_eq!(stats.packets_received, 4);
    }

    #[test]
    fn empty_is_unknown() {
        assert_eq!(StatsTracker::new().quality(), NetworkQuality::Unknown);
    }

    #[test]
    fn sequence_jump_to_max_saturates() {
        let mut t = StatsTracker::new();
        let t0 = Instant::now();
        t.record(t0, 0, 10);
        t.record(t0, u64::MAX, 10);
        t.record(t0, u64::MAX, usize::MAX);
        let stats = t.snapshot(t0);
        assert_eq!(stats.packets_lost, u64::MAX - 1);
        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.bitrate_kbps, u32::MAX);
        assert_eq!(stats.quality, NetworkQuality::Bad);
    }
}
