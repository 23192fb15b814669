//! Subscription bookkeeping on top of the fan-out router.
//!
//! Caps are checked when a subscription is created and never evict an
//! existing one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::fanout::{ConsumerId, FanoutRouter, RawDataConsumer, delivery_loop};
use crate::limiter::{CallRateLimiter, RateLimit};
use crate::stream::{Resolution, StreamKey, StreamKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionLimits {
    /// Concurrent video subscriptions at 720p or above.
    pub max_high_resolution: usize,
    /// Concurrent share subscriptions.
    pub max_shares: usize,
    /// Concurrent subscriptions of any kind.
    pub max_total: usize,
    /// Applies to subscribe and unsubscribe calls together.
    pub rate_limit: RateLimit,
}

impl Default for SubscriptionLimits {
    fn default() -> Self {
        Self {
            max_high_resolution: 2,
            max_shares: 2,
            max_total: 25,
            rate_limit: RateLimit::default(),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscribeError {
    #[error("concurrent subscription limit exceeded")]
    ExceededLimit,
    #[error("another subscription already holds the exclusive resolution tier")]
    ExclusiveTierTaken,
    #[error("share subscription limit reached")]
    ShareLimit,
    #[error("subscribe calls are too frequent")]
    TooFrequent,
    #[error("consumer is already subscribed to this stream")]
    AlreadySubscribed,
    #[error("consumer is not subscribed to this stream")]
    NotSubscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

struct Subscription {
    id: SubscriptionId,
    resolution: Resolution,
    cancel_tx: watch::Sender<bool>,
    _handle: JoinHandle<()>,
}

impl Subscription {
    fn cancel(self) {
        let _ = self.cancel_tx.send(true);
    }
}

/// Subscription table for one session. Must be used from within a tokio
/// runtime: each subscription owns a delivery task.
pub struct SubscriptionManager {
    router: Arc<FanoutRouter>,
    limits: SubscriptionLimits,
    limiter: CallRateLimiter,
    subs: HashMap<(ConsumerId, StreamKey), Subscription>,
    next_id: u64,
}

impl SubscriptionManager {
    pub fn new(router: Arc<FanoutRouter>, limits: SubscriptionLimits) -> Self {
        Self {
            router,
            limits,
            limiter: CallRateLimiter::new(limits.rate_limit),
            subs: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn limits(&self) -> &SubscriptionLimits {
        &self.limits
    }

    pub fn subscribe(
        &mut self,
        key: StreamKey,
        resolution: Resolution,
        consumer: Arc<dyn RawDataConsumer>,
    ) -> Result<SubscriptionId, SubscribeError> {
        if !self.limiter.try_acquire() {
            return Err(SubscribeError::TooFrequent);
        }
        let consumer_id = ConsumerId::of(&consumer);
        if self.subs.contains_key(&(consumer_id, key)) {
            return Err(SubscribeError::AlreadySubscribed);
        }
        self.check_caps(key, resolution, None)?;

        let id = SubscriptionId(self.next_id);
        self.next_id += 1;

        let rx = self.router.attach(key, consumer_id);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(delivery_loop(key, rx, consumer, cancel_rx));

        self.subs.insert(
            (consumer_id, key),
            Subscription {
                id,
                resolution,
                cancel_tx,
                _handle: handle,
            },
        );
        tracing::info!(stream = %key, ?resolution, subscription = id.0, "subscribed");
        Ok(id)
    }

    /// Acknowledged immediately; the delivery task winds down on its own.
    pub fn unsubscribe(
        &mut self,
        consumer: &Arc<dyn RawDataConsumer>,
        key: &StreamKey,
    ) -> Result<(), SubscribeError> {
        if !self.limiter.try_acquire() {
            return Err(SubscribeError::TooFrequent);
        }
        let consumer_id = ConsumerId::of(consumer);
        let sub = self
            .subs
            .remove(&(consumer_id, *key))
            .ok_or(SubscribeError::NotSubscribed)?;
        tracing::info!(stream = %key, subscription = sub.id.0, "unsubscribed");
        sub.cancel();
        self.router.detach(key, consumer_id);
        Ok(())
    }

    /// Change the requested resolution of an existing subscription.
    pub fn set_resolution(
        &mut self,
        consumer: &Arc<dyn RawDataConsumer>,
        key: &StreamKey,
        resolution: Resolution,
    ) -> Result<(), SubscribeError> {
        let consumer_id = ConsumerId::of(consumer);
        if !self.subs.contains_key(&(consumer_id, *key)) {
            return Err(SubscribeError::NotSubscribed);
        }
        self.check_caps(*key, resolution, Some((consumer_id, *key)))?;
        if let Some(sub) = self.subs.get_mut(&(consumer_id, *key)) {
            sub.resolution = resolution;
        }
        Ok(())
    }

    /// End every subscription on `key`, e.g. when its owner leaves.
    pub fn drop_stream(&mut self, key: &StreamKey) -> usize {
        let pairs: Vec<(ConsumerId, StreamKey)> =
            self.subs.keys().filter(|(_, k)| k == key).copied().collect();
        for pair in &pairs {
            if let Some(sub) = self.subs.remove(pair) {
                sub.cancel();
            }
            self.router.detach(key, pair.0);
        }
        if !pairs.is_empty() {
            tracing::info!(stream = %key, dropped = pairs.len(), "stream subscriptions dropped");
        }
        pairs.len()
    }

    /// Drop every subscription belonging to `user_id`.
    pub fn drop_user(&mut self, user_id: u64) -> usize {
        let keys: HashSet<StreamKey> = self
            .subs
            .keys()
            .map(|(_, k)| *k)
            .filter(|k| k.user_id == user_id)
            .collect();
        keys.iter().map(|k| self.drop_stream(k)).sum()
    }

    pub fn clear(&mut self) {
        for ((consumer, key), sub) in self.subs.drain() {
            sub.cancel();
            self.router.detach(&key, consumer);
        }
    }

    pub fn is_subscribed(&self, consumer: &Arc<dyn RawDataConsumer>, key: &StreamKey) -> bool {
        self.subs.contains_key(&(ConsumerId::of(consumer), *key))
    }

    pub fn count(&self) -> usize {
        self.subs.len()
    }

    pub fn high_resolution_count(&self) -> usize {
        self.subs
            .iter()
            .filter(|((_, k), s)| k.kind == StreamKind::Video && s.resolution.is_high())
            .count()
    }

    pub fn share_count(&self) -> usize {
        self.subs.keys().filter(|(_, k)| k.kind.is_share()).count()
    }

    /// Current (stream, resolution) pairs, in no particular order.
    pub fn subscriptions(&self) -> Vec<(StreamKey, Resolution)> {
        self.subs
            .iter()
            .map(|((_, key), sub)| (*key, sub.resolution))
            .collect()
    }

    fn check_caps(
        &self,
        key: StreamKey,
        resolution: Resolution,
        excluding: Option<(ConsumerId, StreamKey)>,
    ) -> Result<(), SubscribeError> {
        let others = self
            .subs
            .iter()
            .filter(|(pair, _)| Some(**pair) != excluding);

        let mut total = 0;
        let mut shares = 0;
        let mut high = 0;
        let mut exclusive = 0;
        for ((_, k), sub) in others {
            total += 1;
            if k.kind.is_share() {
                shares += 1;
            }
            if k.kind == StreamKind::Video {
                if sub.resolution.is_high() {
                    high += 1;
                }
                if sub.resolution.is_exclusive() {
                    exclusive += 1;
                }
            }
        }

        if key.kind.is_share() && shares >= self.limits.max_shares {
            return Err(SubscribeError::ShareLimit);
        }
        if key.kind == StreamKind::Video {
            if resolution.is_exclusive() && exclusive > 0 {
                return Err(SubscribeError::ExclusiveTierTaken);
            }
            if resolution.is_high() && high >= self.limits.max_high_resolution {
                return Err(SubscribeError::ExceededLimit);
            }
        }
        if excluding.is_none() && total >= self.limits.max_total {
            return Err(SubscribeError::ExceededLimit);
        }
        Ok(())
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sink;
    impl RawDataConsumer for Sink {}

    fn sink() -> Arc<dyn RawDataConsumer> {
        Arc::new(Sink)
    }

    fn manager(limits: SubscriptionLimits) -> (Arc<FanoutRouter>, SubscriptionManager) {
        let router = Arc::new(FanoutRouter::new());
        let mgr = SubscriptionManager::new(router.clone(), limits);
        (router, mgr)
    }

    #[tokio::test]
    async fn third_high_resolution_fails_without_evicting() {
        let (router, mut mgr) = manager(SubscriptionLimits::default());
        let consumer = sink();

        mgr.subscribe(StreamKey::video(1), Resolution::P720, consumer.clone()).unwrap();
        mgr.subscribe(StreamKey::video(2), Resolution::P720, consumer.clone()).unwrap();
        let err = mgr
            .subscribe(StreamKey::video(3), Resolution::P720, consumer.clone())
            .unwrap_err();

        assert_eq!(err, SubscribeError::ExceededLimit);
        assert_eq!(mgr.high_resolution_count(), 2);
        assert!(mgr.is_subscribed(&consumer, &StreamKey::video(1)));
        assert!(mgr.is_subscribed(&consumer, &StreamKey::video(2)));
        assert!(!router.has_consumers(&StreamKey::video(3)));

        // Lower tiers are still available.
        mgr.subscribe(StreamKey::video(3), Resolution::P360, consumer).unwrap();
    }

    #[tokio::test]
    async fn exclusive_tier_is_single_holder() {
        let (_router, mut mgr) = manager(SubscriptionLimits::default());
        let consumer = sink();
        mgr.subscribe(StreamKey::video(1), Resolution::P1080, consumer.clone()).unwrap();
        assert_eq!(
            mgr.subscribe(StreamKey::video(2), Resolution::P1080, consumer).unwrap_err(),
            SubscribeError::ExclusiveTierTaken
        );
    }

    #[tokio::test]
    async fn duplicate_pair_rejected_but_other_consumer_allowed() {
        let (router, mut mgr) = manager(SubscriptionLimits::default());
        let a = sink();
        let b = sink();
        let key = StreamKey::video(9);
        mgr.subscribe(key, Resolution::P360, a.clone()).unwrap();
        assert_eq!(
            mgr.subscribe(key, Resolution::P360, a.clone()).unwrap_err(),
            SubscribeError::AlreadySubscribed
        );
        mgr.subscribe(key, Resolution::P180, b.clone()).unwrap();
        assert_eq!(router.consumer_count(&key), 2);
        assert_eq!(router.negotiations(), 1);

        mgr.unsubscribe(&a, &key).unwrap();
        assert!(router.has_consumers(&key));
        mgr.unsubscribe(&b, &key).unwrap();
        assert!(!router.has_consumers(&key));
        assert_eq!(mgr.unsubscribe(&b, &key).unwrap_err(), SubscribeError::NotSubscribed);
    }

    #[tokio::test]
    async fn share_cap() {
        let limits = SubscriptionLimits {
            max_shares: 1,
            ..Default::default()
        };
        let (_router, mut mgr) = manager(limits);
        let consumer = sink();
        mgr.subscribe(StreamKey::new(1, StreamKind::ShareNormal), Resolution::Auto, consumer.clone())
            .unwrap();
        assert_eq!(
            mgr.subscribe(StreamKey::new(2, StreamKind::ShareCamera), Resolution::Auto, consumer)
                .unwrap_err(),
            SubscribeError::ShareLimit
        );
    }

    #[tokio::test]
    async fn rate_limit_applies_to_subscribe_calls() {
        let limits = SubscriptionLimits {
            rate_limit: RateLimit {
                max_calls: 2,
                window_ms: 60_000,
            },
            ..Default::default()
        };
        let (_router, mut mgr) = manager(limits);
        let consumer = sink();
        mgr.subscribe(StreamKey::video(1), Resolution::P180, consumer.clone()).unwrap();
        mgr.subscribe(StreamKey::video(2), Resolution::P180, consumer.clone()).unwrap();
        assert_eq!(
            mgr.subscribe(StreamKey::video(3), Resolution::P180, consumer).unwrap_err(),
            SubscribeError::TooFrequent
        );
    }

    #[tokio::test]
    async fn resolution_upgrade_respects_caps() {
        let (_router, mut mgr) = manager(SubscriptionLimits::default());
        let consumer = sink();
        mgr.subscribe(StreamKey::video(1), Resolution::P720, consumer.clone()).unwrap();
        mgr.subscribe(StreamKey::video(2), Resolution::P720, consumer.clone()).unwrap();
        mgr.subscribe(StreamKey::video(3), Resolution::P360, consumer.clone()).unwrap();

        assert_eq!(
            mgr.set_resolution(&consumer, &StreamKey::video(3), Resolution::P720).unwrap_err(),
            SubscribeError::ExceededLimit
        );
        mgr.set_resolution(&consumer, &StreamKey::video(1), Resolution::P1080).unwrap();
        assert_eq!(mgr.high_resolution_count(), 2);
    }

    #[tokio::test]
    async fn dropping_a_user_ends_their_streams() {
        let (router, mut mgr) = manager(SubscriptionLimits::default());
        let consumer = sink();
        mgr.subscribe(StreamKey::video(4), Resolution::P360, consumer.clone()).unwrap();
        mgr.subscribe(StreamKey::new(4, StreamKind::ShareNormal), Resolution::Auto, consumer.clone())
            .unwrap();
        mgr.subscribe(StreamKey::video(5), Resolution::P360, consumer).unwrap();

        assert_eq!(mgr.drop_user(4), 2);
        assert_eq!(mgr.count(), 1);
        assert!(!router.has_consumers(&StreamKey::video(4)));
    }
}
