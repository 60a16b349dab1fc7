//! Rolling peer scores
//!
//! Throughput and reliability are exponentially weighted averages (gains
//! 0.1 and 0.05); the composite score weights throughput 0.4, reliability
//! 0.3, success ratio 0.2, and latency 0.1. Peers that keep failing get
//! blacklisted. Selection adds a little uniform jitter so the swarm does
//! not converge on the same top peers forever.

use std::collections::HashMap;
use std::net::SocketAddrV4;

use rand::Rng;
use tracing::{debug, trace};

use crate::tracker::PeerEndpoint;

/// Scores follow the peer id when the tracker supplied one, otherwise the
/// endpoint, so an identity that moves ports keeps its history.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScoreKey {
    Id(Vec<u8>),
    Endpoint(SocketAddrV4),
}

impl ScoreKey {
    pub fn for_endpoint(endpoint: &PeerEndpoint) -> Self {
        match &endpoint.peer_id {
            Some(id) => ScoreKey::Id(id.clone()),
            None => ScoreKey::Endpoint(endpoint.addr),
        }
    }
}

const THROUGHPUT_GAIN: f64 = 0.1;
const RELIABILITY_GAIN: f64 = 0.05;
const LATENCY_GAIN: f64 = 0.1;

/// Throughput scale where the normalized score reaches one half
const THROUGHPUT_HALF_POINT: f64 = 100_000.0;

/// Rolling quality state for one peer
#[derive(Debug, Clone)]
pub struct PeerScore {
    /// EWMA of observed block throughput, bytes per second
    pub throughput: f64,
    /// EWMA of verification outcomes, 1.0 = always good
    pub reliability: f64,
    pub successes: u64,
    pub failures: u64,
    /// EWMA of request-to-block latency in milliseconds
    pub avg_response_ms: f64,
}

impl Default for PeerScore {
    fn default() -> Self {
        Self {
            throughput: 0.0,
            reliability: 1.0,
            successes: 0,
            failures: 0,
            avg_response_ms: 0.0,
        }
    }
}

impl PeerScore {
    fn success_ratio(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            // No history reads as neutral, not perfect
            0.5
        } else {
            self.successes as f64 / total as f64
        }
    }

    fn latency_score(&self) -> f64 {
        1.0 / (1.0 + self.avg_response_ms / 1000.0)
    }

    fn throughput_score(&self) -> f64 {
        self.throughput / (self.throughput + THROUGHPUT_HALF_POINT)
    }

    /// Weighted composite in [0, 1]
    pub fn composite(&self) -> f64 {
        0.4 * self.throughput_score()
            + 0.3 * self.reliability
            + 0.2 * self.success_ratio()
            + 0.1 * self.latency_score()
    }

    pub fn is_blacklisted(&self) -> bool {
        self.failures > 10 && self.reliability < 0.3
    }
}

/// Score table and over-budget peer selection
#[derive(Debug, Default)]
pub struct SwarmSelector {
    scores: HashMap<ScoreKey, PeerScore>,
    /// Jitter magnitude added during selection
    jitter: f64,
}

impl SwarmSelector {
    pub fn new() -> Self {
        Self {
            scores: HashMap::new(),
            jitter: 0.05,
        }
    }

    fn entry(&mut self, key: &ScoreKey) -> &mut PeerScore {
        self.scores.entry(key.clone()).or_default()
    }

    /// Feed one observed throughput sample, bytes per second
    pub fn record_throughput(&mut self, key: &ScoreKey, bytes_per_sec: f64) {
        let score = self.entry(key);
        score.throughput += THROUGHPUT_GAIN * (bytes_per_sec - score.throughput);
        trace!("Throughput for {:?}: {:.0} B/s (ewma)", key, score.throughput);
    }

    /// Feed one request-to-delivery latency sample
    pub fn record_response_time(&mut self, key: &ScoreKey, millis: f64) {
        let score = self.entry(key);
        score.avg_response_ms += LATENCY_GAIN * (millis - score.avg_response_ms);
    }

    /// Feed a verification outcome for a piece this peer contributed to
    pub fn record_verification(&mut self, key: &ScoreKey, ok: bool) {
        let score = self.entry(key);
        let target = if ok { 1.0 } else { 0.0 };
        score.reliability += RELIABILITY_GAIN * (target - score.reliability);
        if ok {
            score.successes += 1;
        } else {
            score.failures += 1;
            debug!(
                "Verification failure for {:?} (failures {}, reliability {:.2})",
                key, score.failures, score.reliability
            );
        }
    }

    /// Feed a connection-level failure (refused, timed out, violated)
    pub fn record_failure(&mut self, key: &ScoreKey) {
        let score = self.entry(key);
        score.failures += 1;
    }

    pub fn score(&self, key: &ScoreKey) -> Option<&PeerScore> {
        self.scores.get(key)
    }

    pub fn is_blacklisted(&self, key: &ScoreKey) -> bool {
        self.scores
            .get(key)
            .map(PeerScore::is_blacklisted)
            .unwrap_or(false)
    }

    /// Pick up to `budget` endpoints, best composite first with jitter
    pub fn select(&self, candidates: &[PeerEndpoint], budget: usize) -> Vec<PeerEndpoint> {
        let mut rng = rand::thread_rng();
        let mut scored: Vec<(f64, &PeerEndpoint)> = candidates
            .iter()
            .filter(|c| !self.is_blacklisted(&ScoreKey::for_endpoint(c)))
            .map(|c| {
                let base = self
                    .scores
                    .get(&ScoreKey::for_endpoint(c))
                    .map(PeerScore::composite)
                    .unwrap_or(0.5);
                let jitter = if self.jitter > 0.0 {
                    rng.gen_range(0.0..self.jitter)
                } else {
                    0.0
                };
                (base + jitter, c)
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(budget)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(n: u8) -> PeerEndpoint {
        PeerEndpoint::new(format!("10.0.0.{}:6881", n).parse().unwrap())
    }

    fn key(n: u8) -> ScoreKey {
        ScoreKey::for_endpoint(&endpoint(n))
    }

    #[test]
    fn test_key_prefers_peer_id() {
        let mut ep = endpoint(1);
        ep.peer_id = Some(vec![7u8; 20]);
        assert_eq!(ScoreKey::for_endpoint(&ep), ScoreKey::Id(vec![7u8; 20]));
        assert_eq!(
            ScoreKey::for_endpoint(&endpoint(1)),
            ScoreKey::Endpoint("10.0.0.1:6881".parse().unwrap())
        );
    }

    #[test]
    fn test_throughput_ewma_converges() {
        let mut swarm = SwarmSelector::new();
        let k = key(1);
        for _ in 0..100 {
            swarm.record_throughput(&k, 50_000.0);
        }
        let tp = swarm.score(&k).unwrap().throughput;
        assert!((tp - 50_000.0).abs() < 100.0);
    }

    #[test]
    fn test_verification_failure_drops_reliability() {
        let mut swarm = SwarmSelector::new();
        let k = key(1);
        let before = PeerScore::default().reliability;

        swarm.record_verification(&k, false);
        let after = swarm.score(&k).unwrap().reliability;
        assert!(after < before);
        assert_eq!(swarm.score(&k).unwrap().failures, 1);
    }

    #[test]
    fn test_blacklist_rule() {
        let mut swarm = SwarmSelector::new();
        let k = key(1);

        // Many failures but still-high reliability: not blacklisted yet
        for _ in 0..11 {
            swarm.record_failure(&k);
        }
        assert!(!swarm.is_blacklisted(&k));

        // Hammer reliability below 0.3
        for _ in 0..40 {
            swarm.record_verification(&k, false);
        }
        assert!(swarm.score(&k).unwrap().reliability < 0.3);
        assert!(swarm.is_blacklisted(&k));
    }

    #[test]
    fn test_composite_orders_better_peer_higher() {
        let mut swarm = SwarmSelector::new();
        let good = key(1);
        let bad = key(2);

        for _ in 0..50 {
            swarm.record_throughput(&good, 500_000.0);
            swarm.record_verification(&good, true);
            swarm.record_response_time(&good, 20.0);

            swarm.record_throughput(&bad, 1_000.0);
            swarm.record_verification(&bad, false);
            swarm.record_response_time(&bad, 900.0);
        }

        let good_score = swarm.score(&good).unwrap().composite();
        let bad_score = swarm.score(&bad).unwrap().composite();
        assert!(good_score > bad_score + 0.3);
    }

    #[test]
    fn test_select_respects_budget_and_blacklist() {
        let mut swarm = SwarmSelector::new();
        let candidates: Vec<PeerEndpoint> = (1..=6).map(endpoint).collect();

        // Blacklist peer 3
        let k3 = key(3);
        for _ in 0..12 {
            swarm.record_failure(&k3);
            swarm.record_verification(&k3, false);
        }
        for _ in 0..30 {
            swarm.record_verification(&k3, false);
        }
        assert!(swarm.is_blacklisted(&k3));

        let picked = swarm.select(&candidates, 3);
        assert_eq!(picked.len(), 3);
        assert!(!picked.contains(&endpoint(3)));
    }

    #[test]
    fn test_select_prefers_scored_peer() {
        let mut swarm = SwarmSelector::new();
        // Jitter off for determinism
        swarm.jitter = 0.0;
        let candidates: Vec<PeerEndpoint> = (1..=4).map(endpoint).collect();

        let star = key(2);
        for _ in 0..50 {
            swarm.record_throughput(&star, 1_000_000.0);
            swarm.record_verification(&star, true);
        }

        let picked = swarm.select(&candidates, 1);
        assert_eq!(picked, vec![endpoint(2)]);
    }
}
