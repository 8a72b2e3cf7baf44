//! Per-topic message counters.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use chrono::{DateTime, Utc};

/// Counters for one topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopicStats {
    /// Deliveries counted on the topic.
    pub count: u64,
    /// First delivery seen.
    pub first_seen: Option<DateTime<Utc>>,
    /// Latest delivery seen.
    pub last_seen: Option<DateTime<Utc>>,
}

/// Message counters across all joined topics.
///
/// Increments are serialised per map; readers get point-in-time copies.
#[derive(Debug, Default)]
pub struct MessageMetrics {
    topics: Mutex<HashMap<String, TopicStats>>,
}

impl MessageMetrics {
    /// Creates an empty counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a topic so it shows up in snapshots before the first
    /// delivery.
    pub fn register_topic(&self, topic: &str) {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic.to_string())
            .or_default();
    }

    /// Counts a delivery on `topic`, returning the new count.
    pub fn on_message(&self, topic: &str) -> u64 {
        let now = Utc::now();
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let stats = topics.entry(topic.to_string()).or_default();
        stats.count += 1;
        stats.first_seen.get_or_insert(now);
        stats.last_seen = Some(now);
        stats.count
    }

    /// Current stats for `topic`.
    pub fn topic(&self, topic: &str) -> Option<TopicStats> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner()).get(topic).copied()
    }

    /// Point-in-time copy of every topic's stats.
    pub fn snapshot(&self) -> HashMap<String, TopicStats> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Total deliveries across all topics.
    pub fn total(&self) -> u64 {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|s| s.count)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_topics_start_at_zero() {
        let metrics = MessageMetrics::new();
        metrics.register_topic("blocks");
        assert_eq!(metrics.topic("blocks").unwrap().count, 0);
        assert!(metrics.topic("blocks").unwrap().first_seen.is_none());
    }

    #[test]
    fn deliveries_are_counted_per_topic() {
        let metrics = MessageMetrics::new();
        assert_eq!(metrics.on_message("a"), 1);
        assert_eq!(metrics.on_message("a"), 2);
        assert_eq!(metrics.on_message("b"), 1);
        assert_eq!(metrics.total(), 3);

        let stats = metrics.topic("a").unwrap();
        assert!(stats.first_seen.is_some());
        assert!(stats.last_seen >= stats.first_seen);
    }
}
