//! FireTable: next fixed-minute fire time per channel.
//!
//! Interval channels are driven by the regular tick alone. A fixed-minute
//! channel must be looked at during its minute, so the run loop also wakes at
//! the earliest entry here.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::Channel;
use crate::queue::QueueManager;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FireTable {
    entries: BTreeMap<Channel, DateTime<Utc>>,
}

impl FireTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds every entry from the current channel configs.
    pub fn recompute(&mut self, queues: &QueueManager, now: DateTime<Utc>) {
        self.entries.clear();
        for channel in queues.channels() {
            if let Some(at) = queues.get(&channel).and_then(|q| q.next_fire_time(now)) {
                self.entries.insert(channel, at);
            }
        }
        debug!(entries = self.entries.len(), "fire table recomputed");
    }

    /// Channels whose fire time has come; their entries move to the next fire.
    pub fn take_due(&mut self, queues: &QueueManager, now: DateTime<Utc>) -> Vec<Channel> {
        let due: Vec<Channel> = self
            .entries
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(c, _)| c.clone())
            .collect();
        for channel in &due {
            match queues.get(channel).and_then(|q| q.next_fire_time(now)) {
                Some(at) => {
                    self.entries.insert(channel.clone(), at);
                }
                None => {
                    self.entries.remove(channel);
                }
            }
        }
        due
    }

    pub fn earliest(&self) -> Option<DateTime<Utc>> {
        self.entries.values().min().copied()
    }

    pub fn get(&self, channel: &Channel) -> Option<DateTime<Utc>> {
        self.entries.get(channel).copied()
    }

    pub fn entries(&self) -> &BTreeMap<Channel, DateTime<Utc>> {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
