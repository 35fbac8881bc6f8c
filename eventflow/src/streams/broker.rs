//! In-process stream broker.
//!
//! Every stream is a fixed-capacity ring buffer indexed by a monotonically
//! increasing write offset. Consumer groups keep independent read offsets,
//! so each group sees every message (broadcast between groups). When a group
//! falls more than `capacity` messages behind, the evicted messages are
//! counted as `missed` and the group skips past them.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::message::StreamMessage;
use crate::errors::{ConfigurationError, EngineResult};

fn default_capacity() -> usize {
    10_000
}

/// Broker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Ring buffer size of every stream.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

impl BrokerConfig {
    /// Sets the ring buffer size.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Messages returned by one consume call.
#[derive(Debug, Clone, Default)]
pub struct Consumed {
    /// Messages in write order.
    pub messages: Vec<StreamMessage>,
    /// Messages evicted before the group could read them.
    pub missed: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    offset: u64,
    consumers: HashMap<String, u64>,
    acked: u64,
    missed: u64,
}

#[derive(Debug)]
struct QueueState {
    buffer: Vec<Option<StreamMessage>>,
    written: u64,
    producers: HashMap<String, u64>,
    groups: HashMap<String, GroupState>,
}

impl QueueState {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![None; capacity],
            written: 0,
            producers: HashMap::new(),
            groups: HashMap::new(),
        }
    }

    fn capacity(&self) -> u64 {
        self.buffer.len() as u64
    }

    #[allow(clippy::cast_possible_truncation)]
    fn slot(&self, offset: u64) -> usize {
        (offset % self.capacity()) as usize
    }

    fn push(&mut self, producer: &str, message: StreamMessage) -> u64 {
        let offset = self.written;
        let slot = self.slot(offset);
        self.buffer[slot] = Some(message);
        self.written += 1;
        *self.producers.entry(producer.to_string()).or_default() += 1;
        offset
    }

    fn consume(&mut self, group: &str, consumer: &str, batch_size: usize) -> Consumed {
        let capacity = self.capacity();
        let written = self.written;
        let state = self.groups.entry(group.to_string()).or_default();

        let lag = written.saturating_sub(state.offset);
        let mut missed = 0;
        if lag > capacity {
            missed = lag - capacity;
            state.offset += missed;
            state.missed += missed;
        }

        let available = written - state.offset;
        let take = available.min(batch_size as u64);
        let start = state.offset;
        state.offset += take;
        *state.consumers.entry(consumer.to_string()).or_default() += take;

        let messages = (start..start + take)
            .filter_map(|offset| self.buffer[self.slot(offset)].clone())
            .collect();
        Consumed { messages, missed }
    }
}

#[derive(Debug)]
struct BrokerQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Read cursor of one consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStats {
    /// Next offset the group will read.
    pub offset: u64,
    /// Messages written but not yet read by the group.
    pub lag: u64,
    /// Acknowledged messages.
    pub acked: u64,
    /// Messages lost to eviction.
    pub missed: u64,
    /// Messages handed to each consumer id.
    pub consumers: BTreeMap<String, u64>,
}

/// Snapshot of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Ring buffer size.
    pub capacity: usize,
    /// Offset of the newest message, if any was written.
    pub offset0: Option<u64>,
    /// Messages written by each producer id.
    pub producers: BTreeMap<String, u64>,
    /// Read cursors by group name.
    pub groups: BTreeMap<String, GroupStats>,
}

/// Process-local broker holding every stream by name.
#[derive(Debug, Default)]
pub struct Broker {
    config: BrokerConfig,
    queues: DashMap<String, Arc<BrokerQueue>>,
}

impl Broker {
    /// Creates an empty broker. Capacity must be positive.
    pub fn new(config: BrokerConfig) -> EngineResult<Self> {
        if config.capacity == 0 {
            return Err(ConfigurationError::new("broker capacity must be positive").into());
        }
        Ok(Self {
            config,
            queues: DashMap::new(),
        })
    }

    /// Broker settings.
    #[must_use]
    pub const fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn queue(&self, stream: &str) -> Arc<BrokerQueue> {
        let capacity = self.config.capacity.max(1);
        Arc::clone(
            self.queues
                .entry(stream.to_string())
                .or_insert_with(|| {
                    Arc::new(BrokerQueue {
                        state: Mutex::new(QueueState::new(capacity)),
                        notify: Notify::new(),
                    })
                })
                .value(),
        )
    }

    /// Creates `stream` and `group` if absent. Returns false if the group existed.
    pub fn ensure_group(&self, stream: &str, group: &str) -> bool {
        let queue = self.queue(stream);
        let mut state = queue.state.lock();
        if state.groups.contains_key(group) {
            tracing::debug!(stream_name = stream, consumer_group = group, "Consumer group already exists");
            return false;
        }
        state.groups.insert(group.to_string(), GroupState::default());
        true
    }

    /// Appends a message and wakes waiting readers. Returns its offset.
    pub fn push(&self, stream: &str, producer: &str, message: StreamMessage) -> u64 {
        let queue = self.queue(stream);
        let offset = queue.state.lock().push(producer, message);
        queue.notify.notify_waiters();
        offset
    }

    /// Takes up to `batch_size` unread messages for `group` without waiting.
    pub fn consume(&self, stream: &str, group: &str, consumer: &str, batch_size: usize) -> Consumed {
        self.queue(stream).state.lock().consume(group, consumer, batch_size)
    }

    /// Like [`Broker::consume`], but waits up to `timeout` once if nothing is available.
    pub async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        batch_size: usize,
        timeout: Duration,
    ) -> Consumed {
        let queue = self.queue(stream);
        let notified = queue.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let first = queue.state.lock().consume(group, consumer, batch_size);
        if !first.messages.is_empty() || timeout.is_zero() {
            return first;
        }

        let _ = tokio::time::timeout(timeout, notified).await;
        let mut second = queue.state.lock().consume(group, consumer, batch_size);
        second.missed += first.missed;
        second
    }

    /// Records an acknowledgement by `group`.
    pub fn ack(&self, stream: &str, group: &str) -> usize {
        let Some(queue) = self.queues.get(stream).map(|q| Arc::clone(q.value())) else {
            return 0;
        };
        let mut state = queue.state.lock();
        match state.groups.get_mut(group) {
            Some(group) => {
                group.acked += 1;
                1
            }
            None => 0,
        }
    }

    /// Snapshot of `stream`, if it exists.
    #[must_use]
    pub fn stats(&self, stream: &str) -> Option<QueueStats> {
        let queue = self.queues.get(stream).map(|q| Arc::clone(q.value()))?;
        let state = queue.state.lock();
        let groups = state
            .groups
            .iter()
            .map(|(name, group)| {
                let stats = GroupStats {
                    offset: group.offset,
                    lag: state.written.saturating_sub(group.offset),
                    acked: group.acked,
                    missed: group.missed,
                    consumers: group.consumers.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                };
                (name.clone(), stats)
            })
            .collect();
        Some(QueueStats {
            capacity: state.buffer.len(),
            offset0: state.written.checked_sub(1),
            producers: state.producers.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            groups,
        })
    }

    /// Names of all streams.
    #[must_use]
    pub fn streams(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
