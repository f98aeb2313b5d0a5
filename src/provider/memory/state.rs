//! Broker state of the in-memory provider
//!
//! Mirrors the JetStream model: streams capture subjects and assign
//! sequences, durable consumers track a cursor plus a set of delivered but
//! unsettled messages. A delivery that is not acked within the ack wait (or
//! is nak'd) is redelivered until `max_deliver` is reached.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{EventError, Result};
use crate::provider::{ConsumerUpdatePolicy, DeliveryInfo};
use crate::topology::{subject, RetentionPolicy, StreamDefinition};
use crate::types::{ConsumerDefinition, DeliverPolicy};

/// `(stream, durable)`
pub(super) type ConsumerKey = (String, String);

/// How long a message id is remembered for de-duplication
pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

/// Dead-lettered sequences kept per consumer snapshot
pub const DEFAULT_MAX_DEAD_LETTERS: usize = 1000;

pub(super) struct StoredMessage {
    subject: String,
    data: Bytes,
    message_id: String,
    published_at: DateTime<Utc>,
    stored_at: Instant,
}

pub(super) struct StreamState {
    definition: StreamDefinition,
    messages: BTreeMap<u64, StoredMessage>,
    last_sequence: u64,
    bytes: u64,
    dedup: HashMap<String, u64>,
    dedup_order: VecDeque<(Instant, String)>,
}

impl StreamState {
    fn new(definition: StreamDefinition) -> Self {
        Self {
            definition,
            messages: BTreeMap::new(),
            last_sequence: 0,
            bytes: 0,
            dedup: HashMap::new(),
            dedup_order: VecDeque::new(),
        }
    }

    /// Forget message ids published more than `window` ago
    fn prune_dedup(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.dedup_order.front() {
            if now.saturating_duration_since(*at) < window {
                break;
            }
            if let Some((_, id)) = self.dedup_order.pop_front() {
                self.dedup.remove(&id);
            }
        }
    }

    fn remove(&mut self, seq: u64) {
        if let Some(msg) = self.messages.remove(&seq) {
            self.bytes = self.bytes.saturating_sub(msg.data.len() as u64);
        }
    }

    fn enforce_limits(&mut self, now: Instant, max_messages: Option<usize>) {
        if let Some(max_age) = self.definition.max_age_duration() {
            let expired: Vec<u64> = self
                .messages
                .iter()
                .take_while(|(_, m)| now.saturating_duration_since(m.stored_at) >= max_age)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in expired {
                self.remove(seq);
            }
        }

        if let Some(max_bytes) = self.definition.max_bytes.filter(|b| *b > 0) {
            while self.bytes > max_bytes as u64 {
                match self.messages.keys().next().copied() {
                    Some(seq) => self.remove(seq),
                    None => break,
                }
            }
        }

        if let Some(max) = max_messages {
            while self.messages.len() > max {
                match self.messages.keys().next().copied() {
                    Some(seq) => self.remove(seq),
                    None => break,
                }
            }
        }
    }
}

pub(super) struct ConsumerState {
    definition: ConsumerDefinition,
    filter: String,
    generation: u64,
    cursor: u64,
    attempts: HashMap<u64, u64>,
    pending: BTreeMap<u64, Instant>,
    delivered: u64,
    acked: u64,
    dead_lettered: VecDeque<u64>,
    notify: Arc<Notify>,
}

impl ConsumerState {
    /// Delivered and settled (acked or given up on)
    fn is_done(&self, seq: u64) -> bool {
        self.cursor >= seq && !self.pending.contains_key(&seq)
    }
}

/// Point-in-time view of a consumer, for assertions and monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSnapshot {
    pub stream: String,
    pub durable_name: String,
    pub filter: String,
    /// Total deliveries including redeliveries
    pub delivered: u64,
    pub acked: u64,
    /// Delivered but not yet settled
    pub pending: usize,
    /// Most recent stream sequences that reached `max_deliver` without an ack
    pub dead_lettered: Vec<u64>,
}

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Upsert {
    Created,
    Updated,
    Recreated,
    Unchanged,
}

/// Next step for a waiting consumer
pub(super) enum Next {
    Ready(DeliveryInfo, Bytes, Duration),
    Wait(Option<Instant>),
    Closed,
}

pub(super) struct BrokerState {
    streams: BTreeMap<String, StreamState>,
    consumers: HashMap<ConsumerKey, ConsumerState>,
    next_generation: u64,
    closed: bool,
    duplicate_window: Duration,
    max_dead_letters: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self::new(DEFAULT_DUPLICATE_WINDOW, DEFAULT_MAX_DEAD_LETTERS)
    }
}

impl BrokerState {
    pub fn new(duplicate_window: Duration, max_dead_letters: usize) -> Self {
        Self {
            streams: BTreeMap::new(),
            consumers: HashMap::new(),
            next_generation: 0,
            closed: false,
            duplicate_window,
            max_dead_letters,
        }
    }

    pub fn close(&mut self) {
        self.closed = true;
        for consumer in self.consumers.values() {
            consumer.notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn upsert_stream(&mut self, definition: &StreamDefinition) -> Upsert {
        match self.streams.get_mut(&definition.name) {
            None => {
                self.streams
                    .insert(definition.name.clone(), StreamState::new(definition.clone()));
                Upsert::Created
            }
            Some(existing) if existing.definition.retention != definition.retention => {
                *existing = StreamState::new(definition.clone());
                let name = definition.name.clone();
                self.consumers.retain(|(stream, _), consumer| {
                    if *stream == name {
                        consumer.notify.notify_waiters();
                        false
                    } else {
                        true
                    }
                });
                Upsert::Recreated
            }
            Some(existing) if existing.definition != *definition => {
                existing.definition = definition.clone();
                Upsert::Updated
            }
            Some(_) => Upsert::Unchanged,
        }
    }

    pub fn stream_subjects(&self, name: &str) -> Option<Vec<String>> {
        self.streams.get(name).map(|s| s.definition.subjects.clone())
    }

    pub fn stream_len(&self, name: &str) -> Option<usize> {
        self.streams.get(name).map(|s| s.messages.len())
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn message_count(&self) -> u64 {
        self.streams.values().map(|s| s.messages.len() as u64).sum()
    }

    #[cfg(test)]
    pub fn dedup_len(&self, name: &str) -> Option<usize> {
        self.streams.get(name).map(|s| s.dedup.len())
    }

    /// Store a message, returning its stream sequence
    ///
    /// A message id repeated within the duplicate window returns the
    /// original sequence without storing the message again.
    pub fn publish(
        &mut self,
        subject_name: &str,
        message_id: &str,
        data: Bytes,
        now: Instant,
        max_messages: Option<usize>,
    ) -> Result<u64> {
        let stream = self
            .streams
            .values_mut()
            .find(|s| s.definition.captures(subject_name))
            .ok_or_else(|| EventError::Publish {
                subject: subject_name.to_string(),
                reason: "no stream captures this subject".to_string(),
            })?;

        stream.prune_dedup(now, self.duplicate_window);
        if let Some(seq) = stream.dedup.get(message_id) {
            return Ok(*seq);
        }

        stream.last_sequence += 1;
        let seq = stream.last_sequence;
        stream.dedup.insert(message_id.to_string(), seq);
        stream.dedup_order.push_back((now, message_id.to_string()));

        let stream_name = stream.definition.name.clone();
        let interested: Vec<Arc<Notify>> = self
            .consumers
            .iter()
            .filter(|((s, _), c)| *s == stream_name && subject::matches(&c.filter, subject_name))
            .map(|(_, c)| c.notify.clone())
            .collect();

        if stream.definition.retention == RetentionPolicy::InterestBased && interested.is_empty() {
            tracing::debug!(
                stream = %stream_name,
                subject = %subject_name,
                sequence = seq,
                "No interest, message dropped"
            );
            return Ok(seq);
        }

        stream.bytes += data.len() as u64;
        stream.messages.insert(
            seq,
            StoredMessage {
                subject: subject_name.to_string(),
                data,
                message_id: message_id.to_string(),
                published_at: Utc::now(),
                stored_at: now,
            },
        );
        stream.enforce_limits(now, max_messages);

        for notify in interested {
            notify.notify_waiters();
        }
        Ok(seq)
    }

    /// Create or rebind a durable consumer, returning its generation
    pub fn bind(
        &mut self,
        filter: &str,
        definition: &ConsumerDefinition,
        policy: ConsumerUpdatePolicy,
    ) -> Result<(u64, Arc<Notify>, Upsert)> {
        let stream = self
            .streams
            .get(&definition.stream)
            .ok_or_else(|| EventError::Binding {
                durable: definition.durable_name.clone(),
                reason: format!("stream '{}' not found", definition.stream),
            })?;

        if !stream.definition.covers(filter) {
            return Err(EventError::Binding {
                durable: definition.durable_name.clone(),
                reason: format!(
                    "stream '{}' does not cover '{}'",
                    definition.stream, filter
                ),
            });
        }
        let start = match definition.deliver_policy {
            DeliverPolicy::All => 0,
            DeliverPolicy::New => stream.last_sequence,
        };

        let key = (definition.stream.clone(), definition.durable_name.clone());
        let mut outcome = Upsert::Created;
        if let Some(existing) = self.consumers.get(&key) {
            if existing.filter == filter && existing.definition == *definition {
                return Ok((existing.generation, existing.notify.clone(), Upsert::Unchanged));
            }
            match policy {
                ConsumerUpdatePolicy::Reject => {
                    return Err(EventError::Binding {
                        durable: definition.durable_name.clone(),
                        reason: "a consumer with this name exists with a different configuration"
                            .to_string(),
                    });
                }
                ConsumerUpdatePolicy::Recreate => {
                    existing.notify.notify_waiters();
                    outcome = Upsert::Recreated;
                }
            }
        }

        self.next_generation += 1;
        let notify = Arc::new(Notify::new());
        self.consumers.insert(
            key,
            ConsumerState {
                definition: definition.clone(),
                filter: filter.to_string(),
                generation: self.next_generation,
                cursor: start,
                attempts: HashMap::new(),
                pending: BTreeMap::new(),
                delivered: 0,
                acked: 0,
                dead_lettered: VecDeque::new(),
                notify: notify.clone(),
            },
        );
        Ok((self.next_generation, notify, outcome))
    }

    /// Hand out the next delivery for a consumer
    ///
    /// Expired deliveries are redelivered before new messages; expired
    /// deliveries that used up `max_deliver` are dead-lettered.
    pub fn next(&mut self, key: &ConsumerKey, generation: u64, now: Instant) -> Next {
        if self.closed {
            return Next::Closed;
        }
        let Some(stream) = self.streams.get_mut(&key.0) else {
            return Next::Closed;
        };
        let Some(consumer) = self.consumers.get_mut(key) else {
            return Next::Closed;
        };
        if consumer.generation != generation {
            return Next::Closed;
        }

        let ack_wait = consumer.definition.ack_wait_duration();
        let expired: Vec<u64> = consumer
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();

        let mut settled = Vec::new();
        let mut redeliver = None;
        for seq in expired {
            let attempts = consumer.attempts.get(&seq).copied().unwrap_or(0);
            if !stream.messages.contains_key(&seq) {
                consumer.pending.remove(&seq);
                consumer.attempts.remove(&seq);
                continue;
            }
            if consumer.definition.is_final_attempt(attempts) {
                consumer.pending.remove(&seq);
                consumer.attempts.remove(&seq);
                if consumer.dead_lettered.len() >= self.max_dead_letters {
                    consumer.dead_lettered.pop_front();
                }
                consumer.dead_lettered.push_back(seq);
                settled.push(seq);
                tracing::debug!(
                    durable = %key.1,
                    sequence = seq,
                    attempts,
                    "Max deliveries reached"
                );
                continue;
            }
            if redeliver.is_none() {
                redeliver = Some(seq);
            }
        }

        let next_seq = redeliver.or_else(|| {
            let filter = &consumer.filter;
            let found = stream
                .messages
                .range(consumer.cursor + 1..)
                .find(|(_, m)| subject::matches(filter, &m.subject))
                .map(|(seq, _)| *seq);
            consumer.cursor = found.unwrap_or(stream.last_sequence.max(consumer.cursor));
            found
        });

        let result = match next_seq.and_then(|seq| stream.messages.get(&seq).map(|m| (seq, m))) {
            Some((seq, message)) => {
                let attempt = consumer.attempts.entry(seq).or_insert(0);
                *attempt += 1;
                consumer.pending.insert(seq, now + ack_wait);
                consumer.delivered += 1;
                Next::Ready(
                    DeliveryInfo {
                        subject: message.subject.clone(),
                        delivery_attempt: *attempt,
                        stream_sequence: seq,
                        message_id: Some(message.message_id.clone()),
                        published_at: Some(message.published_at),
                    },
                    message.data.clone(),
                    ack_wait,
                )
            }
            None => Next::Wait(consumer.pending.values().min().copied()),
        };

        for seq in settled {
            self.release(&key.0, seq);
        }
        result
    }

    pub fn ack(&mut self, key: &ConsumerKey, generation: u64, seq: u64) -> Result<()> {
        let consumer = self.live_consumer(key, generation)?;
        if consumer.pending.remove(&seq).is_some() {
            consumer.attempts.remove(&seq);
            consumer.acked += 1;
            self.release(&key.0, seq);
        }
        Ok(())
    }

    pub fn nak(
        &mut self,
        key: &ConsumerKey,
        generation: u64,
        seq: u64,
        delay: Duration,
        now: Instant,
    ) -> Result<()> {
        let consumer = self.live_consumer(key, generation)?;
        if let Some(deadline) = consumer.pending.get_mut(&seq) {
            *deadline = now + delay;
            consumer.notify.notify_waiters();
        }
        Ok(())
    }

    pub fn snapshot(&self, stream: &str, durable: &str) -> Option<ConsumerSnapshot> {
        self.consumers
            .get(&(stream.to_string(), durable.to_string()))
            .map(|c| ConsumerSnapshot {
                stream: stream.to_string(),
                durable_name: durable.to_string(),
                filter: c.filter.clone(),
                delivered: c.delivered,
                acked: c.acked,
                pending: c.pending.len(),
                dead_lettered: c.dead_lettered.iter().copied().collect(),
            })
    }

    fn live_consumer(&mut self, key: &ConsumerKey, generation: u64) -> Result<&mut ConsumerState> {
        match self.consumers.get_mut(key) {
            Some(consumer) if consumer.generation == generation => Ok(consumer),
            _ => Err(EventError::Ack(format!(
                "consumer '{}' on stream '{}' no longer exists",
                key.1, key.0
            ))),
        }
    }

    /// Drop a message from an interest stream once every consumer is done
    fn release(&mut self, stream_name: &str, seq: u64) {
        let Some(stream) = self.streams.get_mut(stream_name) else {
            return;
        };
        if stream.definition.retention != RetentionPolicy::InterestBased {
            return;
        }
        let Some(message) = stream.messages.get(&seq) else {
            return;
        };
        let all_done = self
            .consumers
            .iter()
            .filter(|((s, _), c)| s == stream_name && subject::matches(&c.filter, &message.subject))
            .all(|(_, c)| c.is_done(seq));
        if all_done {
            stream.remove(seq);
        }
    }
}
