//! In-memory partitioned log with consumer-group offsets

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

use super::{LogRecord, LogTransport};
use crate::{BusError, BusResult, PublishMode};

#[derive(Default)]
struct LogState {
    topics: HashMap<String, Vec<(String, Vec<u8>)>>,
    /// Next offset to read, per (group, topic)
    offsets: HashMap<(String, String), usize>,
}

struct Broker {
    state: Mutex<LogState>,
    appended: Notify,
    reachable: AtomicBool,
}

#[derive(Default)]
struct Session {
    group: Option<String>,
    subscription: Vec<String>,
    /// (topic, offset) of each record handed out by the last poll
    last_batch: Vec<(String, usize)>,
}

/// Log transport keeping every topic in process memory
///
/// Consumers sharing a group id share offsets, so attached handles in the
/// same group split the records between them the way partitions would.
pub struct InMemoryLog {
    broker: Arc<Broker>,
    session: Mutex<Session>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self {
            broker: Arc::new(Broker {
                state: Mutex::new(LogState::default()),
                appended: Notify::new(),
                reachable: AtomicBool::new(true),
            }),
            session: Mutex::new(Session::default()),
        }
    }

    /// Open another, not yet connected, handle onto the same log
    pub fn attach(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            session: Mutex::new(Session::default()),
        }
    }

    /// Simulate the broker going away; new connections fail while unreachable
    pub fn set_reachable(&self, reachable: bool) {
        self.broker.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of records ever appended to `topic`
    pub fn topic_len(&self, topic: &str) -> usize {
        self.broker
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .topics
            .get(topic)
            .map_or(0, Vec::len)
    }

    fn group(&self) -> Option<String> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .group
            .clone()
    }

    /// Take every record past the group's offsets, committing as it goes
    fn drain(&self) -> Vec<(LogRecord, usize)> {
        let (group, topics) = {
            let session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            match &session.group {
                Some(group) => (group.clone(), session.subscription.clone()),
                None => return Vec::new(),
            }
        };

        let mut state = self.broker.state.lock().unwrap_or_else(PoisonError::into_inner);
        let LogState { topics: log, offsets } = &mut *state;

        let mut records = Vec::new();
        for topic in topics {
            let Some(entries) = log.get(&topic) else {
                continue;
            };
            let offset = offsets.entry((group.clone(), topic.clone())).or_insert(entries.len());
            for (position, (key, payload)) in entries.iter().enumerate().skip(*offset) {
                let record = LogRecord {
                    topic: topic.clone(),
                    key: key.clone(),
                    payload: payload.clone(),
                };
                records.push((record, position));
            }
            *offset = entries.len();
        }
        records
    }

    fn hand_out(&self, batch: Vec<(LogRecord, usize)>) -> Vec<LogRecord> {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        session.last_batch = batch
            .iter()
            .map(|(record, position)| (record.topic.clone(), *position))
            .collect();
        batch.into_iter().map(|(record, _)| record).collect()
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogTransport for InMemoryLog {
    async fn connect(&self, group_id: &str) -> BusResult<()> {
        if !self.broker.reachable.load(Ordering::SeqCst) {
            return Err(BusError::ConnectionError(
                "in-memory log is unreachable".to_string(),
            ));
        }
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .group = Some(group_id.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.group().is_some() && self.broker.reachable.load(Ordering::SeqCst)
    }

    async fn produce(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        _mode: PublishMode,
    ) -> BusResult<()> {
        if self.group().is_none() {
            return Err(BusError::PublishError("not connected".to_string()));
        }

        self.broker
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .topics
            .entry(topic.to_string())
            .or_default()
            .push((key.to_string(), payload));
        self.broker.appended.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> BusResult<()> {
        let group = self
            .group()
            .ok_or_else(|| BusError::SubscribeError("not connected".to_string()))?;

        {
            let mut state = self.broker.state.lock().unwrap_or_else(PoisonError::into_inner);
            let LogState { topics: log, offsets } = &mut *state;
            for topic in topics {
                let end = log.entry(topic.clone()).or_default().len();
                offsets.entry((group.clone(), topic.clone())).or_insert(end);
            }
        }

        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscription = topics.to_vec();
        Ok(())
    }

    async fn unsubscribe(&self) -> BusResult<()> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscription
            .clear();
        Ok(())
    }

    fn subscription(&self) -> Vec<String> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscription
            .clone()
    }

    async fn poll(&self, timeout: Duration) -> BusResult<Vec<LogRecord>> {
        if self.group().is_none() {
            return Err(BusError::SubscribeError("not connected".to_string()));
        }

        let appended = self.broker.appended.notified();
        tokio::pin!(appended);
        appended.as_mut().enable();

        let batch = self.drain();
        if !batch.is_empty() {
            return Ok(self.hand_out(batch));
        }

        let _ = tokio::time::timeout(timeout, appended).await;
        Ok(self.hand_out(self.drain()))
    }

    async fn rewind(&self, delivered: usize) -> BusResult<()> {
        let (group, returned) = {
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            let batch = std::mem::take(&mut session.last_batch);
            let Some(group) = session.group.clone() else {
                return Err(BusError::SubscribeError("not connected".to_string()));
            };
            let returned: Vec<_> = batch.into_iter().skip(delivered).collect();
            (group, returned)
        };

        let mut state = self.broker.state.lock().unwrap_or_else(PoisonError::into_inner);
        for (topic, position) in returned {
            let offset = state.offsets.entry((group.clone(), topic)).or_insert(position);
            *offset = (*offset).min(position);
        }
        Ok(())
    }

    async fn close(&self) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Session::default();
    }
}
