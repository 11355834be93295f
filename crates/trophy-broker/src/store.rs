//! Time-windowed event history for replay to late joiners.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use trophy_core::config::StoreConfig;
use trophy_core::types::{Event, EventId};

/// In-memory, bounded history of published events.
///
/// An event is retained while `now - published_at < retention` and while it
/// is among the newest `max_events`. Expired entries are dropped lazily on
/// the next append or query.
pub struct EventStore {
    events: Mutex<VecDeque<Event>>,
    retention: TimeDelta,
    max_events: usize,
}

impl EventStore {
    pub fn new(retention: Duration, max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            retention: TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX),
            max_events: max_events.max(1),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.retention(), config.max_events)
    }

    pub fn append(&self, event: Event) {
        self.append_at(event, Utc::now());
    }

    pub fn append_at(&self, event: Event, now: DateTime<Utc>) {
        let mut events = self.lock();
        self.evict(&mut events, now);
        self.push(&mut events, event);
    }

    /// Append unless an event with the same id is still retained.
    ///
    /// Returns `false` (and stores nothing) on a duplicate id.
    pub fn append_unique(&self, event: Event) -> bool {
        let now = Utc::now();
        let mut events = self.lock();
        self.evict(&mut events, now);
        if events.iter().any(|e| e.id == event.id) {
            return false;
        }
        self.push(&mut events, event);
        true
    }

    /// Retained events published at or after `since`, newest first.
    ///
    /// `since` defaults to the start of the retention window.
    pub fn query(&self, since: Option<DateTime<Utc>>) -> Vec<Event> {
        self.query_at(Utc::now(), since)
    }

    pub fn query_at(&self, now: DateTime<Utc>, since: Option<DateTime<Utc>>) -> Vec<Event> {
        let mut events = self.lock();
        self.evict(&mut events, now);

        let floor = since.unwrap_or_else(|| {
            now.checked_sub_signed(self.retention)
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        });
        // reverse insertion order so equal timestamps stay newest-first after the stable sort
        let mut result: Vec<Event> = events
            .iter()
            .rev()
            .filter(|e| e.published_at >= floor)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        result
    }

    /// Look up a retained event by id.
    pub fn get(&self, id: &EventId) -> Option<Event> {
        let mut events = self.lock();
        self.evict(&mut events, Utc::now());
        events.iter().find(|e| &e.id == id).cloned()
    }

    pub fn size(&self) -> usize {
        self.size_at(Utc::now())
    }

    pub fn size_at(&self, now: DateTime<Utc>) -> usize {
        let mut events = self.lock();
        self.evict(&mut events, now);
        events.len()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, events: &mut VecDeque<Event>, event: Event) {
        events.push_back(event);
        while events.len() > self.max_events {
            events.pop_front();
        }
    }

    fn evict(&self, events: &mut VecDeque<Event>, now: DateTime<Utc>) {
        events.retain(|e| now - e.published_at < self.retention);
    }
}
