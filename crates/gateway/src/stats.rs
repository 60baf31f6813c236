//! Per-target second-resolution traffic counters.
//!
//! Each target owns a 3,600-slot ring indexed by `minute*60 + second` of the
//! current hour. The ring is zeroed once when the cursor wraps past slot 0.

use chrono::{DateTime, Timelike, Utc};
use dashmap::DashMap;
use serde::Serialize;

const SLOTS: usize = 3_600;

struct Ring {
    counter: Box<[u64]>,
    cell_visit: Box<[u8]>,
    last_slot: Option<usize>,
}

impl Ring {
    fn new() -> Self {
        Self {
            counter: vec![0u64; SLOTS].into_boxed_slice(),
            cell_visit: vec![0u8; SLOTS].into_boxed_slice(),
            last_slot: None,
        }
    }

    fn hit(&mut self, slot: usize) {
        if self.last_slot == Some(slot) {
            self.counter[slot] += 1;
            return;
        }
        if slot == 0 {
            self.counter.fill(0);
            self.cell_visit.fill(0);
        }
        self.cell_visit[slot] = 1;
        self.counter[slot] = 1;
        self.last_slot = Some(slot);
    }

    fn window_sum(&self, cursor: usize, width: usize) -> u64 {
        (0..width)
            .map(|back| self.counter[(cursor + SLOTS - back) % SLOTS])
            .sum()
    }
}

/// Sliding-window sums relative to the current second.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Aggregates {
    #[serde(rename = "1s")]
    pub one_second: u64,
    #[serde(rename = "1m")]
    pub one_minute: u64,
    #[serde(rename = "5m")]
    pub five_minutes: u64,
    #[serde(rename = "15m")]
    pub fifteen_minutes: u64,
    #[serde(rename = "30m")]
    pub thirty_minutes: u64,
    #[serde(rename = "1h")]
    pub one_hour: u64,
}

/// Lazily-created per-target rings.
#[derive(Default)]
pub struct StatsRing {
    rings: DashMap<String, Ring>,
}

fn slot_of(now: DateTime<Utc>) -> usize {
    (now.minute() * 60 + now.second()) as usize
}

impl StatsRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one event against `target`.
    pub fn log(&self, target: &str) {
        self.log_at(target, Utc::now());
    }

    fn log_at(&self, target: &str, now: DateTime<Utc>) {
        let slot = slot_of(now);
        self.rings
            .entry(target.to_string())
            .or_insert_with(Ring::new)
            .hit(slot);
    }

    /// Window aggregates for one target.
    pub fn aggregates(&self, target: &str) -> Option<Aggregates> {
        self.aggregates_at(target, Utc::now())
    }

    fn aggregates_at(&self, target: &str, now: DateTime<Utc>) -> Option<Aggregates> {
        let ring = self.rings.get(target)?;
        let cursor = slot_of(now);
        Some(Aggregates {
            one_second: ring.window_sum(cursor, 1),
            one_minute: ring.window_sum(cursor, 60),
            five_minutes: ring.window_sum(cursor, 300),
            fifteen_minutes: ring.window_sum(cursor, 900),
            thirty_minutes: ring.window_sum(cursor, 1_800),
            one_hour: ring.window_sum(cursor, SLOTS),
        })
    }

    /// Counters re-rotated so the most recent slot is last.
    pub fn series(&self, target: &str) -> Option<Vec<u64>> {
        self.series_at(target, Utc::now())
    }

    fn series_at(&self, target: &str, now: DateTime<Utc>) -> Option<Vec<u64>> {
        let ring = self.rings.get(target)?;
        let cursor = slot_of(now);
        Some(
            (0..SLOTS)
                .map(|i| ring.counter[(cursor + 1 + i) % SLOTS])
                .collect(),
        )
    }

    /// Aggregates for every known target.
    pub fn all_aggregates(&self) -> Vec<(String, Aggregates)> {
        let now = Utc::now();
        self.rings
            .iter()
            .filter_map(|entry| {
                self.aggregates_at(entry.key(), now)
                    .map(|a| (entry.key().clone(), a))
            })
            .collect()
    }
}
