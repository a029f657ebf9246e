//! Change-log records and the ordered keys that sequence them
//!
//! A link's value is never stored directly; the store holds one record per
//! change, and the current value is the fold of those records in key order.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Totally ordered change key: zero-padded hex wall-clock milliseconds plus
/// a random hex tie-breaker, compared lexicographically.
///
/// This is a heuristic total order, not a causal one. Two devices with
/// skewed clocks can produce keys whose order contradicts causality; the
/// link compensates by replaying the full change log whenever it observes a
/// key that sorts before the latest applied one. The tie-break rule is load
/// bearing and must not be replaced with a logical clock.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderedKey(String);

impl OrderedKey {
    pub fn from_string(key: impl Into<String>) -> Self {
        OrderedKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OrderedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-link generator of OrderedKeys.
///
/// Deliberately not a process-wide singleton: each link owns its own
/// instance, and tests inject a seed for determinism.
pub struct KeyGenerator {
    rng: StdRng,
    last: Option<OrderedKey>,
}

impl KeyGenerator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            last: None,
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            last: None,
        }
    }

    /// Produce a key strictly greater than any key this generator issued
    /// before, so a single writer's changes are monotonic by key.
    pub fn next(&mut self) -> OrderedKey {
        loop {
            let millis = Utc::now().timestamp_millis().max(0) as u64;
            let key = OrderedKey(format!("{:016x}-{:08x}", millis, self.rng.gen::<u32>()));
            if self.last.as_ref().map_or(true, |last| *last < key) {
                self.last = Some(key.clone());
                return key;
            }
        }
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// The three patch operations a link document understands. Matched
/// exhaustively at apply time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchOp {
    Set,
    Update,
    Erase,
}

/// One atomic patch applied to a link document, identified by its key.
/// Immutable once created; persisted as JSON bytes under the link's
/// namespace in the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub key: OrderedKey,
    pub op: PatchOp,
    pub path: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ChangeRecord {
    pub fn set(key: OrderedKey, path: Vec<String>, payload: Value) -> Self {
        Self {
            key,
            op: PatchOp::Set,
            path,
            payload: Some(payload),
        }
    }

    pub fn update(key: OrderedKey, path: Vec<String>, payload: Value) -> Self {
        Self {
            key,
            op: PatchOp::Update,
            path,
            payload: Some(payload),
        }
    }

    pub fn erase(key: OrderedKey, path: Vec<String>) -> Self {
        Self {
            key,
            op: PatchOp::Erase,
            path,
            payload: None,
        }
    }
}

/// Merge two change sequences, each ascending by key, into one ascending
/// sequence. Records with equal keys are defined to be identical (the same
/// change seen as persisted history and as a still-unconfirmed local
/// write), so one of the pair is kept.
pub fn merge_sorted(history: Vec<ChangeRecord>, pending: &[ChangeRecord]) -> Vec<ChangeRecord> {
    let mut merged = Vec::with_capacity(history.len() + pending.len());
    let mut h = history.into_iter().peekable();
    let mut p = pending.iter().peekable();

    loop {
        match (h.peek(), p.peek()) {
            (Some(a), Some(b)) => {
                if a.key < b.key {
                    merged.push(h.next().expect("peeked"));
                } else if b.key < a.key {
                    merged.push(p.next().expect("peeked").clone());
                } else {
                    merged.push(h.next().expect("peeked"));
                    p.next();
                }
            }
            (Some(_), None) => merged.push(h.next().expect("peeked")),
            (None, Some(_)) => merged.push(p.next().expect("peeked").clone()),
            (None, None) => break,
        }
    }
    merged
}
