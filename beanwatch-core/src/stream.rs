//! Core data model for monitored streams.
//!
//! A *stream* is one independently monitored source of protocol events
//! (peg crosses, seasons, well swaps, contract activity). Each stream owns
//! a cursor into its source's ordering and a bounded memory of recently
//! dispatched records, both of which persist across restarts.

use compact_str::CompactString;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Position of a record within a stream's total order.
///
/// For on-chain log streams this is `(block number, log index)`; for
/// sequence-numbered streams (seasons, peg-cross ids) the secondary
/// component is zero. The derived `Ord` compares primary first, then
/// secondary, which is exactly the dispatch order guarantee.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OrderingKey {
    pub primary: u64,
    pub secondary: u64,
}

impl OrderingKey {
    pub const ZERO: OrderingKey = OrderingKey {
        primary: 0,
        secondary: 0,
    };

    /// Key for an on-chain log position.
    pub fn block(block_number: u64, log_index: u64) -> Self {
        Self {
            primary: block_number,
            secondary: log_index,
        }
    }

    /// Key for a sequence-numbered record (season number, cross id).
    pub fn sequence(seq: u64) -> Self {
        Self {
            primary: seq,
            secondary: 0,
        }
    }
}

impl std::fmt::Display for OrderingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.primary, self.secondary)
    }
}

/// Typed payload of a record as returned by a data source adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordData {
    /// A bean price observation.
    PriceTick { price: Decimal },
    /// A season (hourly epoch) snapshot.
    Season {
        season: u64,
        minted_beans: Decimal,
        sown_beans: Decimal,
        soil: Decimal,
        temperature: Decimal,
    },
    /// A swap through a Basin well.
    WellSwap {
        well: CompactString,
        from_token: CompactString,
        to_token: CompactString,
        amount_in: Decimal,
        amount_out: Decimal,
        value_usd: Decimal,
    },
    /// A transaction calling into the monitored contract.
    ContractCall {
        method: CompactString,
        caller: CompactString,
    },
}

/// One item fetched from a data source, positioned within its stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// Stream-unique identifier of the source record (tx hash, entity id).
    pub id: CompactString,
    pub key: OrderingKey,
    pub data: RecordData,
}

/// The kinds of notifiable events the classifier can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    PegCross,
    Season,
    WellSwap,
    ContractActivity,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::PegCross => write!(f, "peg-cross"),
            EventKind::Season => write!(f, "season"),
            EventKind::WellSwap => write!(f, "well-swap"),
            EventKind::ContractActivity => write!(f, "contract-activity"),
        }
    }
}

/// Direction of a peg cross.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossDirection {
    Above,
    Below,
}

/// Kind-specific payload of a classified event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    PegCross {
        price: Decimal,
        direction: CrossDirection,
    },
    Season {
        season: u64,
        minted_beans: Decimal,
        sown_beans: Decimal,
        soil: Decimal,
        temperature: Decimal,
    },
    WellSwap {
        well: CompactString,
        from_token: CompactString,
        to_token: CompactString,
        amount_in: Decimal,
        amount_out: Decimal,
        value_usd: Decimal,
    },
    ContractActivity {
        method: CompactString,
        caller: CompactString,
    },
}

/// A notifiable event produced by classification, not yet deduplicated.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateEvent {
    pub kind: EventKind,
    pub source_record_id: CompactString,
    pub key: OrderingKey,
    pub payload: EventPayload,
}

impl CandidateEvent {
    /// Plain-text message delivered to channels. Content templates are
    /// deliberately minimal; channels own any platform-specific markup.
    pub fn render(&self) -> String {
        match &self.payload {
            EventPayload::PegCross { price, direction } => match direction {
                CrossDirection::Above => format!("BEAN crossed above peg (${price})"),
                CrossDirection::Below => format!("BEAN crossed below peg (${price})"),
            },
            EventPayload::Season {
                season,
                minted_beans,
                sown_beans,
                soil,
                temperature,
            } => format!(
                "Season {season}: {minted_beans} Beans minted, {sown_beans} sown, \
                 {soil} soil, {temperature}% temperature"
            ),
            EventPayload::WellSwap {
                well,
                from_token,
                to_token,
                amount_in,
                amount_out,
                value_usd,
            } => format!(
                "Swap in {well}: {amount_in} {from_token} -> {amount_out} {to_token} (${value_usd})"
            ),
            EventPayload::ContractActivity { method, caller } => {
                format!("Contract call {method} from {caller}")
            }
        }
    }
}

/// Bounded memory of recently dispatched record ids.
///
/// Suppresses duplicates caused by overlapping fetch windows or source
/// reorgs. Each entry remembers the ordering key it was dispatched at so
/// that entries falling behind the cursor by more than the retention
/// window can be evicted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeenSet {
    entries: HashMap<CompactString, OrderingKey>,
}

impl SeenSet {
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn insert(&mut self, id: CompactString, key: OrderingKey) {
        self.entries.insert(id, key);
    }

    /// Drop entries whose primary key is more than `retention` behind
    /// `cursor`. Keeps the set bounded by the retention window.
    pub fn prune(&mut self, cursor: OrderingKey, retention: u64) {
        let floor = cursor.primary.saturating_sub(retention);
        self.entries.retain(|_, key| key.primary >= floor);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Persisted per-stream state: the resume cursor and the seen set.
///
/// Mutated only by the reconcile step and committed only after dispatch
/// accounting for the cycle has completed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    pub cursor: OrderingKey,
    pub seen: SeenSet,
}

impl Default for OrderingKey {
    fn default() -> Self {
        OrderingKey::ZERO
    }
}

/// Static per-stream configuration, immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub name: CompactString,
    pub poll_interval: Duration,
    /// Fetch attempts per cycle before giving up until the next interval.
    pub fetch_retry_budget: u32,
    /// Base delay for exponential fetch backoff within a cycle.
    pub fetch_backoff_base: Duration,
    /// Seen-set retention window, in primary-key units (blocks/sequences).
    pub seen_retention: u64,
}
