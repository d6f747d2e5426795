//! Record classification.
//!
//! Classification decides whether a fetched record constitutes a
//! notifiable event, and of which kind. It is a deterministic function of
//! record content plus static stream configuration, so replaying a record
//! (overlapping fetch windows, crash-restart) always classifies the same
//! way; duplicate suppression happens later, in the reconcile step.

use crate::stream::{
    CandidateEvent, CrossDirection, EventKind, EventPayload, RawRecord, RecordData,
};
use compact_str::CompactString;
use rust_decimal::Decimal;
use std::collections::HashSet;

/// Which side of the peg a price sits on. A price exactly at the peg
/// counts as above, so touching the peg alone never produces a cross.
fn peg_side(price: Decimal, peg: Decimal) -> CrossDirection {
    if price >= peg {
        CrossDirection::Above
    } else {
        CrossDirection::Below
    }
}

/// Detects peg crosses from consecutive price ticks.
///
/// A cross is a *sign change* of `price - peg` between the previous tick
/// and the current one. A single out-of-range price is not a cross, and
/// the first tick ever observed only establishes the baseline.
#[derive(Debug, Clone)]
pub struct PegCrossClassifier {
    pub peg: Decimal,
}

impl PegCrossClassifier {
    fn classify(&self, prev: Option<&RawRecord>, record: &RawRecord) -> Option<CandidateEvent> {
        let RecordData::PriceTick { price } = record.data else {
            return None;
        };
        let RecordData::PriceTick { price: prev_price } = prev?.data else {
            return None;
        };
        let side = peg_side(price, self.peg);
        if peg_side(prev_price, self.peg) == side {
            return None;
        }
        Some(CandidateEvent {
            kind: EventKind::PegCross,
            source_record_id: record.id.clone(),
            key: record.key,
            payload: EventPayload::PegCross {
                price,
                direction: side,
            },
        })
    }
}

/// Every season snapshot is notifiable.
#[derive(Debug, Clone, Default)]
pub struct SeasonClassifier;

impl SeasonClassifier {
    fn classify(&self, record: &RawRecord) -> Option<CandidateEvent> {
        let RecordData::Season {
            season,
            minted_beans,
            sown_beans,
            soil,
            temperature,
        } = &record.data
        else {
            return None;
        };
        Some(CandidateEvent {
            kind: EventKind::Season,
            source_record_id: record.id.clone(),
            key: record.key,
            payload: EventPayload::Season {
                season: *season,
                minted_beans: *minted_beans,
                sown_beans: *sown_beans,
                soil: *soil,
                temperature: *temperature,
            },
        })
    }
}

/// Well swaps are notifiable when the trade value clears a floor,
/// filtering out dust that would otherwise flood channels.
#[derive(Debug, Clone)]
pub struct WellSwapClassifier {
    pub min_swap_usd: Decimal,
}

impl WellSwapClassifier {
    fn classify(&self, record: &RawRecord) -> Option<CandidateEvent> {
        let RecordData::WellSwap {
            well,
            from_token,
            to_token,
            amount_in,
            amount_out,
            value_usd,
        } = &record.data
        else {
            return None;
        };
        if *value_usd < self.min_swap_usd {
            return None;
        }
        Some(CandidateEvent {
            kind: EventKind::WellSwap,
            source_record_id: record.id.clone(),
            key: record.key,
            payload: EventPayload::WellSwap {
                well: well.clone(),
                from_token: from_token.clone(),
                to_token: to_token.clone(),
                amount_in: *amount_in,
                amount_out: *amount_out,
                value_usd: *value_usd,
            },
        })
    }
}

/// Contract calls are notifiable when the method selector is one of the
/// configured signatures. Anything else is uninteresting clutter.
#[derive(Debug, Clone)]
pub struct ContractActivityClassifier {
    pub methods: HashSet<CompactString>,
}

impl ContractActivityClassifier {
    fn classify(&self, record: &RawRecord) -> Option<CandidateEvent> {
        let RecordData::ContractCall { method, caller } = &record.data else {
            return None;
        };
        if !self.methods.contains(method) {
            return None;
        }
        Some(CandidateEvent {
            kind: EventKind::ContractActivity,
            source_record_id: record.id.clone(),
            key: record.key,
            payload: EventPayload::ContractActivity {
                method: method.clone(),
                caller: caller.clone(),
            },
        })
    }
}

/// The classifier attached to one stream.
#[derive(Debug, Clone)]
pub enum StreamClassifier {
    PegCross(PegCrossClassifier),
    Season(SeasonClassifier),
    WellSwap(WellSwapClassifier),
    ContractActivity(ContractActivityClassifier),
}

impl StreamClassifier {
    /// Classify one record. `prev` is the previous record in the stream's
    /// order (carried by the runner across batches), only consulted by
    /// classifiers that detect transitions rather than point conditions.
    /// Records the classifier does not recognize yield `None`.
    pub fn classify(&self, prev: Option<&RawRecord>, record: &RawRecord) -> Option<CandidateEvent> {
        match self {
            StreamClassifier::PegCross(c) => c.classify(prev, record),
            StreamClassifier::Season(c) => c.classify(record),
            StreamClassifier::WellSwap(c) => c.classify(record),
            StreamClassifier::ContractActivity(c) => c.classify(record),
        }
    }
}
