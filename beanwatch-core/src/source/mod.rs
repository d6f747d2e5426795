//! Data source adapters.
//!
//! A data source fetches the records of one stream strictly newer than a
//! cursor, in ascending order. Each call is independent and idempotent
//! for the same cursor, so a failed cycle can simply retry from the same
//! position. Individual malformed records are dropped and logged rather
//! than failing the batch.

pub mod etherscan;
pub mod subgraph;

use crate::stream::{OrderingKey, RawRecord};
use async_trait::async_trait;
use thiserror::Error;

pub use etherscan::ContractTxSource;
pub use subgraph::{PriceSource, SeasonSource, SubgraphClient, WellSwapSource};

/// Errors a data source fetch can produce.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Network or upstream API failure. Transient; never corrupts state.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The source returned a payload we cannot interpret.
    #[error("malformed source data: {0}")]
    Data(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        SourceError::Unavailable(e.to_string())
    }
}

/// Ordered record feed for one stream.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetch records strictly newer than `since`, ascending by ordering
    /// key. Returns an empty vec when there is nothing new.
    async fn fetch(&self, since: OrderingKey) -> Result<Vec<RawRecord>, SourceError>;
}
