//! Contract-activity adapter over an EtherScan-compatible API.
//!
//! Fetches the transaction list of the monitored contract and exposes
//! each call as a record carrying its method selector and caller.

use super::{DataSource, SourceError};
use crate::stream::{OrderingKey, RawRecord, RecordData};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

const ETHERSCAN_API_URL: &str = "https://api.etherscan.io/v2/api";

/// Length of "0x" plus an 8-hex-digit method selector.
const SELECTOR_LEN: usize = 10;

#[derive(Debug, Deserialize)]
struct EtherScanResponse {
    status: String,
    message: String,
    #[serde(default)]
    result: Vec<TxListItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxListItem {
    block_number: String,
    transaction_index: String,
    hash: String,
    from: String,
    input: String,
    is_error: String,
}

/// Transactions sent to one contract, ordered by `(block, tx index)`.
pub struct ContractTxSource {
    chain_id: u32,
    contract_address: String,
    api_key: String,
    http: reqwest::Client,
}

impl ContractTxSource {
    pub fn new(
        chain_id: u32,
        contract_address: String,
        api_key: String,
        http: reqwest::Client,
    ) -> Self {
        Self {
            chain_id,
            contract_address,
            api_key,
            http,
        }
    }

    fn parse_tx(item: TxListItem) -> Result<RawRecord, SourceError> {
        let block_number: u64 = item
            .block_number
            .parse()
            .map_err(|e| SourceError::Data(format!("invalid block number: {e}")))?;
        let tx_index: u64 = item
            .transaction_index
            .parse()
            .map_err(|e| SourceError::Data(format!("invalid transaction index: {e}")))?;
        // `get` also rejects input where byte 10 is not a char boundary,
        // which a well-formed hex calldata string never hits.
        let method = item.input.get(..SELECTOR_LEN).ok_or_else(|| {
            SourceError::Data(format!(
                "input missing a method selector: {}",
                item.input
            ))
        })?;
        Ok(RawRecord {
            id: item.hash.as_str().into(),
            key: OrderingKey::block(block_number, tx_index),
            data: RecordData::ContractCall {
                method: method.into(),
                caller: item.from.as_str().into(),
            },
        })
    }
}

#[async_trait]
impl DataSource for ContractTxSource {
    async fn fetch(&self, since: OrderingKey) -> Result<Vec<RawRecord>, SourceError> {
        let response = self
            .http
            .get(ETHERSCAN_API_URL)
            .query(&[
                ("apiKey", self.api_key.as_str()),
                ("chainid", self.chain_id.to_string().as_str()),
                ("module", "account"),
                ("action", "txlist"),
                ("address", self.contract_address.as_str()),
                ("startblock", since.primary.to_string().as_str()),
                ("page", "1"),
                ("offset", "200"),
                ("sort", "asc"),
            ])
            .send()
            .await?;
        let response: EtherScanResponse = response.json().await?;

        // EtherScan reports an empty result as status 0.
        if response.status != "1" && response.message != "No transactions found" {
            return Err(SourceError::Unavailable(format!(
                "etherscan API error: {}",
                response.message
            )));
        }

        let mut records = Vec::new();
        for item in response.result {
            // Reverted calls never produce a notifiable event.
            if item.is_error == "1" {
                continue;
            }
            match Self::parse_tx(item) {
                Ok(record) if record.key > since => records.push(record),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Dropping malformed etherscan record"),
            }
        }
        Ok(records)
    }
}
