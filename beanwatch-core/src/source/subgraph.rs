//! GraphQL subgraph adapters.
//!
//! The Bean, Beanstalk and Basin subgraphs expose indexed protocol data
//! through plain GraphQL-over-HTTP. These adapters issue one query per
//! fetch, keyed on the stream cursor, and map entities to typed records.
//! Numeric fields arrive as JSON strings and are parsed per record; a
//! record that fails to parse is logged and skipped.

use super::{DataSource, SourceError};
use crate::stream::{OrderingKey, RawRecord, RecordData};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::str::FromStr;
use tracing::warn;
use url::Url;

/// Page size for subgraph queries. Large enough that a stream falling
/// behind catches up within a few cycles.
const PAGE_SIZE: u32 = 200;

#[derive(Debug, Deserialize)]
struct GraphResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQueryError>,
}

#[derive(Debug, Deserialize)]
struct GraphQueryError {
    message: String,
}

/// Minimal GraphQL-over-HTTP client shared by the subgraph adapters.
#[derive(Clone)]
pub struct SubgraphClient {
    endpoint: Url,
    http: reqwest::Client,
}

impl SubgraphClient {
    pub fn new(endpoint: Url, http: reqwest::Client) -> Self {
        Self { endpoint, http }
    }

    async fn query<T: DeserializeOwned>(&self, query: String) -> Result<T, SourceError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Unavailable(format!(
                "subgraph returned HTTP {status}"
            )));
        }

        let body: GraphResponse<T> = response.json().await?;
        if let Some(err) = body.errors.first() {
            // Indexer errors are usually transient (resyncing, lag).
            return Err(SourceError::Unavailable(format!(
                "subgraph query error: {}",
                err.message
            )));
        }
        body.data
            .ok_or_else(|| SourceError::Data("subgraph response missing data".to_string()))
    }
}

fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, SourceError> {
    Decimal::from_str(raw).map_err(|e| SourceError::Data(format!("invalid {field} `{raw}`: {e}")))
}

fn parse_u64(field: &str, raw: &str) -> Result<u64, SourceError> {
    raw.parse()
        .map_err(|e| SourceError::Data(format!("invalid {field} `{raw}`: {e}")))
}

/// Collect per-record parse results, dropping and logging failures.
fn collect_records<I, T>(
    items: I,
    parse: impl Fn(T) -> Result<RawRecord, SourceError>,
) -> Vec<RawRecord>
where
    I: IntoIterator<Item = T>,
{
    let mut records = Vec::new();
    for item in items {
        match parse(item) {
            Ok(record) => records.push(record),
            Err(e) => warn!(error = %e, "Dropping malformed subgraph record"),
        }
    }
    records
}

// ---------------------------------------------------------------------------
// Price ticks (Bean subgraph)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PriceTickData {
    #[serde(rename = "beanHourlySnapshots")]
    snapshots: Vec<PriceTickItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceTickItem {
    id: String,
    season_number: u64,
    price: String,
}

/// Bean price observations, one per season, ordered by season number.
pub struct PriceSource {
    client: SubgraphClient,
}

impl PriceSource {
    pub fn new(client: SubgraphClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DataSource for PriceSource {
    async fn fetch(&self, since: OrderingKey) -> Result<Vec<RawRecord>, SourceError> {
        let query = format!(
            "{{ beanHourlySnapshots(first: {PAGE_SIZE}, orderBy: seasonNumber, \
             orderDirection: asc, where: {{ seasonNumber_gt: {} }}) \
             {{ id seasonNumber price }} }}",
            since.primary
        );
        let data: PriceTickData = self.client.query(query).await?;
        Ok(collect_records(data.snapshots, |item| {
            Ok(RawRecord {
                id: item.id.as_str().into(),
                key: OrderingKey::sequence(item.season_number),
                data: RecordData::PriceTick {
                    price: parse_decimal("price", &item.price)?,
                },
            })
        }))
    }
}

// ---------------------------------------------------------------------------
// Season snapshots (Beanstalk subgraph)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SeasonData {
    seasons: Vec<SeasonItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeasonItem {
    id: String,
    season: u64,
    reward_beans: String,
    sown_beans: String,
    soil: String,
    temperature: String,
}

/// Hourly season snapshots with mint/sow/soil/temperature stats.
pub struct SeasonSource {
    client: SubgraphClient,
}

impl SeasonSource {
    pub fn new(client: SubgraphClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DataSource for SeasonSource {
    async fn fetch(&self, since: OrderingKey) -> Result<Vec<RawRecord>, SourceError> {
        let query = format!(
            "{{ seasons(first: {PAGE_SIZE}, orderBy: season, orderDirection: asc, \
             where: {{ season_gt: {} }}) \
             {{ id season rewardBeans sownBeans soil temperature }} }}",
            since.primary
        );
        let data: SeasonData = self.client.query(query).await?;
        Ok(collect_records(data.seasons, |item| {
            Ok(RawRecord {
                id: item.id.as_str().into(),
                key: OrderingKey::sequence(item.season),
                data: RecordData::Season {
                    season: item.season,
                    minted_beans: parse_decimal("rewardBeans", &item.reward_beans)?,
                    sown_beans: parse_decimal("sownBeans", &item.sown_beans)?,
                    soil: parse_decimal("soil", &item.soil)?,
                    temperature: parse_decimal("temperature", &item.temperature)?,
                },
            })
        }))
    }
}

// ---------------------------------------------------------------------------
// Well swaps (Basin subgraph)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SwapData {
    swaps: Vec<SwapItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapItem {
    id: String,
    block_number: String,
    log_index: String,
    well: NamedEntity,
    from_token: SymbolEntity,
    to_token: SymbolEntity,
    amount_in: String,
    amount_out: String,
    #[serde(rename = "amountUSD")]
    amount_usd: String,
}

#[derive(Debug, Deserialize)]
struct NamedEntity {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SymbolEntity {
    symbol: String,
}

/// Swaps through Basin wells, ordered by `(block, log index)`.
pub struct WellSwapSource {
    client: SubgraphClient,
}

impl WellSwapSource {
    pub fn new(client: SubgraphClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DataSource for WellSwapSource {
    async fn fetch(&self, since: OrderingKey) -> Result<Vec<RawRecord>, SourceError> {
        // `blockNumber_gte` plus a client-side key filter: the cursor can
        // sit mid-block, and `_gt` on the block would skip the rest of it.
        let query = format!(
            "{{ swaps(first: {PAGE_SIZE}, orderBy: blockNumber, orderDirection: asc, \
             where: {{ blockNumber_gte: {} }}) \
             {{ id blockNumber logIndex well {{ name }} fromToken {{ symbol }} \
             toToken {{ symbol }} amountIn amountOut amountUSD }} }}",
            since.primary
        );
        let data: SwapData = self.client.query(query).await?;
        let mut records = collect_records(data.swaps, |item| {
            let key = OrderingKey::block(
                parse_u64("blockNumber", &item.block_number)?,
                parse_u64("logIndex", &item.log_index)?,
            );
            Ok(RawRecord {
                id: item.id.as_str().into(),
                key,
                data: RecordData::WellSwap {
                    well: item.well.name.as_str().into(),
                    from_token: item.from_token.symbol.as_str().into(),
                    to_token: item.to_token.symbol.as_str().into(),
                    amount_in: parse_decimal("amountIn", &item.amount_in)?,
                    amount_out: parse_decimal("amountOut", &item.amount_out)?,
                    value_usd: parse_decimal("amountUSD", &item.amount_usd)?,
                },
            })
        });
        records.retain(|r| r.key > since);
        Ok(records)
    }
}
