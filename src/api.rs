use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::token::MercariToken;
use crate::MERCARI_SEARCH_URL;

/// Request timeout for marketplace queries.
const SEARCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Listings requested per query, newest first.
const PAGE_SIZE: u32 = 120;

/// One marketplace listing, ephemeral per query.
#[derive(Debug, Clone, Deserialize)]
pub struct Listing {
    pub id: String,
    pub name: String,
    #[serde(deserialize_with = "flexible_string")]
    pub price: String,
    #[serde(default)]
    pub thumbnails: Vec<String>,
    #[serde(
        rename = "itemConditionId",
        default,
        deserialize_with = "flexible_i64"
    )]
    pub item_condition_id: i64,
    #[serde(deserialize_with = "flexible_i64")]
    pub created: i64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<Listing>,
}

/// Result of one keyword query.
///
/// `Rejected` is a value, not an error: it means the credential was refused
/// and must be regenerated, which the engine handles differently from
/// transient fetch failures.
#[derive(Debug)]
pub enum QueryOutcome {
    Batch(Vec<Listing>),
    Rejected,
}

/// Marketplace query seam, implemented by [`MercariClient`] in production.
#[async_trait]
pub trait MarketClient {
    async fn search(&self, keyword: &str, token: &MercariToken) -> Result<QueryOutcome>;
}

/// HTTP client for Mercari's v2 entity search.
pub struct MercariClient {
    http: reqwest::Client,
}

impl MercariClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http }
    }
}

impl Default for MercariClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketClient for MercariClient {
    async fn search(&self, keyword: &str, token: &MercariToken) -> Result<QueryOutcome> {
        let body = serde_json::json!({
            "userId": "",
            "pageSize": PAGE_SIZE,
            "pageToken": "",
            "searchSessionId": uuid::Uuid::new_v4().to_string(),
            "indexRouting": "INDEX_ROUTING_UNSPECIFIED",
            "searchCondition": {
                "keyword": keyword,
                "sort": "SORT_CREATED_TIME",
                "order": "ORDER_DESC",
                "status": ["STATUS_ON_SALE"],
            },
            "defaultDatasets": ["DATASET_TYPE_MERCARI"],
        });

        let resp = self
            .http
            .post(MERCARI_SEARCH_URL)
            .header("DPoP", token.as_str())
            .header("X-Platform", "web")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("search request for \"{keyword}\" failed"))?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                debug!("Search for \"{keyword}\" rejected: credential refused");
                Ok(QueryOutcome::Rejected)
            }
            status if status.is_success() => {
                let parsed: SearchResponse = resp
                    .json()
                    .await
                    .with_context(|| format!("malformed search response for \"{keyword}\""))?;
                debug!("Fetched {} listings for \"{keyword}\"", parsed.items.len());
                Ok(QueryOutcome::Batch(parsed.items))
            }
            status => anyhow::bail!("search for \"{keyword}\" returned {status}"),
        }
    }
}

/// Accept an integer field encoded either as a JSON number or a string.
fn flexible_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Accept a string field that may arrive as a JSON number.
fn flexible_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n.to_string()),
        Raw::Text(s) => Ok(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_listing_with_string_fields() {
        let raw = r#"{
            "id": "m90123456789",
            "name": "Pokemon card lot",
            "price": "3500",
            "thumbnails": ["https://static.mercdn.net/thumb/photos/m90_1.jpg"],
            "itemConditionId": "2",
            "created": "1724300000"
        }"#;
        let listing: Listing = serde_json::from_str(raw).unwrap();
        assert_eq!(listing.id, "m90123456789");
        assert_eq!(listing.price, "3500");
        assert_eq!(listing.item_condition_id, 2);
        assert_eq!(listing.created, 1_724_300_000);
    }

    #[test]
    fn deserialize_listing_with_numeric_fields() {
        let raw = r#"{
            "id": "m1",
            "name": "Gameboy",
            "price": 9800,
            "itemConditionId": 3,
            "created": 1724300123
        }"#;
        let listing: Listing = serde_json::from_str(raw).unwrap();
        assert_eq!(listing.price, "9800");
        assert_eq!(listing.item_condition_id, 3);
        assert_eq!(listing.created, 1_724_300_123);
        assert!(listing.thumbnails.is_empty());
    }

    #[test]
    fn deserialize_empty_search_response() {
        let parsed: SearchResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.items.is_empty());
    }

    #[test]
    fn deserialize_search_response_items() {
        let raw = r#"{"items": [
            {"id": "m1", "name": "a", "price": "100", "created": "10"},
            {"id": "m2", "name": "b", "price": "200", "created": "20"}
        ]}"#;
        let parsed: SearchResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.items[1].created, 20);
    }
}
