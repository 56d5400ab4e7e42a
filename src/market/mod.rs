//! Market resolution: map a market to its yes/no token pair.
//!
//! The fan-out only needs this narrow read interface. `GammaResolver` backs
//! it with the Gamma REST API, whose token and price arrays arrive as
//! stringified JSON.

use anyhow::{anyhow, Context};
use futures_util::future::BoxFuture;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// The two outcome tokens of a binary market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketTokens {
    pub market_id: String,
    pub question: String,
    pub yes_token_id: String,
    pub no_token_id: String,
    /// Reference prices from the listing, if it carried them.
    pub yes_price: Option<Decimal>,
    pub no_price: Option<Decimal>,
}

pub trait MarketResolver: Send + Sync {
    fn resolve<'a>(&'a self, market_id: &'a str) -> BoxFuture<'a, anyhow::Result<MarketTokens>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaMarket {
    #[serde(default)]
    condition_id: String,
    #[serde(default)]
    question: String,
    #[serde(default)]
    outcomes: Option<String>,
    #[serde(default)]
    clob_token_ids: Option<String>,
    #[serde(default)]
    outcome_prices: Option<String>,
}

fn parse_string_array(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
        .unwrap_or_default()
}

impl MarketTokens {
    fn from_gamma(m: &GammaMarket) -> Option<Self> {
        let tokens = parse_string_array(m.clob_token_ids.as_deref());
        if tokens.len() != 2 {
            return None;
        }
        let outcomes = parse_string_array(m.outcomes.as_deref());
        if !outcomes.is_empty() && outcomes.len() != tokens.len() {
            return None;
        }
        let prices: Vec<Option<Decimal>> = parse_string_array(m.outcome_prices.as_deref())
            .iter()
            .map(|p| Decimal::from_str(p).ok())
            .collect();

        // "Yes" is listed first by convention, but honour the outcome labels when present
        let yes_idx = outcomes
            .iter()
            .position(|o| o.eq_ignore_ascii_case("yes"))
            .unwrap_or(0);
        let no_idx = 1 - yes_idx.min(1);

        Some(Self {
            market_id: m.condition_id.clone(),
            question: m.question.clone(),
            yes_token_id: tokens[yes_idx].clone(),
            no_token_id: tokens[no_idx].clone(),
            yes_price: prices.get(yes_idx).copied().flatten(),
            no_price: prices.get(no_idx).copied().flatten(),
        })
    }
}

/// Resolves markets by condition id (`0x…`) or slug via the Gamma API.
pub struct GammaResolver {
    client: reqwest::Client,
    gamma_url: String,
}

impl GammaResolver {
    pub fn new(gamma_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build gamma http client")?;
        Ok(Self {
            client,
            gamma_url: gamma_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn fetch(&self, market_id: &str) -> anyhow::Result<MarketTokens> {
        let key = if market_id.starts_with("0x") {
            "condition_ids"
        } else {
            "slug"
        };
        let url = format!("{}/markets", self.gamma_url);
        debug!(url = %url, key, market_id, "resolving market");

        let markets: Vec<GammaMarket> = self
            .client
            .get(&url)
            .query(&[(key, market_id)])
            .send()
            .await
            .context("gamma request failed")?
            .error_for_status()
            .context("gamma returned an error status")?
            .json()
            .await
            .context("failed to decode gamma markets")?;

        let tokens = markets
            .iter()
            .find_map(MarketTokens::from_gamma)
            .ok_or_else(|| anyhow!("market {market_id} not found or not a binary market"))?;

        info!(
            market = %tokens.market_id,
            question = %tokens.question,
            yes = %tokens.yes_token_id,
            no = %tokens.no_token_id,
            "resolved market"
        );
        Ok(tokens)
    }
}

impl MarketResolver for GammaResolver {
    fn resolve<'a>(&'a self, market_id: &'a str) -> BoxFuture<'a, anyhow::Result<MarketTokens>> {
        Box::pin(self.fetch(market_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_from_gamma_listing() {
        let raw = r#"[{
            "conditionId": "0xabc",
            "question": "Will it rain?",
            "outcomes": "[\"No\", \"Yes\"]",
            "clobTokenIds": "[\"111\", \"222\"]",
            "outcomePrices": "[\"0.35\", \"0.65\"]"
        }]"#;
        let markets: Vec<GammaMarket> = serde_json::from_str(raw).unwrap();
        let tokens = MarketTokens::from_gamma(&markets[0]).unwrap();

        assert_eq!(tokens.yes_token_id, "222");
        assert_eq!(tokens.no_token_id, "111");
        assert_eq!(tokens.yes_price, Decimal::from_str("0.65").ok());
        assert_eq!(tokens.no_price, Decimal::from_str("0.35").ok());
    }

    #[test]
    fn test_non_binary_listing_is_rejected() {
        let raw = r#"{"conditionId":"0x1","clobTokenIds":"[\"1\",\"2\",\"3\"]"}"#;
        let market: GammaMarket = serde_json::from_str(raw).unwrap();
        assert!(MarketTokens::from_gamma(&market).is_none());

        let raw = r#"{"conditionId":"0x1"}"#;
        let market: GammaMarket = serde_json::from_str(raw).unwrap();
        assert!(MarketTokens::from_gamma(&market).is_none());
    }

    #[test]
    fn test_missing_labels_default_to_listing_order() {
        let raw = r#"{"conditionId":"0x1","clobTokenIds":"[\"y\",\"n\"]"}"#;
        let market: GammaMarket = serde_json::from_str(raw).unwrap();
        let tokens = MarketTokens::from_gamma(&market).unwrap();
        assert_eq!(tokens.yes_token_id, "y");
        assert_eq!(tokens.no_token_id, "n");
        assert_eq!(tokens.yes_price, None);
    }

    #[test]
    fn test_outcome_labels_must_match_tokens() {
        let raw = r#"{"conditionId":"0x1","outcomes":"[\"No\", \"Maybe\", \"Yes\"]","clobTokenIds":"[\"1\",\"2\"]"}"#;
        let market: GammaMarket = serde_json::from_str(raw).unwrap();
        assert!(MarketTokens::from_gamma(&market).is_none());
    }

    #[test]
    fn test_resolver_trims_trailing_slash() {
        let resolver = GammaResolver::new("https://gamma.test/").unwrap();
        assert_eq!(resolver.gamma_url, "https://gamma.test");
    }
}
