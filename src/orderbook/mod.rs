//! Market data values carried through the fan-out: price snapshots,
//! full-depth book snapshots and last-trade events.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A single price level in the order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// One side of the book while it is being assembled from a snapshot.
#[derive(Debug, Clone, Default)]
pub struct BookSide {
    /// BTreeMap keyed by price. For bids, iterate descending; for asks, ascending.
    pub levels: BTreeMap<Decimal, Decimal>,
}

impl BookSide {
    /// Replace every level. Zero-size levels are dropped; a repeated price
    /// keeps the last size seen.
    pub fn apply_snapshot(&mut self, levels: &[PriceLevel]) {
        self.levels.clear();
        for level in levels {
            if level.size > Decimal::ZERO {
                self.levels.insert(level.price, level.size);
            }
        }
    }

    /// Levels ordered best-first for the given side.
    pub fn best_first(&self, is_bid: bool) -> Vec<PriceLevel> {
        let to_level = |(p, s): (&Decimal, &Decimal)| PriceLevel::new(*p, *s);
        if is_bid {
            self.levels.iter().rev().map(to_level).collect()
        } else {
            self.levels.iter().map(to_level).collect()
        }
    }
}

/// Full book for one instrument. Replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookSnapshot {
    pub asset_id: String,
    /// Best (highest) bid first.
    pub bids: Vec<PriceLevel>,
    /// Best (lowest) ask first.
    pub asks: Vec<PriceLevel>,
    pub timestamp: u64,
}

impl BookSnapshot {
    /// Build a snapshot from levels in any order.
    pub fn from_levels(
        asset_id: impl Into<String>,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        timestamp: u64,
    ) -> Self {
        let mut bid_side = BookSide::default();
        let mut ask_side = BookSide::default();
        bid_side.apply_snapshot(bids);
        ask_side.apply_snapshot(asks);
        Self {
            asset_id: asset_id.into(),
            bids: bid_side.best_first(true),
            asks: ask_side.best_first(false),
            timestamp,
        }
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        let best_bid = self.best_bid()?.price;
        let best_ask = self.best_ask()?.price;
        Some((best_bid + best_ask) / Decimal::from(2))
    }

    /// Total depth in USDC across top N levels on each side.
    pub fn total_depth(&self, n_levels: usize) -> Decimal {
        let notional = |levels: &[PriceLevel]| -> Decimal {
            levels.iter().take(n_levels).map(|l| l.price * l.size).sum()
        };
        notional(&self.bids) + notional(&self.asks)
    }
}

impl fmt::Display for BookSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmt_opt = |v: Option<Decimal>| v.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        write!(
            f,
            "{}  bid={} ask={} spread={} depth_5={}",
            self.asset_id.chars().take(12).collect::<String>(),
            fmt_opt(self.best_bid().map(|l| l.price)),
            fmt_opt(self.best_ask().map(|l| l.price)),
            fmt_opt(self.spread()),
            self.total_depth(5),
        )
    }
}

/// Latest price for one instrument. Price, midpoint and spread are always
/// derived together from the same update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceSnapshot {
    pub asset_id: String,
    pub price: Decimal,
    pub midpoint: Decimal,
    pub spread: Decimal,
    pub timestamp: u64,
}

impl PriceSnapshot {
    /// Derive a snapshot from whatever the update carried.
    ///
    /// With both quotes present the midpoint is the price and the spread is
    /// `ask - bid`. Otherwise the raw price is used with a zero spread.
    /// Returns `None` when the inputs give no price in `[0, 1]`.
    pub fn from_quotes(
        asset_id: impl Into<String>,
        price: Option<Decimal>,
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
        timestamp: u64,
    ) -> Option<Self> {
        let (price, midpoint, spread) = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) if bid > Decimal::ZERO && ask > Decimal::ZERO && ask >= bid => {
                let mid = (bid + ask) / Decimal::from(2);
                (mid, mid, ask - bid)
            }
            _ => {
                let p = price?;
                (p, p, Decimal::ZERO)
            }
        };
        if !is_probability(price) {
            return None;
        }
        Some(Self {
            asset_id: asset_id.into(),
            price,
            midpoint,
            spread,
            timestamp,
        })
    }
}

fn is_probability(p: Decimal) -> bool {
    p >= Decimal::ZERO && p <= Decimal::ONE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(format!("unknown trade side: {other}")),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// A trade print. Forwarded to subscribers, never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeEvent {
    pub asset_id: String,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    pub timestamp: u64,
}
