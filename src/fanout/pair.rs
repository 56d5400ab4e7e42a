//! Yes/no pair correlation.
//!
//! Each subscription holding a [`PairBinding`] owns a [`PairTracker`] that
//! stays in `WaitingForBoth` until each side has been priced since the
//! subscription was created. From then on every price on either side yields
//! a [`PairUpdate`].

use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairBinding {
    pub yes_id: String,
    pub no_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairSide {
    Yes,
    No,
}

impl PairBinding {
    pub fn new(yes_id: impl Into<String>, no_id: impl Into<String>) -> Self {
        Self {
            yes_id: yes_id.into(),
            no_id: no_id.into(),
        }
    }

    pub fn side_of(&self, asset_id: &str) -> Option<PairSide> {
        if asset_id == self.yes_id {
            Some(PairSide::Yes)
        } else if asset_id == self.no_id {
            Some(PairSide::No)
        } else {
            None
        }
    }
}

/// Combined signal for a complementary pair. `spread` is `price_yes + price_no`,
/// which sits near 1 for a consistent market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairUpdate {
    pub yes_id: String,
    pub no_id: String,
    pub price_yes: Decimal,
    pub price_no: Decimal,
    pub spread: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    WaitingForBoth {
        yes: Option<Decimal>,
        no: Option<Decimal>,
    },
    Ready {
        yes: Decimal,
        no: Decimal,
    },
}

#[derive(Debug, Clone)]
pub struct PairTracker {
    binding: PairBinding,
    state: PairState,
}

impl PairTracker {
    pub fn new(binding: PairBinding) -> Self {
        Self {
            binding,
            state: PairState::WaitingForBoth { yes: None, no: None },
        }
    }

    pub fn binding(&self) -> &PairBinding {
        &self.binding
    }

    pub fn state(&self) -> PairState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, PairState::Ready { .. })
    }

    /// Record an applied price for one side. Returns the pair event once
    /// both sides are known.
    pub fn observe(&mut self, asset_id: &str, price: Decimal) -> Option<PairUpdate> {
        let side = self.binding.side_of(asset_id)?;

        self.state = match (self.state, side) {
            (PairState::WaitingForBoth { no, .. }, PairSide::Yes) => match no {
                Some(no) => PairState::Ready { yes: price, no },
                None => PairState::WaitingForBoth {
                    yes: Some(price),
                    no: None,
                },
            },
            (PairState::WaitingForBoth { yes, .. }, PairSide::No) => match yes {
                Some(yes) => PairState::Ready { yes, no: price },
                None => PairState::WaitingForBoth {
                    yes: None,
                    no: Some(price),
                },
            },
            (PairState::Ready { no, .. }, PairSide::Yes) => PairState::Ready { yes: price, no },
            (PairState::Ready { yes, .. }, PairSide::No) => PairState::Ready { yes, no: price },
        };

        match self.state {
            PairState::Ready { yes, no } => Some(PairUpdate {
                yes_id: self.binding.yes_id.clone(),
                no_id: self.binding.no_id.clone(),
                price_yes: yes,
                price_no: no,
                spread: yes + no,
            }),
            PairState::WaitingForBoth { .. } => None,
        }
    }
}
