use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{DomainError, Side};

/// A request to place one order.
///
/// Fields are kept as received so that [`OrderValidator`](crate::OrderValidator)
/// can report exactly what is wrong with them. Odds and stake are exact
/// decimals and travel as strings on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub user_id: String,
    pub event_id: String,
    pub market_id: String,
    pub selection_id: String,
    /// `BACK` or `LAY`.
    pub side: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub odds: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub stake: Decimal,
    /// ISO-4217 style three letter code.
    pub currency: String,
    /// Caller-supplied key identifying this placement attempt.
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl OrderRequest {
    pub fn side(&self) -> Result<Side, DomainError> {
        self.side.parse()
    }

    /// Amount the user stands to lose, which is what gets reserved.
    ///
    /// A backer risks the stake; a layer risks paying out the stake at the
    /// given odds.
    pub fn liability(&self) -> Result<Decimal, DomainError> {
        Ok(match self.side()? {
            Side::Back => self.stake,
            Side::Lay => self.stake * self.odds,
        })
    }

    /// Profit if the order wins, excluding the returned stake.
    pub fn potential_winnings(&self) -> Result<Decimal, DomainError> {
        Ok(match self.side()? {
            Side::Back => self.stake * (self.odds - Decimal::ONE),
            Side::Lay => self.stake,
        })
    }
}
