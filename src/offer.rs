use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

pub const ACCEPT_RATIO: Decimal = dec!(0.90);
pub const COUNTER_RATIO: Decimal = dec!(0.75);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferDecision {
    Accept,
    Counter,
    Reject,
}

pub fn evaluate(listing_price: Decimal, offer_price: Decimal) -> OfferDecision {
    if offer_price >= listing_price * ACCEPT_RATIO {
        OfferDecision::Accept
    } else if offer_price >= listing_price * COUNTER_RATIO {
        OfferDecision::Counter
    } else {
        OfferDecision::Reject
    }
}

/// The price a seller counters with: the lowest offer it would accept.
pub fn counter_price(listing_price: Decimal) -> Decimal {
    (listing_price * ACCEPT_RATIO).normalize()
}
