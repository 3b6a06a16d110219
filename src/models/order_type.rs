//! Order direction and kind as exchanged with the master and the broker.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Market or pending order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    Buy,
    Sell,
    BuyLimit,
    SellLimit,
    BuyStop,
    SellStop,
}

impl OrderType {
    /// Mirror the direction, keeping the order kind.
    pub fn reversed(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
            Self::BuyLimit => Self::SellLimit,
            Self::SellLimit => Self::BuyLimit,
            Self::BuyStop => Self::SellStop,
            Self::SellStop => Self::BuyStop,
        }
    }

    /// True for limit and stop orders.
    pub fn is_pending(self) -> bool {
        !matches!(self, Self::Buy | Self::Sell)
    }

    pub fn is_buy(self) -> bool {
        matches!(self, Self::Buy | Self::BuyLimit | Self::BuyStop)
    }

    /// The market side this order eventually fills as.
    pub fn market_side(self) -> Self {
        if self.is_buy() {
            Self::Buy
        } else {
            Self::Sell
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "Buy",
            Self::Sell => "Sell",
            Self::BuyLimit => "BuyLimit",
            Self::SellLimit => "SellLimit",
            Self::BuyStop => "BuyStop",
            Self::SellStop => "SellStop",
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-' && *c != ' ')
            .collect::<String>()
            .to_lowercase();

        match normalized.as_str() {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            "buylimit" => Ok(Self::BuyLimit),
            "selllimit" => Ok(Self::SellLimit),
            "buystop" => Ok(Self::BuyStop),
            "sellstop" => Ok(Self::SellStop),
            _ => Err(format!("unknown order type: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reverse_swaps_direction_only() {
        assert_eq!(OrderType::Buy.reversed(), OrderType::Sell);
        assert_eq!(OrderType::SellLimit.reversed(), OrderType::BuyLimit);
        assert_eq!(OrderType::BuyStop.reversed(), OrderType::SellStop);
        assert_eq!(OrderType::SellStop.reversed().reversed(), OrderType::SellStop);
    }

    #[test]
    fn test_parse_accepts_platform_spellings() {
        assert_eq!("BUY".parse::<OrderType>().unwrap(), OrderType::Buy);
        assert_eq!("sell_limit".parse::<OrderType>().unwrap(), OrderType::SellLimit);
        assert_eq!("BuyStop".parse::<OrderType>().unwrap(), OrderType::BuyStop);
        assert!("close".parse::<OrderType>().is_err());
    }

    #[test]
    fn test_pending_and_side() {
        assert!(!OrderType::Sell.is_pending());
        assert!(OrderType::BuyLimit.is_pending());
        assert_eq!(OrderType::SellStop.market_side(), OrderType::Sell);
        assert_eq!(OrderType::BuyLimit.market_side(), OrderType::Buy);
    }
}
