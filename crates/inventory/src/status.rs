use core::str::FromStr;

use serde::{Deserialize, Serialize};

use stockledger_core::DomainError;

/// Projected ledger status.
///
/// Never set directly: always derived from quantities and the lock flag.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    Normal,
    Low,
    OutOfStock,
    Locked,
}

impl StockStatus {
    pub const ALL: [StockStatus; 4] = [
        StockStatus::Normal,
        StockStatus::Low,
        StockStatus::OutOfStock,
        StockStatus::Locked,
    ];

    /// Locked overrides everything; otherwise the available bucket is compared
    /// against the threshold.
    pub fn derive(available: i64, low_stock_threshold: i64, locked: bool) -> Self {
        if locked {
            StockStatus::Locked
        } else if available <= 0 {
            StockStatus::OutOfStock
        } else if available <= low_stock_threshold {
            StockStatus::Low
        } else {
            StockStatus::Normal
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StockStatus::Normal => "normal",
            StockStatus::Low => "low",
            StockStatus::OutOfStock => "out_of_stock",
            StockStatus::Locked => "locked",
        }
    }
}

impl core::fmt::Display for StockStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StockStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StockStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown stock status: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn threshold_boundaries() {
        assert_eq!(StockStatus::derive(0, 3, false), StockStatus::OutOfStock);
        assert_eq!(StockStatus::derive(3, 3, false), StockStatus::Low);
        assert_eq!(StockStatus::derive(4, 3, false), StockStatus::Normal);
        assert_eq!(StockStatus::derive(1, 0, false), StockStatus::Normal);
    }

    #[test]
    fn parses_its_own_names() {
        for status in StockStatus::ALL {
            assert_eq!(status.as_str().parse::<StockStatus>().unwrap(), status);
        }
        assert!("missing".parse::<StockStatus>().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn derivation_is_a_pure_function(
            available in 0i64..1_000,
            threshold in 0i64..1_000,
            locked in any::<bool>(),
        ) {
            let status = StockStatus::derive(available, threshold, locked);
            prop_assert_eq!(status, StockStatus::derive(available, threshold, locked));

            let expected = if locked {
                StockStatus::Locked
            } else if available == 0 {
                StockStatus::OutOfStock
            } else if available <= threshold {
                StockStatus::Low
            } else {
                StockStatus::Normal
            };
            prop_assert_eq!(status, expected);
        }
    }
}
