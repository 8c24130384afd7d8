use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, Entity, LedgerId, OperationId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Inbound,
    Outbound,
    Reserve,
    Release,
    Adjust,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Inbound => "inbound",
            OperationType::Outbound => "outbound",
            OperationType::Reserve => "reserve",
            OperationType::Release => "release",
            OperationType::Adjust => "adjust",
        }
    }
}

impl core::fmt::Display for OperationType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(OperationType::Inbound),
            "outbound" => Ok(OperationType::Outbound),
            "reserve" => Ok(OperationType::Reserve),
            "release" => Ok(OperationType::Release),
            "adjust" => Ok(OperationType::Adjust),
            other => Err(DomainError::validation(format!("unknown operation type: {other}"))),
        }
    }
}

/// Ledger entry: an immutable audit record of one change to a ledger.
///
/// `before_stock`/`after_stock` bracket the available bucket. `quantity` is a
/// magnitude for inbound/outbound/reserve/release and a signed delta for
/// adjustments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockOperation {
    pub id: OperationId,
    pub ledger_id: LedgerId,
    pub product_id: String,
    pub op_type: OperationType,
    pub quantity: i64,
    pub before_stock: i64,
    pub after_stock: i64,
    pub reason: String,
    pub related_order_id: Option<String>,
    pub operator_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StockOperation {
    /// Whether the entry moved quantity between or out of the buckets.
    pub fn changes_quantity(&self) -> bool {
        self.quantity != 0 || self.before_stock != self.after_stock
    }
}

impl Entity for StockOperation {
    type Id = OperationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_type_names_round_trip() {
        for ty in [
            OperationType::Inbound,
            OperationType::Outbound,
            OperationType::Reserve,
            OperationType::Release,
            OperationType::Adjust,
        ] {
            assert_eq!(ty.as_str().parse::<OperationType>().unwrap(), ty);
            assert_eq!(serde_json::to_value(ty).unwrap(), ty.as_str());
        }
        assert!("transfer".parse::<OperationType>().is_err());
    }
}
