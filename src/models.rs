//! Records shared by the queue, the cache and the gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;

/// Server-assigned id returned on accepted submission.
pub type ServerId = String;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Who is recording sales on this terminal.
///
/// Passed explicitly to `enqueue` and `submit_sale`; nothing in the core reads
/// the signed-in user from global state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub cashier_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_id: Option<String>,
}

impl Session {
    pub fn new(cashier_id: impl Into<String>) -> Self {
        Self {
            cashier_id: cashier_id.into(),
            terminal_id: None,
        }
    }

    pub fn with_terminal(mut self, terminal_id: impl Into<String>) -> Self {
        self.terminal_id = Some(terminal_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Sales
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Mobile,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Mobile => "mobile",
        }
    }
}

/// One line of a completed sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleLineItem {
    pub product_id: String,
    #[serde(default)]
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub cost_price: f64,
    pub line_total: f64,
}

impl SaleLineItem {
    pub fn new(
        product_id: impl Into<String>,
        product_name: impl Into<String>,
        quantity: u32,
        unit_price: f64,
        cost_price: f64,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            product_name: product_name.into(),
            quantity,
            unit_price,
            cost_price,
            line_total: round_cents(unit_price * f64::from(quantity)),
        }
    }

    pub fn profit(&self) -> f64 {
        (self.unit_price - self.cost_price) * f64::from(self.quantity)
    }
}

/// What the checkout screen hands over when a sale completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleDraft {
    pub items: Vec<SaleLineItem>,
    #[serde(default)]
    pub discount: f64,
    #[serde(default)]
    pub tax: f64,
    pub payment_method: PaymentMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A completed sale waiting for remote confirmation.
///
/// Immutable once queued. `id` is generated on the client and doubles as the
/// idempotency key for the remote write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSale {
    pub id: String,
    pub items: Vec<SaleLineItem>,
    pub subtotal: f64,
    pub total: f64,
    pub discount: f64,
    pub tax: f64,
    pub payment_method: PaymentMethod,
    pub cashier_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PendingSale {
    /// Build a sale from a checkout draft, stamping a fresh id, the session's
    /// cashier and the client clock.
    pub fn from_draft(draft: SaleDraft, session: &Session) -> Result<Self, StorageError> {
        let subtotal = round_cents(draft.items.iter().map(|item| item.line_total).sum());
        let total = round_cents(subtotal - draft.discount + draft.tax);
        let sale = Self {
            id: Uuid::new_v4().to_string(),
            items: draft.items,
            subtotal,
            total,
            discount: draft.discount,
            tax: draft.tax,
            payment_method: draft.payment_method,
            cashier_id: session.cashier_id.clone(),
            notes: draft
                .notes
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            created_at: Utc::now(),
        };
        sale.validate()?;
        Ok(sale)
    }

    /// Reject records that could never be accepted or would corrupt the queue.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.id.trim().is_empty() {
            return Err(StorageError::InvalidSale("sale id is empty".into()));
        }
        if self.cashier_id.trim().is_empty() {
            return Err(StorageError::InvalidSale("cashier id is empty".into()));
        }
        if self.items.is_empty() {
            return Err(StorageError::InvalidSale("sale has no items".into()));
        }
        for item in &self.items {
            if item.product_id.trim().is_empty() {
                return Err(StorageError::InvalidSale("line item without product id".into()));
            }
            if item.quantity == 0 {
                return Err(StorageError::InvalidSale(format!(
                    "line item {} has zero quantity",
                    item.product_id
                )));
            }
            if !item.unit_price.is_finite() || !item.cost_price.is_finite() {
                return Err(StorageError::InvalidSale(format!(
                    "line item {} has a non-finite price",
                    item.product_id
                )));
            }
        }
        let amounts = [self.subtotal, self.total, self.discount, self.tax];
        if amounts.iter().any(|v| !v.is_finite()) {
            return Err(StorageError::InvalidSale("non-finite amount".into()));
        }
        if self.discount < 0.0 || self.tax < 0.0 {
            return Err(StorageError::InvalidSale(
                "discount and tax must not be negative".into(),
            ));
        }
        Ok(())
    }

    pub fn item_count(&self) -> u32 {
        self.items.iter().map(|item| item.quantity).sum()
    }

    /// Gross margin of the sale after discount.
    pub fn profit(&self) -> f64 {
        round_cents(self.items.iter().map(SaleLineItem::profit).sum::<f64>() - self.discount)
    }
}

/// A sale the backend refused permanently, kept for user notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedSale {
    pub sale: PendingSale,
    pub reason: String,
    pub rejected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Catalog cache
// ---------------------------------------------------------------------------

/// Snapshot of the catalog fields needed to ring up a sale offline.
///
/// Advisory only: stock here is never used for an authoritative decrement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedProduct {
    pub id: String,
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub stock: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_price: Option<f64>,
}

pub(crate) fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> SaleDraft {
        SaleDraft {
            items: vec![
                SaleLineItem::new("p-1", "Espresso Beans 1kg", 2, 19.99, 12.5),
                SaleLineItem::new("p-2", "Paper Filters", 1, 4.99, 2.0),
            ],
            discount: 0.0,
            tax: 8.0,
            payment_method: PaymentMethod::Card,
            notes: Some("  ".into()),
        }
    }

    #[test]
    fn test_from_draft_computes_totals_and_stamps_session() {
        let session = Session::new("cashier-7");
        let sale = PendingSale::from_draft(draft(), &session).expect("valid draft");

        assert_eq!(sale.subtotal, 44.97);
        assert_eq!(sale.total, 52.97);
        assert_eq!(sale.cashier_id, "cashier-7");
        assert_eq!(sale.item_count(), 3);
        assert!(sale.notes.is_none());
        assert!(Uuid::parse_str(&sale.id).is_ok());
    }

    #[test]
    fn test_from_draft_generates_distinct_ids() {
        let session = Session::new("cashier-7");
        let a = PendingSale::from_draft(draft(), &session).unwrap();
        let b = PendingSale::from_draft(draft(), &session).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_validate_rejects_empty_and_zero_quantity() {
        let session = Session::new("cashier-7");
        let mut empty = draft();
        empty.items.clear();
        assert!(PendingSale::from_draft(empty, &session).is_err());

        let mut zero = draft();
        zero.items[0].quantity = 0;
        assert!(PendingSale::from_draft(zero, &session).is_err());

        assert!(PendingSale::from_draft(draft(), &Session::new(" ")).is_err());
    }

    #[test]
    fn test_profit_subtracts_discount() {
        let session = Session::new("cashier-7");
        let mut d = draft();
        d.discount = 1.0;
        let sale = PendingSale::from_draft(d, &session).unwrap();
        // (19.99 - 12.5) * 2 + (4.99 - 2.0) - 1.0
        assert_eq!(sale.profit(), 16.97);
    }

    #[test]
    fn test_payment_method_serializes_snake_case() {
        let json = serde_json::to_string(&PaymentMethod::Mobile).unwrap();
        assert_eq!(json, "\"mobile\"");
    }
}
