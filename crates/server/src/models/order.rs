//! Order entities consumed by the manual trigger API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tavola_core::{Email, OrderId, Price};

/// Lifecycle status of an order.
///
/// The ordering backend owns transitions; the automation service only
/// reads the status for email copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Preparing,
    Ready,
    OutForDelivery,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    /// Database/wire form of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Preparing => "preparing",
            Self::Ready => "ready",
            Self::OutForDelivery => "out_for_delivery",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "preparing" => Ok(Self::Preparing),
            "ready" => Ok(Self::Ready),
            "out_for_delivery" => Ok(Self::OutForDelivery),
            "delivered" => Ok(Self::Delivered),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// A finalized purchase.
#[derive(Debug, Clone)]
pub struct Order {
    /// Unique identifier.
    pub id: OrderId,
    /// Customer email for notifications.
    pub customer_email: Email,
    /// Customer name for email copy.
    pub customer_name: String,
    /// Current lifecycle status.
    pub status: OrderStatus,
    /// Order total including delivery.
    pub total: Price,
    /// Delivery address, `None` for pickup orders.
    pub delivery_address: Option<String>,
    /// When the order was placed.
    pub created_at: DateTime<Utc>,
}

/// Details passed along with a delivery-delay notification.
#[derive(Debug, Clone, Deserialize)]
pub struct DelayInfo {
    /// Human-readable reason shown to the customer.
    pub reason: String,
    /// New estimated delivery time, as copy (e.g. "about 20 more minutes").
    pub new_estimate: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Preparing,
            OrderStatus::Ready,
            OrderStatus::OutForDelivery,
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>(), Ok(status));
        }
    }

    #[test]
    fn test_status_unknown() {
        assert!("shipped".parse::<OrderStatus>().is_err());
    }
}
