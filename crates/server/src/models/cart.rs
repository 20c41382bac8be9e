//! Cart session entities used by the abandonment scans.

use chrono::{DateTime, Utc};
use tavola_core::{Email, Price, SessionId};

/// One line item in a cart.
#[derive(Debug, Clone)]
pub struct CartItem {
    /// Display name of the dish at the time it was added.
    pub dish_name: String,
    /// Quantity ordered.
    pub quantity: i32,
    /// Unit price at the time it was added.
    pub unit_price: Price,
}

impl CartItem {
    /// Line total (unit price times quantity).
    #[must_use]
    pub fn line_total(&self) -> Price {
        self.unit_price * self.quantity
    }
}

/// A cart session that matched an abandonment scan.
///
/// Only carts with a known customer email are ever selected; anonymous
/// sessions cannot be emailed and are left alone until cleanup.
#[derive(Debug, Clone)]
pub struct AbandonedCart {
    /// Storefront session identifier.
    pub session_id: SessionId,
    /// Customer email captured during checkout.
    pub customer_email: Email,
    /// Customer name, if the checkout form got that far.
    pub customer_name: Option<String>,
    /// Last time the storefront touched this cart.
    pub updated_at: DateTime<Utc>,
    /// Items in the cart, in insertion order.
    pub items: Vec<CartItem>,
}

impl AbandonedCart {
    /// Sum of all line totals.
    #[must_use]
    pub fn total(&self) -> Price {
        self.items.iter().map(CartItem::line_total).sum()
    }

    /// Name to address the customer by in email copy.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.customer_name.as_deref().unwrap_or("there")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cart(items: Vec<CartItem>) -> AbandonedCart {
        AbandonedCart {
            session_id: SessionId::generate(),
            customer_email: Email::parse("guest@example.com").expect("valid"),
            customer_name: None,
            updated_at: Utc::now(),
            items,
        }
    }

    #[test]
    fn test_cart_total() {
        let cart = cart(vec![
            CartItem {
                dish_name: "Margherita".into(),
                quantity: 2,
                unit_price: Price::from_cents(1250),
            },
            CartItem {
                dish_name: "Tiramisu".into(),
                quantity: 1,
                unit_price: Price::from_cents(650),
            },
        ]);
        assert_eq!(cart.total().format_fixed(), "31.50");
    }

    #[test]
    fn test_display_name_fallback() {
        let mut c = cart(vec![]);
        assert_eq!(c.display_name(), "there");
        c.customer_name = Some("Ada".into());
        assert_eq!(c.display_name(), "Ada");
    }
}
