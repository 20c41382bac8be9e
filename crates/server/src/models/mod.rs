//! Domain entities for the automation service.
//!
//! These are the in-memory forms of the database rows described in the
//! migrations. Conversion from raw rows lives in the `db` modules.

pub mod cart;
pub mod newsletter;
pub mod order;
pub mod template;

pub use cart::{AbandonedCart, CartItem};
pub use newsletter::{
    CreateNewsletter, Newsletter, NewsletterSend, NewsletterStats, Recipient, TargetAudience,
    UpdateNewsletter,
};
pub use order::{DelayInfo, Order, OrderStatus};
pub use template::{EmailTemplate, EmailType};
