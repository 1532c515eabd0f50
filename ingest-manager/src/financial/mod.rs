//! Financial aggregation provider integration (Plaid).
//!
//! The link flow differs from classic OAuth: the frontend drives a provider
//! widget with a short-lived link token, hands back a public token, and the
//! backend exchanges that for a long-lived access token tied to one "item"
//! (a linked institution login). Access tokens do not expire on a clock and
//! cannot be refreshed server-side; when the provider invalidates one, the
//! end user must re-link.

mod client;
mod types;

pub use client::{FinancialAccess, PlaidClient};
pub use types::{Account, AccountBalance, FinancialSnapshot, ScheduledPayment, Transaction};
