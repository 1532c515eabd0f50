//! Wire types for the aggregation API and their normalized forms.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Upstream error envelope, returned with any non-2xx status.
#[derive(Debug, Deserialize)]
pub(crate) struct ProviderError {
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub error_message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LinkTokenResponse {
    pub link_token: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExchangeResponse {
    pub access_token: String,
    pub item_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AccountsResponse {
    #[serde(default)]
    pub accounts: Vec<WireAccount>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireAccount {
    pub account_id: String,
    #[serde(default)]
    pub name: String,
    pub official_name: Option<String>,
    #[serde(rename = "type", default)]
    pub account_type: String,
    pub subtype: Option<String>,
    #[serde(default)]
    pub balances: WireBalances,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WireBalances {
    pub available: Option<f64>,
    pub current: Option<f64>,
    pub iso_currency_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TransactionsResponse {
    #[serde(default)]
    pub transactions: Vec<WireTransaction>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireTransaction {
    pub transaction_id: String,
    pub account_id: String,
    pub amount: f64,
    pub date: NaiveDate,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pending: bool,
    pub category: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RecurringResponse {
    #[serde(default)]
    pub outflow_streams: Vec<WireStream>,
    #[serde(default)]
    pub inflow_streams: Vec<WireStream>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireStream {
    pub stream_id: String,
    pub account_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub average_amount: WireStreamAmount,
    #[serde(default)]
    pub frequency: String,
    pub predicted_next_date: Option<NaiveDate>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WireStreamAmount {
    pub amount: Option<f64>,
}

/// A linked account, normalized.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Account {
    pub account_id: String,
    pub name: String,
    pub official_name: Option<String>,
    pub account_type: String,
    pub subtype: Option<String>,
    pub balance: AccountBalance,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct AccountBalance {
    pub available: Option<f64>,
    pub current: Option<f64>,
    pub currency: Option<String>,
}

/// One settled or pending transaction.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Transaction {
    pub transaction_id: String,
    pub account_id: String,
    /// Positive for money leaving the account, provider convention
    pub amount: f64,
    pub date: NaiveDate,
    pub description: String,
    pub pending: bool,
    pub category: Option<String>,
}

/// A recurring payment stream detected by the provider.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ScheduledPayment {
    pub stream_id: String,
    pub account_id: String,
    pub description: String,
    pub average_amount: f64,
    pub frequency: String,
    pub next_date: Option<NaiveDate>,
    /// Outflow streams are payments, inflow streams deposits
    pub inbound: bool,
}

/// Result of one financial fetch pass for one user.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FinancialSnapshot {
    pub accounts: Vec<Account>,
    pub transactions: Vec<Transaction>,
    pub scheduled_payments: Vec<ScheduledPayment>,
}

impl From<WireAccount> for Account {
    fn from(wire: WireAccount) -> Self {
        Self {
            account_id: wire.account_id,
            name: wire.name,
            official_name: wire.official_name,
            account_type: wire.account_type,
            subtype: wire.subtype,
            balance: AccountBalance {
                available: wire.balances.available,
                current: wire.balances.current,
                currency: wire.balances.iso_currency_code,
            },
        }
    }
}

impl From<WireTransaction> for Transaction {
    fn from(wire: WireTransaction) -> Self {
        // The provider reports a category path; keep the most specific leaf
        let category = wire
            .category
            .and_then(|path| path.into_iter().next_back())
            .filter(|c| !c.is_empty());
        Self {
            transaction_id: wire.transaction_id,
            account_id: wire.account_id,
            amount: wire.amount,
            date: wire.date,
            description: wire.name,
            pending: wire.pending,
            category,
        }
    }
}

impl WireStream {
    pub(crate) fn into_payment(self, inbound: bool) -> ScheduledPayment {
        ScheduledPayment {
            stream_id: self.stream_id,
            account_id: self.account_id,
            description: self.description,
            average_amount: self.average_amount.amount.unwrap_or_default(),
            frequency: self.frequency,
            next_date: self.predicted_next_date,
            inbound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_normalization() {
        let wire: WireAccount = serde_json::from_str(
            r#"{
                "account_id": "acc1",
                "name": "Checking",
                "official_name": "Premier Checking",
                "type": "depository",
                "subtype": "checking",
                "balances": {"available": 100.5, "current": 120.0, "iso_currency_code": "USD"}
            }"#,
        )
        .unwrap();

        let account = Account::from(wire);
        assert_eq!(account.account_type, "depository");
        assert_eq!(account.balance.available, Some(100.5));
        assert_eq!(account.balance.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn test_transaction_keeps_category_leaf() {
        let wire: WireTransaction = serde_json::from_str(
            r#"{
                "transaction_id": "t1",
                "account_id": "acc1",
                "amount": 12.34,
                "date": "2026-08-01",
                "name": "Coffee",
                "pending": false,
                "category": ["Food and Drink", "Coffee Shop"]
            }"#,
        )
        .unwrap();

        let transaction = Transaction::from(wire);
        assert_eq!(transaction.category.as_deref(), Some("Coffee Shop"));
        assert_eq!(transaction.description, "Coffee");
    }

    #[test]
    fn test_sparse_wire_shapes_tolerated() {
        let account: WireAccount =
            serde_json::from_str(r#"{"account_id": "acc1"}"#).unwrap();
        assert!(Account::from(account).balance.current.is_none());

        let transaction: WireTransaction = serde_json::from_str(
            r#"{"transaction_id": "t1", "account_id": "acc1", "amount": 1.0, "date": "2026-08-01"}"#,
        )
        .unwrap();
        assert!(Transaction::from(transaction).category.is_none());
    }

    #[test]
    fn test_stream_into_payment() {
        let wire: WireStream = serde_json::from_str(
            r#"{
                "stream_id": "s1",
                "account_id": "acc1",
                "description": "Rent",
                "average_amount": {"amount": 1500.0},
                "frequency": "MONTHLY",
                "predicted_next_date": "2026-09-01"
            }"#,
        )
        .unwrap();

        let payment = wire.into_payment(false);
        assert_eq!(payment.average_amount, 1500.0);
        assert!(!payment.inbound);
        assert_eq!(
            payment.next_date,
            Some(NaiveDate::from_ymd_opt(2026, 9, 1).unwrap())
        );
    }
}
