//! Core domain model for overdue invoice follow-up.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "dunning-core";

pub const UNKNOWN_CLIENT: &str = "Unknown";
pub const DEFAULT_CURRENCY_SYMBOL: &str = "$";
pub const UNKNOWN_COMPANY: &str = "Unknown Company";

/// Invoice-number prefixes used to recover the issuing company when the ERP
/// row carries no company reference.
const COMPANY_PREFIXES: [(&str, &str); 3] = [
    ("PLFZ/", "Prezlab FZ LLC"),
    ("PLAD/", "Prezlab Advanced Design Company"),
    ("PLDD/", "Prezlab Digital Design"),
];

/// Denormalized overdue invoice assembled from one `account.move` row plus its
/// resolved partner, currency and company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub id: i64,
    pub invoice_number: String,
    pub client_name: String,
    pub client_email: String,
    pub amount_total: f64,
    pub amount_due: f64,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: NaiveDate,
    /// Negative when the due date lies in the future.
    pub days_overdue: i64,
    pub payment_state: String,
    pub currency_symbol: String,
    pub company_name: String,
    pub origin: String,
}

impl InvoiceRecord {
    pub fn has_email(&self) -> bool {
        !self.client_email.trim().is_empty()
    }
}

/// Result of one overdue-invoice fetch.
///
/// `NoneOverdue` means the ERP answered and nothing is due; `Failed` means the
/// fetch itself did not complete and the caller should not read it as zero.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Invoices(Vec<InvoiceRecord>),
    NoneOverdue,
    Failed { reason: String },
}

impl FetchOutcome {
    pub fn from_records(records: Vec<InvoiceRecord>) -> Self {
        if records.is_empty() {
            Self::NoneOverdue
        } else {
            Self::Invoices(records)
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn records(&self) -> &[InvoiceRecord] {
        match self {
            Self::Invoices(records) => records,
            Self::NoneOverdue | Self::Failed { .. } => &[],
        }
    }

    pub fn into_records(self) -> Result<Vec<InvoiceRecord>, String> {
        match self {
            Self::Invoices(records) => Ok(records),
            Self::NoneOverdue => Ok(Vec::new()),
            Self::Failed { reason } => Err(reason),
        }
    }
}

pub fn company_from_invoice_number(invoice_number: &str) -> &'static str {
    COMPANY_PREFIXES
        .iter()
        .find(|(prefix, _)| invoice_number.starts_with(prefix))
        .map(|(_, company)| *company)
        .unwrap_or(UNKNOWN_COMPANY)
}

/// Whole days between `due_date` and `today`; not clamped at zero.
pub fn days_overdue(due_date: NaiveDate, today: NaiveDate) -> i64 {
    (today - due_date).num_days()
}

pub fn parse_erp_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

/// Formats an amount with thousands separators and two decimals, e.g.
/// `12,345.60`.
pub fn format_amount(amount: f64) -> String {
    let rounded = format!("{:.2}", amount.abs());
    let (whole, fraction) = rounded.split_once('.').unwrap_or((rounded.as_str(), "00"));
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (index, digit) in whole.chars().enumerate() {
        if index > 0 && (whole.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    let sign = if amount < 0.0 && rounded != "0.00" { "-" } else { "" };
    format!("{sign}{grouped}.{fraction}")
}
