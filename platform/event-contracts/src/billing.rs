//! Billing events produced by `billing-svc`.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::payload::EventKind;
use crate::validation::{require_non_blank, require_positive, ValidationError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    #[default]
    Pending,
    Paid,
    Cancelled,
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvoiceStatus::Pending => "PENDING",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// An invoice was issued against a client engagement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceCreated {
    pub invoice_id: String,
    pub employee_id: String,
    pub client_name: String,
    pub amount: Decimal,
    pub due_date: NaiveDate,
    #[serde(default)]
    pub status: InvoiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl InvoiceCreated {
    /// New invoices always start out `PENDING`.
    pub fn new(
        invoice_id: impl Into<String>,
        employee_id: impl Into<String>,
        client_name: impl Into<String>,
        amount: Decimal,
        due_date: NaiveDate,
        description: Option<String>,
    ) -> Self {
        Self {
            invoice_id: invoice_id.into(),
            employee_id: employee_id.into(),
            client_name: client_name.into(),
            amount,
            due_date,
            status: InvoiceStatus::Pending,
            description,
        }
    }
}

impl EventKind for InvoiceCreated {
    const EVENT_TYPE: &'static str = "billing.invoice.created";
    const SOURCE: &'static str = "billing-svc";

    fn validate(&self) -> Result<(), ValidationError> {
        require_non_blank("invoiceId", &self.invoice_id)?;
        require_non_blank("employeeId", &self.employee_id)?;
        require_non_blank("clientName", &self.client_name)?;
        require_positive("amount", self.amount)
    }

    fn entity_id(&self) -> &str {
        &self.invoice_id
    }
}
