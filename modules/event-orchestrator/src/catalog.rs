//! Platform topic catalog
//!
//! Every topic the platform's services publish to, with retention chosen by
//! the class of data it carries. Deployments can replace the catalog with a
//! JSON file (see `TOPIC_CATALOG_PATH`).

use std::fs;
use std::path::Path;

use event_bus::{
    ProvisioningError, RetentionClass, TopicCatalog, TopicDescriptor, DEAD_LETTER_TOPIC,
};

pub const HR_EMPLOYEE_CREATED: &str = "hr.employee.created";
pub const HR_EMPLOYEE_UPDATED: &str = "hr.employee.updated";
pub const HR_EMPLOYEE_DELETED: &str = "hr.employee.deleted";
pub const HR_DEPARTMENT_EVENTS: &str = "hr.department.events";
pub const BILLING_INVOICE_CREATED: &str = "billing.invoice.created";
pub const BILLING_INVOICE_PAID: &str = "billing.invoice.paid";
pub const BILLING_INVOICE_CANCELLED: &str = "billing.invoice.cancelled";
pub const IDENTITY_USER_CREATED: &str = "identity.user.created";

/// The built-in catalog
pub fn platform_catalog() -> TopicCatalog {
    use RetentionClass::*;

    TopicCatalog::new(vec![
        TopicDescriptor::with_retention_class(HR_EMPLOYEE_CREATED, 3, Operational),
        TopicDescriptor::with_retention_class(HR_EMPLOYEE_UPDATED, 3, Operational),
        // Deletions are kept longer for audit
        TopicDescriptor::with_retention_class(HR_EMPLOYEE_DELETED, 3, Audit),
        TopicDescriptor::with_retention_class(HR_DEPARTMENT_EVENTS, 2, Operational),
        TopicDescriptor::with_retention_class(BILLING_INVOICE_CREATED, 3, Legal),
        TopicDescriptor::with_retention_class(BILLING_INVOICE_PAID, 3, Legal),
        TopicDescriptor::with_retention_class(BILLING_INVOICE_CANCELLED, 3, Legal),
        TopicDescriptor::with_retention_class(IDENTITY_USER_CREATED, 2, Audit),
        TopicDescriptor::with_retention_class(DEAD_LETTER_TOPIC, 1, DeadLetter),
    ])
}

/// Catalog from `path` if given, otherwise the built-in one
pub fn load_catalog(path: Option<&Path>) -> Result<TopicCatalog, ProvisioningError> {
    let Some(path) = path else {
        return Ok(platform_catalog());
    };

    let raw = fs::read_to_string(path)
        .map_err(|e| ProvisioningError::Catalog(format!("{}: {}", path.display(), e)))?;
    TopicCatalog::from_json(&raw)
}
