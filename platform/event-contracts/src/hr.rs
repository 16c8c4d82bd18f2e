//! HR events produced by `hr-svc`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::payload::EventKind;
use crate::validation::{
    require_email, require_non_blank, require_optional_non_blank, require_positive,
    ValidationError,
};

const HR_SOURCE: &str = "hr-svc";

fn default_active() -> bool {
    true
}

/// A new employee was hired.
///
/// `manager_id` is absent for top-level roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmployeeCreated {
    pub employee_id: String,
    pub full_name: String,
    pub email: String,
    pub department: String,
    pub position: String,
    pub salary: Decimal,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_id: Option<String>,
}

impl EmployeeCreated {
    pub fn new(
        employee_id: impl Into<String>,
        full_name: impl Into<String>,
        email: impl Into<String>,
        department: impl Into<String>,
        position: impl Into<String>,
        salary: Decimal,
        manager_id: Option<String>,
    ) -> Self {
        Self {
            employee_id: employee_id.into(),
            full_name: full_name.into(),
            email: email.into(),
            department: department.into(),
            position: position.into(),
            salary,
            is_active: true,
            manager_id,
        }
    }
}

impl EventKind for EmployeeCreated {
    const EVENT_TYPE: &'static str = "hr.employee.created";
    const SOURCE: &'static str = HR_SOURCE;

    fn validate(&self) -> Result<(), ValidationError> {
        require_non_blank("employeeId", &self.employee_id)?;
        require_non_blank("fullName", &self.full_name)?;
        require_email("email", &self.email)?;
        require_non_blank("department", &self.department)?;
        require_non_blank("position", &self.position)?;
        require_positive("salary", self.salary)?;
        require_optional_non_blank("managerId", self.manager_id.as_deref())
    }

    fn entity_id(&self) -> &str {
        &self.employee_id
    }
}

/// Current state of an employee after a change, plus what changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmployeeUpdated {
    pub employee_id: String,
    pub full_name: String,
    pub email: String,
    pub department: String,
    pub position: String,
    pub salary: Decimal,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_id: Option<String>,
    /// Fields touched by the update, with their new values.
    #[serde(default)]
    pub changed_fields: Map<String, Value>,
    /// Prior values of the changed fields, for audit consumers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_values: Option<Map<String, Value>>,
}

impl EmployeeUpdated {
    pub fn new(
        employee_id: impl Into<String>,
        full_name: impl Into<String>,
        email: impl Into<String>,
        department: impl Into<String>,
        position: impl Into<String>,
        salary: Decimal,
        is_active: bool,
        manager_id: Option<String>,
        changed_fields: Map<String, Value>,
    ) -> Self {
        Self {
            employee_id: employee_id.into(),
            full_name: full_name.into(),
            email: email.into(),
            department: department.into(),
            position: position.into(),
            salary,
            is_active,
            manager_id,
            changed_fields,
            previous_values: None,
        }
    }

    pub fn with_previous_values(mut self, previous_values: Map<String, Value>) -> Self {
        self.previous_values = Some(previous_values);
        self
    }
}

impl EventKind for EmployeeUpdated {
    const EVENT_TYPE: &'static str = "hr.employee.updated";
    const SOURCE: &'static str = HR_SOURCE;

    fn validate(&self) -> Result<(), ValidationError> {
        require_non_blank("employeeId", &self.employee_id)?;
        require_non_blank("fullName", &self.full_name)?;
        require_email("email", &self.email)?;
        require_non_blank("department", &self.department)?;
        require_non_blank("position", &self.position)?;
        require_positive("salary", self.salary)?;
        require_optional_non_blank("managerId", self.manager_id.as_deref())
    }

    fn entity_id(&self) -> &str {
        &self.employee_id
    }
}
