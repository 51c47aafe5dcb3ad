//! Workflow data model
//!
//! Typed entities shared by the store, the orchestrator and the REST layer.
//! Wire shapes are camelCase JSON. Free-form blobs (contract rosters, record
//! sections) stay `serde_json::Value`; route-sheet steps are typed because
//! reconciliation branches on their specialty and status.

use std::fmt;
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, WorkflowError};

/// Current instant as RFC 3339 UTC with millisecond precision
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current date as `YYYY-MM-DD`
pub fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// Strip everything but ASCII digits from a phone number
pub fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

// ============================================================================
// Identities
// ============================================================================

/// Role of a realtime/REST identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Clinic,
    Organization,
    Doctor,
    Employee,
    #[serde(alias = "registration-staff", alias = "registration_staff")]
    Registration,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Clinic => "clinic",
            Role::Organization => "organization",
            Role::Doctor => "doctor",
            Role::Employee => "employee",
            Role::Registration => "registration",
        }
    }

    /// Clinics and organizations are keyed by BIN
    pub fn has_bin(&self) -> bool {
        matches!(self, Role::Clinic | Role::Organization)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "clinic" => Ok(Role::Clinic),
            "organization" => Ok(Role::Organization),
            "doctor" => Ok(Role::Doctor),
            "employee" => Ok(Role::Employee),
            "registration" | "registration-staff" | "registration_staff" => Ok(Role::Registration),
            other => Err(WorkflowError::validation(format!("unknown role: {}", other))),
        }
    }
}

/// A user of the system: clinic, organization, doctor, employee or registrar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(rename = "uid", default)]
    pub id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_name: Option<String>,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doctor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clinic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clinic_bin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<String>,
}

impl Identity {
    /// Bare identity with only the required fields set
    pub fn new(id: impl Into<String>, role: Role, phone: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            bin: None,
            company_name: None,
            leader_name: None,
            phone: phone.into(),
            created_at: String::new(),
            doctor_id: None,
            clinic_id: None,
            specialty: None,
            clinic_bin: None,
            employee_id: None,
            contract_id: None,
        }
    }

    /// BIN that must be unique for this identity, if any
    pub fn unique_bin(&self) -> Option<&str> {
        match self.bin.as_deref() {
            Some(bin) if !bin.is_empty() && self.role.has_bin() => Some(bin),
            _ => None,
        }
    }
}

/// Point-lookup key for identities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKey {
    Phone,
    Bin,
    Id,
}

// ============================================================================
// Contracts
// ============================================================================

/// Well-known contract statuses (the set is open)
pub mod contract_status {
    pub const REQUEST: &str = "request";
    pub const SIGNED: &str = "signed";
    pub const ACTIVE: &str = "active";
    pub const REJECTED: &str = "rejected";
}

/// Examination schedule embedded in a contract
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarPlan {
    #[serde(default)]
    pub start_date: String,
    #[serde(default)]
    pub end_date: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
}

/// Agreement between an organization (client) and a clinic
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Contract {
    pub id: i64,
    pub number: String,
    pub client_name: String,
    pub client_bin: String,
    pub client_signed: bool,
    pub clinic_name: String,
    pub clinic_bin: String,
    pub clinic_signed: bool,
    pub date: String,
    pub status: String,
    pub price: f64,
    pub planned_headcount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employees: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calendar_plan: Option<CalendarPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_sign_otp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clinic_sign_otp: Option<String>,
}

impl Contract {
    pub fn validate_new(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("clientBin", &self.client_bin),
            ("clinicBin", &self.clinic_bin),
            ("clientName", &self.client_name),
            ("clinicName", &self.clinic_name),
        ]
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(WorkflowError::validation(format!(
                "{} required",
                missing.join(", ")
            )))
        }
    }

    /// Whether the number must be generated on insert
    pub fn needs_number(&self) -> bool {
        self.number.trim().is_empty() || self.number == "DRAFT"
    }
}

/// Merge-patch over the known contract fields.
///
/// Outer `None` means "absent from the patch". For nullable columns the inner
/// `None` clears the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContractPatch {
    pub status: Option<String>,
    pub number: Option<String>,
    pub employees: Option<Value>,
    pub documents: Option<Value>,
    pub calendar_plan: Option<Option<CalendarPlan>>,
    pub client_signed: Option<bool>,
    pub clinic_signed: Option<bool>,
    pub client_sign_otp: Option<Option<String>>,
    pub clinic_sign_otp: Option<Option<String>>,
    pub price: Option<f64>,
    pub planned_headcount: Option<i64>,
}

impl ContractPatch {
    /// Extract the known fields from a raw patch object. Unknown keys are ignored.
    pub fn from_json(patch: &Map<String, Value>) -> Result<Self> {
        let calendar_plan = match patch.get("calendarPlan") {
            None => None,
            Some(Value::Null) => Some(None),
            Some(value) => Some(Some(serde_json::from_value(value.clone()).map_err(|e| {
                WorkflowError::validation(format!("calendarPlan: {}", e))
            })?)),
        };

        Ok(Self {
            status: required_string(patch, "status")?,
            number: required_string(patch, "number")?,
            employees: patch.get("employees").cloned(),
            documents: patch.get("documents").cloned(),
            calendar_plan,
            client_signed: bool_field(patch, "clientSigned")?,
            clinic_signed: bool_field(patch, "clinicSigned")?,
            client_sign_otp: nullable_string(patch, "clientSignOtp")?,
            clinic_sign_otp: nullable_string(patch, "clinicSignOtp")?,
            price: match patch.get("price") {
                None => None,
                Some(v) => Some(v.as_f64().ok_or_else(|| type_error("price", "a number"))?),
            },
            planned_headcount: match patch.get("plannedHeadcount") {
                None => None,
                Some(v) => Some(
                    v.as_i64()
                        .ok_or_else(|| type_error("plannedHeadcount", "an integer"))?,
                ),
            },
        })
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn type_error(field: &str, expected: &str) -> WorkflowError {
    WorkflowError::validation(format!("{} must be {}", field, expected))
}

fn required_string(map: &Map<String, Value>, key: &str) -> Result<Option<String>> {
    match map.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(type_error(key, "a string")),
    }
}

fn nullable_string(map: &Map<String, Value>, key: &str) -> Result<Option<Option<String>>> {
    match map.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(Value::String(s)) => Ok(Some(Some(s.clone()))),
        Some(_) => Err(type_error(key, "a string or null")),
    }
}

fn bool_field(map: &Map<String, Value>, key: &str) -> Result<Option<bool>> {
    match map.get(key) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(type_error(key, "a boolean")),
    }
}

// ============================================================================
// Doctors
// ============================================================================

/// Specialty labels that mean "registrar" rather than a medical specialist
const REGISTRAR_LABELS: &[&str] = &["регистратор", "регистратура", "registrar", "registration"];

/// A clinic's doctor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Doctor {
    pub id: i64,
    pub clinic_uid: String,
    pub name: String,
    pub specialty: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub phone: String,
    pub is_chairman: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_number: Option<String>,
}

impl Doctor {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.specialty.trim().is_empty() {
            return Err(WorkflowError::validation("name and specialty are required"));
        }
        Ok(())
    }

    /// Role of the identity provisioned for this doctor's phone
    pub fn provisioned_role(&self) -> Role {
        let label = self.specialty.trim().to_lowercase();
        if REGISTRAR_LABELS.contains(&label.as_str()) {
            Role::Registration
        } else {
            Role::Doctor
        }
    }
}

/// Per-doctor, per-contract roster of employees to examine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorRouteSheet {
    pub id: i64,
    pub doctor_id: i64,
    pub contract_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specialty: Option<String>,
    pub virtual_doctor: bool,
    pub employees: Value,
    pub created_at: String,
}

/// Body of a doctor route-sheet upsert
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteSheetInput {
    pub specialty: Option<String>,
    pub virtual_doctor: bool,
    pub employees: Vec<Value>,
}

// ============================================================================
// Visits and route sheets
// ============================================================================

/// Visit lifecycle. Advances monotonically; `cancelled` is a terminal override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitStatus {
    Registered,
    InProgress,
    Completed,
    Cancelled,
}

impl VisitStatus {
    pub const OPEN: [VisitStatus; 2] = [VisitStatus::Registered, VisitStatus::InProgress];

    pub fn as_str(&self) -> &'static str {
        match self {
            VisitStatus::Registered => "registered",
            VisitStatus::InProgress => "in_progress",
            VisitStatus::Completed => "completed",
            VisitStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_open(&self) -> bool {
        Self::OPEN.contains(self)
    }

    /// Legal transitions; staying in the same status is always allowed
    pub fn can_transition_to(&self, next: VisitStatus) -> bool {
        use VisitStatus::*;
        *self == next
            || matches!(
                (self, next),
                (Registered, InProgress)
                    | (Registered, Cancelled)
                    | (InProgress, Completed)
                    | (InProgress, Cancelled)
            )
    }

    /// Statuses from which `self` may be entered (including itself)
    pub fn predecessors(&self) -> Vec<VisitStatus> {
        [
            VisitStatus::Registered,
            VisitStatus::InProgress,
            VisitStatus::Completed,
            VisitStatus::Cancelled,
        ]
        .into_iter()
        .filter(|from| from.can_transition_to(*self))
        .collect()
    }
}

impl fmt::Display for VisitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VisitStatus {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "registered" => Ok(VisitStatus::Registered),
            "in_progress" => Ok(VisitStatus::InProgress),
            "completed" => Ok(VisitStatus::Completed),
            "cancelled" => Ok(VisitStatus::Cancelled),
            other => Err(WorkflowError::validation(format!(
                "unknown visit status: {}",
                other
            ))),
        }
    }
}

/// Per-step completion state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Completed,
}

/// One routing step: a target specialty, optionally a concrete doctor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStep {
    pub specialty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doctor_id: Option<Value>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    /// Client-defined fields carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RouteStep {
    pub fn pending(specialty: impl Into<String>) -> Self {
        Self {
            specialty: specialty.into(),
            doctor_id: None,
            status: StepStatus::Pending,
            completed_at: None,
            extra: Map::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

/// Reject route sheets with unlabeled steps
pub fn validate_route_sheet(steps: &[RouteStep]) -> Result<()> {
    match steps.iter().position(|s| s.specialty.trim().is_empty()) {
        Some(idx) => Err(WorkflowError::validation(format!(
            "routeSheet[{}].specialty is required",
            idx
        ))),
        None => Ok(()),
    }
}

/// One employee's check-in at a clinic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visit {
    pub id: i64,
    pub employee_id: String,
    pub employee_name: Option<String>,
    pub client_name: Option<String>,
    pub contract_id: Option<i64>,
    pub clinic_id: String,
    pub visit_date: String,
    pub status: VisitStatus,
    pub route_sheet: Vec<RouteStep>,
    pub documents_issued: Value,
    pub check_in_time: Option<String>,
    pub check_out_time: Option<String>,
    pub registered_by: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Body of a visit registration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewVisit {
    pub employee_id: String,
    pub employee_name: Option<String>,
    pub client_name: Option<String>,
    pub contract_id: Option<i64>,
    pub clinic_id: String,
    pub phone: Option<String>,
    pub route_sheet: Vec<RouteStep>,
    pub status: Option<VisitStatus>,
    pub visit_date: Option<String>,
    pub registered_by: Option<String>,
    pub notes: Option<String>,
}

impl NewVisit {
    pub fn validate(&self) -> Result<()> {
        if self.employee_id.trim().is_empty() || self.clinic_id.trim().is_empty() {
            return Err(WorkflowError::validation("employeeId and clinicId are required"));
        }
        if let Some(status) = self.status {
            if status != VisitStatus::Registered && status != VisitStatus::InProgress {
                return Err(WorkflowError::validation(format!(
                    "a new visit cannot start as {}",
                    status
                )));
            }
        }
        validate_route_sheet(&self.route_sheet)
    }

    /// Contract reference with `0` meaning "self-pay"
    pub fn contract_ref(&self) -> Option<i64> {
        self.contract_id.filter(|id| *id > 0)
    }
}

/// Body of a visit PATCH
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VisitPatch {
    pub status: Option<VisitStatus>,
    pub route_sheet: Option<Vec<RouteStep>>,
    pub notes: Option<String>,
    pub documents_issued: Option<Value>,
}

// ============================================================================
// Ambulatory records
// ============================================================================

/// A patient's persistent medical card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmbulatoryRecord {
    pub id: i64,
    pub patient_uid: String,
    pub iin: String,
    pub general: Value,
    pub medical: Value,
    pub specialist_entries: Value,
    pub lab_results: Value,
    pub final_conclusion: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub communication: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_instruction: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Body of an ambulatory-record upsert. Absent (or null) sections keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordUpsert {
    pub patient_uid: String,
    pub iin: String,
    pub general: Option<Value>,
    pub medical: Option<Value>,
    pub specialist_entries: Option<Value>,
    pub lab_results: Option<Value>,
    pub final_conclusion: Option<Value>,
    pub communication: Option<Value>,
    pub patient_instruction: Option<String>,
}

impl RecordUpsert {
    /// Key the record is stored under: the patient uid, else the national ID
    pub fn patient_key(&self) -> Result<&str> {
        let uid = self.patient_uid.trim();
        let iin = self.iin.trim();
        if !uid.is_empty() {
            Ok(uid)
        } else if !iin.is_empty() {
            Ok(iin)
        } else {
            Err(WorkflowError::validation("patientUid or iin is required"))
        }
    }

    /// Specialty names present in the specialist-entry section
    pub fn specialist_keys(&self) -> Vec<String> {
        match &self.specialist_entries {
            Some(Value::Object(entries)) => entries.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }
}
