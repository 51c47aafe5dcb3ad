//! Entity builders and the in-process test environment

use std::sync::Arc;

use medflow_server::realtime::Registration;
use medflow_server::schema::{Contract, Identity, NewVisit, RecordUpsert, Role, RouteStep};
use medflow_server::{Hub, Notification, Orchestrator, StoreTimeouts, WorkflowStore};
use serde_json::{Map, Value};

pub const CLINIC_UID: &str = "clinic-1";
pub const CLINIC_BIN: &str = "456";
pub const CLINIC_PHONE: &str = "+7 (701) 000-00-01";

pub const ORG_UID: &str = "org-1";
pub const ORG_BIN: &str = "123";
pub const ORG_PHONE: &str = "+7 (701) 000-00-02";

/// Store, hub and orchestrator sharing one in-memory database
pub struct TestEnv {
    pub store: WorkflowStore,
    pub hub: Arc<Hub>,
    pub orchestrator: Orchestrator,
}

impl TestEnv {
    pub fn new() -> Self {
        let store = WorkflowStore::open_in_memory(StoreTimeouts::default())
            .expect("in-memory store should open");
        let hub = Arc::new(Hub::new(64));
        let orchestrator = Orchestrator::new(store.clone(), Arc::clone(&hub));
        Self {
            store,
            hub,
            orchestrator,
        }
    }

    /// Environment with the clinic and the organization identities already stored
    pub async fn with_parties() -> Self {
        let env = Self::new();
        env.orchestrator
            .upsert_identity(clinic_identity())
            .await
            .expect("clinic identity");
        env.orchestrator
            .upsert_identity(org_identity())
            .await
            .expect("organization identity");
        env
    }

    pub fn connect(&self, identity: &str, role: Role) -> Registration {
        self.hub.register(identity, role)
    }
}

pub fn clinic_identity() -> Identity {
    let mut identity = Identity::new(CLINIC_UID, Role::Clinic, CLINIC_PHONE);
    identity.bin = Some(CLINIC_BIN.to_string());
    identity.company_name = Some("Медицинский центр Сункар".to_string());
    identity
}

pub fn org_identity() -> Identity {
    let mut identity = Identity::new(ORG_UID, Role::Organization, ORG_PHONE);
    identity.bin = Some(ORG_BIN.to_string());
    identity.company_name = Some("ТОО Курылыс".to_string());
    identity
}

/// Contract between the fixture organization and clinic, with no number
pub fn contract_request() -> Contract {
    Contract {
        client_name: "ТОО Курылыс".to_string(),
        client_bin: ORG_BIN.to_string(),
        clinic_name: "Медицинский центр Сункар".to_string(),
        clinic_bin: CLINIC_BIN.to_string(),
        price: 125000.0,
        planned_headcount: 40,
        ..Default::default()
    }
}

pub fn new_visit(employee_id: &str, specialties: &[&str]) -> NewVisit {
    NewVisit {
        employee_id: employee_id.to_string(),
        employee_name: Some("Ержан Абенов".to_string()),
        clinic_id: CLINIC_UID.to_string(),
        route_sheet: specialties.iter().map(|s| RouteStep::pending(*s)).collect(),
        ..Default::default()
    }
}

/// Record upsert carrying one specialist entry per label
pub fn specialist_entries(patient_uid: &str, labels: &[&str]) -> RecordUpsert {
    let mut entries = Map::new();
    for label in labels {
        entries.insert(
            label.to_string(),
            serde_json::json!({ "conclusion": "здоров", "doctorName": "Айгуль" }),
        );
    }
    RecordUpsert {
        patient_uid: patient_uid.to_string(),
        specialist_entries: Some(Value::Object(entries)),
        ..Default::default()
    }
}

/// Everything queued for a registration so far
pub fn drain(registration: &mut Registration) -> Vec<Arc<Notification>> {
    let mut out = Vec::new();
    while let Ok(message) = registration.rx.try_recv() {
        out.push(message);
    }
    out
}

/// Event types of everything queued for a registration so far
pub fn drain_kinds(registration: &mut Registration) -> Vec<String> {
    drain(registration)
        .iter()
        .map(|message| message.kind.clone())
        .collect()
}
