//! Workflow orchestrator
//!
//! Every mutating operation follows the same shape:
//!
//! 1. validate the input (fails the operation)
//! 2. perform the durable write (fails the operation)
//! 3. run post-commit hooks: identity sync, route-sheet reconciliation and
//!    notification fan-out (logged and swallowed)
//!
//! Notifications are addressed by identity. Contract events go to the clinic
//! and organization holding the contract's BINs, resolved from the store at
//! send time; a party that cannot be resolved simply receives nothing.

pub mod hooks;
pub mod specialty;

use std::sync::Arc;

use chrono::{Datelike, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::realtime::{events, Hub, Notification};
use crate::schema::{
    contract_status, today, validate_route_sheet, AmbulatoryRecord, Contract, ContractPatch,
    Doctor, DoctorRouteSheet, Identity, IdentityKey, NewVisit, RecordUpsert, Role,
    RouteSheetInput, Visit, VisitPatch,
};
use crate::store::{VisitFilter, WorkflowStore};

use hooks::{HookResult, PostCommit};

/// Fresh contract number: `D-<year>/<1000..=9999>`
pub fn generate_contract_number() -> String {
    let suffix = 1000 + (Uuid::new_v4().as_u128() % 9000) as u32;
    format!("D-{}/{}", Utc::now().year(), suffix)
}

/// Business operations over the store and the hub
#[derive(Clone)]
pub struct Orchestrator {
    store: WorkflowStore,
    hub: Arc<Hub>,
}

impl Orchestrator {
    pub fn new(store: WorkflowStore, hub: Arc<Hub>) -> Self {
        Self { store, hub }
    }

    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    // ========================================================================
    // Identities
    // ========================================================================

    pub async fn upsert_identity(&self, identity: Identity) -> Result<Identity> {
        self.store.upsert_identity(identity).await
    }

    pub async fn find_identity(&self, key: IdentityKey, value: &str) -> Result<Option<Identity>> {
        if value.trim().is_empty() {
            return Err(WorkflowError::validation("value is required"));
        }
        self.store.find_identity(key, value).await
    }

    // ========================================================================
    // Contracts
    // ========================================================================

    pub async fn list_contracts(&self, bin: &str) -> Result<Vec<Contract>> {
        if bin.trim().is_empty() {
            return Err(WorkflowError::validation("bin is required"));
        }
        self.store.list_contracts(bin).await
    }

    pub async fn get_contract(&self, id: i64) -> Result<Contract> {
        self.store.get_contract(id).await
    }

    /// Insert a contract with defaults filled in, then notify both parties
    pub async fn create_contract(&self, mut contract: Contract) -> Result<Contract> {
        contract.validate_new()?;
        if contract.needs_number() {
            contract.number = generate_contract_number();
        }
        if contract.status.trim().is_empty() {
            contract.status = contract_status::REQUEST.to_string();
        }
        if contract.date.trim().is_empty() {
            contract.date = today();
        }
        // Signatures only arrive through a patch
        contract.client_signed = false;
        contract.clinic_signed = false;

        let stored = self.store.insert_contract(contract).await?;

        let data = json!({ "contractId": stored.id, "contract": stored });
        PostCommit::new("create_contract")
            .hook(
                "notify_parties",
                self.notify_contract_parties(&stored, events::CONTRACT_CREATED, data),
            )
            .run()
            .await;
        Ok(stored)
    }

    /// Merge-patch the known fields of a contract. Parties are re-resolved from
    /// the stored BINs and receive the raw patch, not the merged contract.
    pub async fn patch_contract(&self, id: i64, raw: Map<String, Value>) -> Result<Contract> {
        let patch = ContractPatch::from_json(&raw)?;
        let stored = self.store.patch_contract(id, patch).await?;

        let data = json!({ "contractId": id, "updates": Value::Object(raw) });
        PostCommit::new("patch_contract")
            .hook(
                "notify_parties",
                self.notify_contract_parties(&stored, events::CONTRACT_UPDATED, data),
            )
            .run()
            .await;
        Ok(stored)
    }

    pub async fn delete_contract(&self, id: i64) -> Result<Contract> {
        let deleted = self.store.delete_contract(id).await?;

        let data = json!({ "contractId": id });
        PostCommit::new("delete_contract")
            .hook(
                "notify_parties",
                self.notify_contract_parties(&deleted, events::CONTRACT_DELETED, data),
            )
            .run()
            .await;
        Ok(deleted)
    }

    /// Clinic identity by clinic BIN and organization identity by client BIN.
    /// Each lookup is independent; a failed one only shrinks the set.
    async fn contract_parties(&self, contract: &Contract) -> Vec<String> {
        let lookups = [
            (contract.clinic_bin.as_str(), Role::Clinic),
            (contract.client_bin.as_str(), Role::Organization),
        ];

        let mut parties = Vec::new();
        for (bin, role) in lookups {
            if bin.trim().is_empty() {
                continue;
            }
            match self.store.find_identity_by_bin(bin, role).await {
                Ok(Some(identity)) => parties.push(identity.id),
                Ok(None) => tracing::debug!("No {} identity holds BIN {}", role, bin),
                Err(e) => tracing::warn!("Could not resolve {} for BIN {}: {}", role, bin, e),
            }
        }
        parties
    }

    async fn notify_contract_parties(
        &self,
        contract: &Contract,
        kind: &'static str,
        data: Value,
    ) -> Result<String> {
        let parties = self.contract_parties(contract).await;
        let reached = self.hub.send_to_many(&parties, Notification::new(kind, data));
        Ok(format!(
            "{} to {} part(ies), {} connection(s)",
            kind,
            parties.len(),
            reached
        ))
    }

    // ========================================================================
    // Doctors
    // ========================================================================

    pub async fn list_doctors(&self, clinic_uid: &str) -> Result<Vec<Doctor>> {
        self.store.list_doctors(clinic_uid).await
    }

    pub async fn get_doctor(&self, clinic_uid: &str, id: i64) -> Result<Doctor> {
        self.store.get_doctor(clinic_uid, id).await
    }

    pub async fn create_doctor(&self, clinic_uid: &str, mut doctor: Doctor) -> Result<Doctor> {
        doctor.clinic_uid = clinic_uid.to_string();
        doctor.validate()?;
        let stored = self.store.insert_doctor(doctor).await?;
        self.after_doctor_write("create_doctor", &stored, events::DOCTOR_CREATED)
            .await;
        Ok(stored)
    }

    pub async fn update_doctor(&self, clinic_uid: &str, id: i64, mut doctor: Doctor) -> Result<Doctor> {
        doctor.clinic_uid = clinic_uid.to_string();
        doctor.id = id;
        doctor.validate()?;
        let stored = self.store.update_doctor(doctor).await?;
        self.after_doctor_write("update_doctor", &stored, events::DOCTOR_UPDATED)
            .await;
        Ok(stored)
    }

    pub async fn delete_doctor(&self, clinic_uid: &str, id: i64) -> Result<Doctor> {
        let deleted = self.store.delete_doctor(clinic_uid, id).await?;

        PostCommit::new("delete_doctor")
            .hook("remove_staff_identity", async {
                let removed = self.store.remove_staff_identity(&deleted.phone).await?;
                Ok::<_, WorkflowError>(format!("removed {} identity row(s)", removed))
            })
            .hook(
                "notify_clinic",
                self.notify_one(
                    &deleted.clinic_uid,
                    Notification::new(events::DOCTOR_DELETED, json!({ "doctorId": deleted.id })),
                ),
            )
            .run()
            .await;
        Ok(deleted)
    }

    /// Identity sync then clinic notification, after a doctor create/update
    async fn after_doctor_write(&self, operation: &'static str, doctor: &Doctor, kind: &'static str) -> Vec<HookResult> {
        let data = json!({ "doctorId": doctor.id, "doctor": doctor });
        PostCommit::new(operation)
            .hook("sync_identity", self.sync_doctor_identity(doctor))
            .hook(
                "notify_clinic",
                self.notify_one(&doctor.clinic_uid, Notification::new(kind, data)),
            )
            .run()
            .await
    }

    /// Provision or refresh the identity for the doctor's phone
    async fn sync_doctor_identity(&self, doctor: &Doctor) -> Result<String> {
        if doctor.phone.trim().is_empty() {
            return Ok("doctor has no phone, nothing to sync".to_string());
        }
        let identity = self
            .store
            .provision_staff_identity(
                &doctor.phone,
                doctor.provisioned_role(),
                doctor.id,
                &doctor.name,
                &doctor.clinic_uid,
                &doctor.specialty,
            )
            .await?;
        Ok(format!("synced {} as {}", identity.id, identity.role))
    }

    pub async fn list_doctor_route_sheets(
        &self,
        clinic_uid: &str,
        doctor_id: i64,
    ) -> Result<Vec<DoctorRouteSheet>> {
        self.store.list_doctor_route_sheets(clinic_uid, doctor_id).await
    }

    pub async fn put_doctor_route_sheet(
        &self,
        clinic_uid: &str,
        doctor_id: i64,
        contract_id: i64,
        input: RouteSheetInput,
    ) -> Result<DoctorRouteSheet> {
        self.store
            .upsert_doctor_route_sheet(clinic_uid, doctor_id, contract_id, input)
            .await
    }

    // ========================================================================
    // Visits
    // ========================================================================

    pub async fn create_visit(&self, visit: NewVisit) -> Result<Visit> {
        visit.validate()?;
        let phone = visit.phone.clone().filter(|p| !p.trim().is_empty());
        let stored = self.store.insert_visit(visit).await?;

        let data = json!({ "visitId": stored.id, "employeeId": stored.employee_id });
        let mut hooks = PostCommit::new("create_visit");
        if let Some(phone) = phone {
            let store = &self.store;
            let visit = &stored;
            hooks = hooks.hook("sync_employee_identity", async move {
                let identity = store
                    .upsert_employee_identity(
                        &visit.employee_id,
                        &phone,
                        visit.employee_name.as_deref(),
                        &visit.clinic_id,
                        visit.contract_id,
                    )
                    .await?;
                Ok::<_, WorkflowError>(format!("linked {}", identity.id))
            });
        }
        hooks
            .hook(
                "notify_clinic",
                self.notify_one(&stored.clinic_id, Notification::new(events::VISIT_STARTED, data)),
            )
            .run()
            .await;
        Ok(stored)
    }

    pub async fn get_visit(&self, id: i64) -> Result<Visit> {
        self.store.get_visit(id).await
    }

    pub async fn list_visits(&self, filter: VisitFilter) -> Result<Vec<Visit>> {
        self.store.list_visits(filter).await
    }

    /// Apply a visit patch. The clinic and the employee receive the raw patch.
    pub async fn patch_visit(&self, id: i64, raw: Map<String, Value>) -> Result<Visit> {
        let patch: VisitPatch = serde_json::from_value(Value::Object(raw.clone()))
            .map_err(|e| WorkflowError::validation(format!("invalid visit patch: {}", e)))?;
        if let Some(steps) = &patch.route_sheet {
            validate_route_sheet(steps)?;
        }
        let stored = self.store.patch_visit(id, patch).await?;

        let data = json!({
            "visitId": stored.id,
            "employeeId": stored.employee_id,
            "updates": Value::Object(raw),
        });
        let recipients = [stored.clinic_id.clone(), stored.employee_id.clone()];
        PostCommit::new("patch_visit")
            .hook("notify_participants", async {
                let reached = self
                    .hub
                    .send_to_many(&recipients, Notification::new(events::VISIT_UPDATED, data));
                Ok::<_, WorkflowError>(format!("{} connection(s)", reached))
            })
            .run()
            .await;
        Ok(stored)
    }

    // ========================================================================
    // Ambulatory records
    // ========================================================================

    pub async fn get_record(
        &self,
        patient_uid: Option<String>,
        iin: Option<String>,
    ) -> Result<Option<AmbulatoryRecord>> {
        self.store.get_record(patient_uid, iin).await
    }

    /// Upsert a record; specialist entries then drive route-sheet reconciliation
    pub async fn upsert_record(&self, upsert: RecordUpsert) -> Result<AmbulatoryRecord> {
        let specialties = upsert.specialist_keys();
        let iin = upsert.iin.trim().to_string();
        let record = self.store.upsert_record(upsert).await?;

        if !specialties.is_empty() {
            PostCommit::new("upsert_record")
                .hook(
                    "reconcile_route_sheet",
                    self.reconcile_and_notify(&record, &iin, specialties),
                )
                .run()
                .await;
        }
        Ok(record)
    }

    /// Mark matching route-sheet steps on the patient's open visit and tell
    /// the patient (under every identity it is known by) and the clinic.
    async fn reconcile_and_notify(
        &self,
        record: &AmbulatoryRecord,
        iin: &str,
        specialties: Vec<String>,
    ) -> Result<String> {
        let patient_key = record.patient_uid.clone();
        let Some(outcome) = self
            .store
            .reconcile_route_sheet(&patient_key, iin, specialties.clone())
            .await?
        else {
            return Ok(format!("no open visit for {}", patient_key));
        };

        if outcome.open_visits > 1 {
            tracing::warn!(
                "Patient {} has {} open visits; reconciled only visit {}",
                patient_key,
                outcome.open_visits,
                outcome.visit.id
            );
        }
        if !outcome.matched {
            tracing::debug!(
                "No route-sheet step of visit {} matches {:?}",
                outcome.visit.id,
                specialties
            );
            return Ok(format!("no step matched on visit {}", outcome.visit.id));
        }

        let visit = &outcome.visit;
        let mut recipients = vec![
            patient_key.clone(),
            visit.employee_id.clone(),
            visit.clinic_id.clone(),
        ];
        for key in [&patient_key, &visit.employee_id] {
            match self.store.identity_ids_for_employee(key).await {
                Ok(ids) => recipients.extend(ids),
                Err(e) => tracing::warn!("Could not resolve identities for {}: {}", key, e),
            }
        }

        let data = json!({
            "visitId": visit.id,
            "employeeId": visit.employee_id,
            "status": visit.status,
            "completed": outcome.newly_completed,
            "routeSheet": visit.route_sheet,
        });
        let reached = self
            .hub
            .send_to_many(&recipients, Notification::new(events::VISIT_UPDATED, data));
        Ok(format!(
            "visit {} completed {:?}, {} connection(s)",
            visit.id, outcome.newly_completed, reached
        ))
    }

    async fn notify_one(&self, identity: &str, message: Notification) -> Result<String> {
        let reached = self.hub.send(identity, message);
        Ok(format!("{} connection(s) for {}", reached, identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_number_shape() {
        let year = Utc::now().year();
        for _ in 0..50 {
            let number = generate_contract_number();
            let (prefix, suffix) = number.split_once('/').unwrap();
            assert_eq!(prefix, format!("D-{}", year));
            let n: u32 = suffix.parse().unwrap();
            assert!((1000..=9999).contains(&n), "{}", number);
        }
    }
}
