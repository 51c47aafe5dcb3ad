//! Orchestrator behavior end to end: durable write, post-commit hooks and
//! notification fan-out against an in-memory store.

mod common;

use chrono::{Datelike, Utc};
use serde_json::json;

use common::*;
use medflow_server::events;
use medflow_server::schema::{Doctor, IdentityKey, Role, StepStatus, VisitStatus};

fn as_object(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    value.as_object().cloned().unwrap()
}

// ============================================================================
// Contracts
// ============================================================================

#[tokio::test]
async fn test_contract_create_fills_defaults() {
    let env = TestEnv::with_parties().await;
    let created = env
        .orchestrator
        .create_contract(contract_request())
        .await
        .unwrap();

    let (prefix, suffix) = created.number.split_once('/').unwrap();
    assert_eq!(prefix, format!("D-{}", Utc::now().year()));
    assert_eq!(suffix.len(), 4);
    assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    assert_eq!(created.status, "request");
    assert!(!created.client_signed);
    assert!(!created.clinic_signed);
    assert_eq!(created.date, Utc::now().format("%Y-%m-%d").to_string());
}

#[tokio::test]
async fn test_contract_create_ignores_signatures() {
    let env = TestEnv::with_parties().await;
    let mut request = contract_request();
    request.client_signed = true;
    request.clinic_signed = true;
    request.client_sign_otp = Some("1111".to_string());

    let created = env.orchestrator.create_contract(request).await.unwrap();
    assert!(!created.client_signed);
    assert!(!created.clinic_signed);

    let stored = env.orchestrator.get_contract(created.id).await.unwrap();
    assert!(!stored.client_signed);
    assert!(!stored.clinic_signed);
}

#[tokio::test]
async fn test_contract_create_notifies_both_parties() {
    let env = TestEnv::with_parties().await;
    let mut clinic = env.connect(CLINIC_UID, Role::Clinic);
    let mut org = env.connect(ORG_UID, Role::Organization);
    let mut bystander = env.connect("clinic-2", Role::Clinic);

    let created = env
        .orchestrator
        .create_contract(contract_request())
        .await
        .unwrap();

    for registration in [&mut clinic, &mut org] {
        let received = drain(registration);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind, events::CONTRACT_CREATED);
        assert_eq!(received[0].data["contractId"], json!(created.id));
        assert_eq!(received[0].data["contract"]["clientBin"], ORG_BIN);
    }
    assert!(drain(&mut bystander).is_empty());
}

#[tokio::test]
async fn test_contract_with_unknown_party_still_commits() {
    let env = TestEnv::new();
    let created = env
        .orchestrator
        .create_contract(contract_request())
        .await
        .unwrap();
    assert!(env.orchestrator.get_contract(created.id).await.is_ok());
}

#[tokio::test]
async fn test_contract_patch_is_a_merge() {
    let env = TestEnv::with_parties().await;
    let created = env
        .orchestrator
        .create_contract(contract_request())
        .await
        .unwrap();
    let mut org = env.connect(ORG_UID, Role::Organization);

    let patched = env
        .orchestrator
        .patch_contract(created.id, as_object(json!({ "status": "active" })))
        .await
        .unwrap();

    assert_eq!(patched.status, "active");
    let expected = medflow_server::Contract {
        status: "active".to_string(),
        ..created.clone()
    };
    assert_eq!(patched, expected);

    let received = drain(&mut org);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].kind, events::CONTRACT_UPDATED);
    assert_eq!(received[0].data["updates"], json!({ "status": "active" }));
}

#[tokio::test]
async fn test_contract_patch_rejects_wrong_type() {
    let env = TestEnv::with_parties().await;
    let created = env
        .orchestrator
        .create_contract(contract_request())
        .await
        .unwrap();

    let err = env
        .orchestrator
        .patch_contract(created.id, as_object(json!({ "clinicSigned": "yes" })))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");

    let err = env
        .orchestrator
        .patch_contract(created.id + 100, as_object(json!({ "status": "active" })))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn test_contract_delete_detaches_visits() {
    let env = TestEnv::with_parties().await;
    let created = env
        .orchestrator
        .create_contract(contract_request())
        .await
        .unwrap();
    let mut visit = new_visit("emp-1", &["Терапевт"]);
    visit.contract_id = Some(created.id);
    let visit = env.orchestrator.create_visit(visit).await.unwrap();
    assert_eq!(visit.contract_id, Some(created.id));

    let mut clinic = env.connect(CLINIC_UID, Role::Clinic);
    env.orchestrator.delete_contract(created.id).await.unwrap();

    let visit = env.orchestrator.get_visit(visit.id).await.unwrap();
    assert_eq!(visit.contract_id, None);
    assert_eq!(drain_kinds(&mut clinic), vec![events::CONTRACT_DELETED]);
    assert_eq!(
        env.orchestrator.get_contract(created.id).await.unwrap_err().kind(),
        "not_found"
    );
}

// ============================================================================
// Doctors
// ============================================================================

fn doctor(name: &str, specialty: &str, phone: &str) -> Doctor {
    Doctor {
        name: name.to_string(),
        specialty: specialty.to_string(),
        phone: phone.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_doctor_create_provisions_identity() {
    let env = TestEnv::with_parties().await;
    let mut clinic = env.connect(CLINIC_UID, Role::Clinic);

    let stored = env
        .orchestrator
        .create_doctor(CLINIC_UID, doctor("Айгуль", "Кардиолог", "+7 701 555 44 33"))
        .await
        .unwrap();

    let identity = env
        .store
        .find_identity(IdentityKey::Phone, "77015554433")
        .await
        .unwrap()
        .expect("provisioned identity");
    assert_eq!(identity.role, Role::Doctor);
    assert!(identity.id.starts_with("doctor_"));
    assert_eq!(identity.doctor_id, Some(stored.id.to_string()));
    assert_eq!(identity.clinic_bin.as_deref(), Some(CLINIC_BIN));
    assert_eq!(identity.leader_name.as_deref(), Some("Айгуль"));

    let received = drain(&mut clinic);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].kind, events::DOCTOR_CREATED);
    assert_eq!(received[0].data["doctorId"], json!(stored.id));
}

#[tokio::test]
async fn test_registrar_gets_registration_role() {
    let env = TestEnv::with_parties().await;
    env.orchestrator
        .create_doctor(CLINIC_UID, doctor("Данияр", "Регистратор", "77017778899"))
        .await
        .unwrap();
    let identity = env
        .store
        .find_identity(IdentityKey::Phone, "77017778899")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(identity.role, Role::Registration);
}

#[tokio::test]
async fn test_failed_identity_sync_does_not_fail_doctor_write() {
    let env = TestEnv::with_parties().await;
    let mut clinic = env.connect(CLINIC_UID, Role::Clinic);

    // The clinic's own phone cannot be taken over by a doctor
    let stored = env
        .orchestrator
        .create_doctor(CLINIC_UID, doctor("Айгуль", "ЛОР", CLINIC_PHONE))
        .await
        .unwrap();
    assert!(stored.id > 0);

    let identity = env
        .store
        .find_identity(IdentityKey::Phone, CLINIC_PHONE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(identity.role, Role::Clinic);
    assert_eq!(drain_kinds(&mut clinic), vec![events::DOCTOR_CREATED]);
}

#[tokio::test]
async fn test_doctor_update_and_delete_are_clinic_scoped() {
    let env = TestEnv::with_parties().await;
    let stored = env
        .orchestrator
        .create_doctor(CLINIC_UID, doctor("Айгуль", "Невролог", "77015554433"))
        .await
        .unwrap();

    let err = env
        .orchestrator
        .delete_doctor("clinic-2", stored.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");

    let mut changed = stored.clone();
    changed.room_number = Some("204".to_string());
    let updated = env
        .orchestrator
        .update_doctor(CLINIC_UID, stored.id, changed)
        .await
        .unwrap();
    assert_eq!(updated.room_number.as_deref(), Some("204"));

    let mut clinic = env.connect(CLINIC_UID, Role::Clinic);
    env.orchestrator
        .delete_doctor(CLINIC_UID, stored.id)
        .await
        .unwrap();
    assert_eq!(drain_kinds(&mut clinic), vec![events::DOCTOR_DELETED]);
    assert!(env
        .store
        .find_identity(IdentityKey::Phone, "77015554433")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_doctor_for_unknown_clinic() {
    let env = TestEnv::new();
    let err = env
        .orchestrator
        .create_doctor("nobody", doctor("Айгуль", "ЛОР", ""))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

// ============================================================================
// Visits and reconciliation
// ============================================================================

#[tokio::test]
async fn test_visit_create_links_employee_and_notifies_clinic() {
    let env = TestEnv::with_parties().await;
    let mut clinic = env.connect(CLINIC_UID, Role::Clinic);

    let mut visit = new_visit("emp-1", &["Терапевт"]);
    visit.phone = Some("8 (702) 123-45-67".to_string());
    let stored = env.orchestrator.create_visit(visit).await.unwrap();
    assert_eq!(stored.status, VisitStatus::Registered);

    let identity = env
        .store
        .find_identity(IdentityKey::Id, "emp-1")
        .await
        .unwrap()
        .expect("employee identity");
    assert_eq!(identity.role, Role::Employee);
    assert_eq!(identity.phone, "87021234567");

    let received = drain(&mut clinic);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].kind, events::VISIT_STARTED);
    assert_eq!(
        received[0].data,
        json!({ "visitId": stored.id, "employeeId": "emp-1" })
    );
}

#[tokio::test]
async fn test_specialist_entry_completes_route_step() {
    let env = TestEnv::with_parties().await;
    let visit = env
        .orchestrator
        .create_visit(new_visit("emp-1", &["Кардиолог"]))
        .await
        .unwrap();
    let mut employee = env.connect("emp-1", Role::Employee);
    let mut clinic = env.connect(CLINIC_UID, Role::Clinic);

    env.orchestrator
        .upsert_record(specialist_entries("emp-1", &["врач-кардиолог"]))
        .await
        .unwrap();

    let visit = env.orchestrator.get_visit(visit.id).await.unwrap();
    assert_eq!(visit.status, VisitStatus::InProgress);
    assert_eq!(visit.route_sheet[0].status, StepStatus::Completed);
    assert!(visit.route_sheet[0].completed_at.is_some());

    for registration in [&mut employee, &mut clinic] {
        let received = drain(registration);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind, events::VISIT_UPDATED);
        assert_eq!(received[0].data["status"], "in_progress");
        assert_eq!(received[0].data["completed"], json!(["Кардиолог"]));
    }
}

#[tokio::test]
async fn test_reconciliation_is_idempotent() {
    let env = TestEnv::with_parties().await;
    let visit = env
        .orchestrator
        .create_visit(new_visit("emp-1", &["Кардиолог", "ЛОР"]))
        .await
        .unwrap();

    env.orchestrator
        .upsert_record(specialist_entries("emp-1", &["Кардиолог"]))
        .await
        .unwrap();
    let once = env.orchestrator.get_visit(visit.id).await.unwrap();

    env.orchestrator
        .upsert_record(specialist_entries("emp-1", &["Кардиолог"]))
        .await
        .unwrap();
    let twice = env.orchestrator.get_visit(visit.id).await.unwrap();

    assert_eq!(once.route_sheet, twice.route_sheet);
    assert_eq!(twice.route_sheet[1].status, StepStatus::Pending);
    assert_eq!(twice.status, VisitStatus::InProgress);
}

#[tokio::test]
async fn test_concurrent_entries_for_different_steps() {
    let env = TestEnv::with_parties().await;
    let visit = env
        .orchestrator
        .create_visit(new_visit("emp-1", &["Кардиолог", "Невролог"]))
        .await
        .unwrap();

    let first = env.orchestrator.clone();
    let second = env.orchestrator.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move {
            first
                .upsert_record(specialist_entries("emp-1", &["Кардиолог"]))
                .await
        }),
        tokio::spawn(async move {
            second
                .upsert_record(specialist_entries("emp-1", &["врач-невролог"]))
                .await
        }),
    );
    a.unwrap().unwrap();
    b.unwrap().unwrap();

    let visit = env.orchestrator.get_visit(visit.id).await.unwrap();
    assert!(visit.route_sheet.iter().all(|step| step.is_completed()));
}

#[tokio::test]
async fn test_unmatched_entry_changes_nothing() {
    let env = TestEnv::with_parties().await;
    let visit = env
        .orchestrator
        .create_visit(new_visit("emp-1", &["Кардиолог"]))
        .await
        .unwrap();
    let mut employee = env.connect("emp-1", Role::Employee);

    env.orchestrator
        .upsert_record(specialist_entries("emp-1", &["Офтальмолог"]))
        .await
        .unwrap();

    let visit = env.orchestrator.get_visit(visit.id).await.unwrap();
    assert_eq!(visit.status, VisitStatus::Registered);
    assert_eq!(visit.route_sheet[0].status, StepStatus::Pending);
    assert!(drain(&mut employee).is_empty());
}

#[tokio::test]
async fn test_short_label_needs_exact_match() {
    let env = TestEnv::with_parties().await;
    let visit = env
        .orchestrator
        .create_visit(new_visit("emp-1", &["ухо"]))
        .await
        .unwrap();

    env.orchestrator
        .upsert_record(specialist_entries("emp-1", &["психоухолог"]))
        .await
        .unwrap();
    let visit_after = env.orchestrator.get_visit(visit.id).await.unwrap();
    assert_eq!(visit_after.route_sheet[0].status, StepStatus::Pending);

    env.orchestrator
        .upsert_record(specialist_entries("emp-1", &["Ухо"]))
        .await
        .unwrap();
    let visit_after = env.orchestrator.get_visit(visit.id).await.unwrap();
    assert_eq!(visit_after.route_sheet[0].status, StepStatus::Completed);
}

#[tokio::test]
async fn test_record_keyed_by_iin_finds_visit() {
    let env = TestEnv::with_parties().await;
    let visit = env
        .orchestrator
        .create_visit(new_visit("900101300123", &["Терапевт"]))
        .await
        .unwrap();

    let mut upsert = specialist_entries("", &["терапевт"]);
    upsert.iin = "900101300123".to_string();
    let record = env.orchestrator.upsert_record(upsert).await.unwrap();
    assert_eq!(record.patient_uid, "900101300123");

    let visit = env.orchestrator.get_visit(visit.id).await.unwrap();
    assert!(visit.route_sheet[0].is_completed());
}

#[tokio::test]
async fn test_visit_status_is_monotonic() {
    let env = TestEnv::with_parties().await;
    let visit = env
        .orchestrator
        .create_visit(new_visit("emp-1", &["Терапевт"]))
        .await
        .unwrap();

    let err = env
        .orchestrator
        .patch_visit(visit.id, as_object(json!({ "status": "completed" })))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");

    env.orchestrator
        .patch_visit(visit.id, as_object(json!({ "status": "in_progress" })))
        .await
        .unwrap();
    let done = env
        .orchestrator
        .patch_visit(visit.id, as_object(json!({ "status": "completed" })))
        .await
        .unwrap();
    assert_eq!(done.status, VisitStatus::Completed);
    assert!(done.check_out_time.is_some());

    for status in ["registered", "in_progress", "cancelled"] {
        let err = env
            .orchestrator
            .patch_visit(visit.id, as_object(json!({ "status": status })))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation", "completed -> {}", status);
    }
}

#[tokio::test]
async fn test_visit_patch_notifies_clinic_and_employee() {
    let env = TestEnv::with_parties().await;
    let visit = env
        .orchestrator
        .create_visit(new_visit("emp-1", &["Терапевт"]))
        .await
        .unwrap();
    let mut clinic = env.connect(CLINIC_UID, Role::Clinic);
    let mut employee = env.connect("emp-1", Role::Employee);

    env.orchestrator
        .patch_visit(visit.id, as_object(json!({ "notes": "натощак" })))
        .await
        .unwrap();

    for registration in [&mut clinic, &mut employee] {
        let received = drain(registration);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind, events::VISIT_UPDATED);
        assert_eq!(received[0].data["updates"], json!({ "notes": "натощак" }));
    }
}
