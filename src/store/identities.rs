//! Identity persistence: lookups, create-or-merge, staff/employee provisioning

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{is_unique_violation, Budget, WorkflowStore};
use crate::error::{Result, WorkflowError};
use crate::schema::{normalize_phone, now_rfc3339, Identity, IdentityKey, Role};

const IDENTITY_COLUMNS: &str = "id, role, bin, company_name, leader_name, phone, created_at, \
     doctor_id, clinic_id, specialty, clinic_bin, employee_id, contract_id";

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<Identity> {
    let role: String = row.get(1)?;
    let role = role
        .parse::<Role>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    Ok(Identity {
        id: row.get(0)?,
        role,
        bin: row.get(2)?,
        company_name: row.get(3)?,
        leader_name: row.get(4)?,
        phone: row.get(5)?,
        created_at: row.get(6)?,
        doctor_id: row.get(7)?,
        clinic_id: row.get(8)?,
        specialty: row.get(9)?,
        clinic_bin: row.get(10)?,
        employee_id: row.get(11)?,
        contract_id: row.get(12)?,
    })
}

pub(super) fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Identity>> {
    let sql = format!("SELECT {} FROM identities WHERE id = ?1", IDENTITY_COLUMNS);
    Ok(conn.query_row(&sql, [id], identity_from_row).optional()?)
}

fn find_by_phone(conn: &Connection, phone: &str) -> Result<Option<Identity>> {
    let sql = format!("SELECT {} FROM identities WHERE phone = ?1", IDENTITY_COLUMNS);
    Ok(conn.query_row(&sql, [phone], identity_from_row).optional()?)
}

/// Clinic/organization identity holding `bin`, optionally restricted to one role
fn find_by_bin(conn: &Connection, bin: &str, role: Option<Role>) -> Result<Option<Identity>> {
    let sql = format!(
        "SELECT {} FROM identities
         WHERE bin = ?1 AND role IN ('clinic', 'organization') AND (?2 IS NULL OR role = ?2)
         LIMIT 1",
        IDENTITY_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![bin, role.map(|r| r.as_str())], identity_from_row)
        .optional()?)
}

/// Map a uniqueness violation on insert/update to a conflict naming the value
fn map_unique(err: rusqlite::Error, identity: &Identity) -> WorkflowError {
    if is_unique_violation(&err, "identities.bin") {
        WorkflowError::duplicate("BIN", identity.bin.clone().unwrap_or_default())
    } else if is_unique_violation(&err, "identities.phone") {
        WorkflowError::duplicate("phone", identity.phone.clone())
    } else if is_unique_violation(&err, "identities.id") {
        WorkflowError::duplicate("uid", identity.id.clone())
    } else {
        err.into()
    }
}

impl WorkflowStore {
    /// Point lookup. BIN lookups only consider clinic/organization identities.
    pub async fn find_identity(&self, key: IdentityKey, value: &str) -> Result<Option<Identity>> {
        let value = match key {
            IdentityKey::Phone => normalize_phone(value),
            _ => value.trim().to_string(),
        };
        self.call(Budget::Lookup, "find_identity", move |conn| match key {
            IdentityKey::Id => find_by_id(conn, &value),
            IdentityKey::Phone => find_by_phone(conn, &value),
            IdentityKey::Bin => find_by_bin(conn, &value, None),
        })
        .await
    }

    /// Identity with the given role holding `bin`
    pub async fn find_identity_by_bin(&self, bin: &str, role: Role) -> Result<Option<Identity>> {
        let bin = bin.trim().to_string();
        self.call(Budget::Lookup, "find_identity_by_bin", move |conn| {
            find_by_bin(conn, &bin, Some(role))
        })
        .await
    }

    /// Ids of identities linked to an employee/patient key via `employeeId`
    pub async fn identity_ids_for_employee(&self, employee_key: &str) -> Result<Vec<String>> {
        let key = employee_key.to_string();
        self.call(Budget::Lookup, "identity_ids_for_employee", move |conn| {
            let mut stmt = conn.prepare("SELECT id FROM identities WHERE employee_id = ?1")?;
            let ids = stmt
                .query_map([&key], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
        .await
    }

    /// Create-or-merge by phone.
    ///
    /// On phone conflict the stored id is kept, the role is replaced only by an
    /// incoming doctor/registration role, and every other field takes the
    /// incoming value when present.
    pub async fn upsert_identity(&self, identity: Identity) -> Result<Identity> {
        let mut identity = identity;
        identity.phone = normalize_phone(&identity.phone);
        if identity.id.trim().is_empty() || identity.phone.is_empty() {
            return Err(WorkflowError::validation("uid and phone are required"));
        }

        self.call(Budget::Write, "upsert_identity", move |conn| {
            let tx = conn.transaction()?;

            if let Some(bin) = identity.unique_bin() {
                let taken: Option<String> = tx
                    .query_row(
                        "SELECT phone FROM identities
                         WHERE bin = ?1 AND role IN ('clinic', 'organization') AND phone != ?2
                         LIMIT 1",
                        params![bin, identity.phone],
                        |row| row.get(0),
                    )
                    .optional()?;
                if taken.is_some() {
                    return Err(WorkflowError::duplicate("BIN", bin));
                }
            }

            tx.execute(
                "INSERT INTO identities (id, role, bin, company_name, leader_name, phone, created_at,
                                         doctor_id, clinic_id, specialty, clinic_bin, employee_id, contract_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(phone) DO UPDATE SET
                    role = CASE WHEN excluded.role IN ('doctor', 'registration')
                                THEN excluded.role ELSE identities.role END,
                    bin = COALESCE(excluded.bin, identities.bin),
                    company_name = COALESCE(excluded.company_name, identities.company_name),
                    leader_name = COALESCE(excluded.leader_name, identities.leader_name),
                    doctor_id = COALESCE(excluded.doctor_id, identities.doctor_id),
                    clinic_id = COALESCE(excluded.clinic_id, identities.clinic_id),
                    specialty = COALESCE(excluded.specialty, identities.specialty),
                    clinic_bin = COALESCE(excluded.clinic_bin, identities.clinic_bin),
                    employee_id = COALESCE(excluded.employee_id, identities.employee_id),
                    contract_id = COALESCE(excluded.contract_id, identities.contract_id)",
                params![
                    identity.id,
                    identity.role.as_str(),
                    identity.bin,
                    identity.company_name,
                    identity.leader_name,
                    identity.phone,
                    now_rfc3339(),
                    identity.doctor_id,
                    identity.clinic_id,
                    identity.specialty,
                    identity.clinic_bin,
                    identity.employee_id,
                    identity.contract_id,
                ],
            )
            .map_err(|e| map_unique(e, &identity))?;

            let stored = find_by_phone(&tx, &identity.phone)?
                .ok_or_else(|| WorkflowError::not_found("identity", &identity.phone))?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    /// Provision or refresh the staff identity for a doctor's phone.
    ///
    /// An existing identity for the phone is updated in place (id preserved);
    /// otherwise a new `{role}_{uuid}` id is synthesized. Phones held by a
    /// clinic or organization are left alone.
    pub async fn provision_staff_identity(
        &self,
        phone: &str,
        role: Role,
        doctor_id: i64,
        name: &str,
        clinic_uid: &str,
        specialty: &str,
    ) -> Result<Identity> {
        let phone = normalize_phone(phone);
        if phone.is_empty() {
            return Err(WorkflowError::validation("doctor has no usable phone"));
        }
        let name = name.trim().to_string();
        let clinic_uid = clinic_uid.to_string();
        let specialty = specialty.to_string();

        self.call(Budget::Write, "provision_staff_identity", move |conn| {
            let tx = conn.transaction()?;
            let clinic_bin: Option<String> = tx
                .query_row("SELECT bin FROM identities WHERE id = ?1", [&clinic_uid], |row| {
                    row.get(0)
                })
                .optional()?
                .flatten();

            match find_by_phone(&tx, &phone)? {
                Some(existing) if existing.role.has_bin() => {
                    return Err(WorkflowError::validation(format!(
                        "phone {} belongs to {} identity {}",
                        phone, existing.role, existing.id
                    )));
                }
                Some(existing) => {
                    tx.execute(
                        "UPDATE identities
                         SET role = ?1, doctor_id = ?2, clinic_id = ?3, specialty = ?4, clinic_bin = ?5,
                             company_name = ?6, leader_name = ?6
                         WHERE id = ?7",
                        params![
                            role.as_str(),
                            doctor_id.to_string(),
                            clinic_uid,
                            specialty,
                            clinic_bin,
                            name,
                            existing.id
                        ],
                    )?;
                }
                None => {
                    let id = format!("{}_{}", role, Uuid::new_v4().simple());
                    tx.execute(
                        "INSERT INTO identities (id, role, phone, created_at, doctor_id, clinic_id, specialty,
                                                 clinic_bin, company_name, leader_name)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                        params![
                            id,
                            role.as_str(),
                            phone,
                            now_rfc3339(),
                            doctor_id.to_string(),
                            clinic_uid,
                            specialty,
                            clinic_bin,
                            name
                        ],
                    )?;
                }
            }

            let stored = find_by_phone(&tx, &phone)?
                .ok_or_else(|| WorkflowError::not_found("identity", &phone))?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    /// Remove the auto-provisioned staff identity for a phone. Returns rows removed.
    pub async fn remove_staff_identity(&self, phone: &str) -> Result<usize> {
        let phone = normalize_phone(phone);
        if phone.is_empty() {
            return Ok(0);
        }
        self.call(Budget::Write, "remove_staff_identity", move |conn| {
            Ok(conn.execute(
                "DELETE FROM identities WHERE phone = ?1 AND role IN ('doctor', 'registration')",
                [&phone],
            )?)
        })
        .await
    }

    /// Provision or refresh the employee identity used for a visit.
    ///
    /// The identity is keyed by phone with `id = employee_id`; an existing
    /// employee identity for the phone gets its visit linkage refreshed.
    pub async fn upsert_employee_identity(
        &self,
        employee_id: &str,
        phone: &str,
        name: Option<&str>,
        clinic_id: &str,
        contract_id: Option<i64>,
    ) -> Result<Identity> {
        let phone = normalize_phone(phone);
        if phone.is_empty() {
            return Err(WorkflowError::validation("employee has no usable phone"));
        }
        let employee_id = employee_id.to_string();
        let name = name.map(str::to_string);
        let clinic_id = clinic_id.to_string();
        let contract_id = contract_id.map(|id| id.to_string());

        self.call(Budget::Write, "upsert_employee_identity", move |conn| {
            let tx = conn.transaction()?;
            if let Some(existing) = find_by_phone(&tx, &phone)? {
                if existing.role != Role::Employee {
                    return Err(WorkflowError::validation(format!(
                        "phone {} belongs to {} identity {}",
                        phone, existing.role, existing.id
                    )));
                }
            }

            let mut identity = Identity::new(&employee_id, Role::Employee, &phone);
            identity.employee_id = Some(employee_id.clone());
            tx.execute(
                "INSERT INTO identities (id, role, phone, created_at, employee_id, contract_id, clinic_id, company_name)
                 VALUES (?1, 'employee', ?2, ?3, ?1, ?4, ?5, ?6)
                 ON CONFLICT(phone) DO UPDATE SET
                    employee_id = excluded.employee_id,
                    contract_id = excluded.contract_id,
                    clinic_id = excluded.clinic_id,
                    company_name = COALESCE(excluded.company_name, identities.company_name)",
                params![employee_id, phone, now_rfc3339(), contract_id, clinic_id, name],
            )
            .map_err(|e| map_unique(e, &identity))?;

            let stored = find_by_phone(&tx, &phone)?
                .ok_or_else(|| WorkflowError::not_found("identity", &phone))?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::StoreTimeouts;

    fn store() -> WorkflowStore {
        WorkflowStore::open_in_memory(StoreTimeouts::default()).unwrap()
    }

    fn clinic(id: &str, phone: &str, bin: &str) -> Identity {
        let mut identity = Identity::new(id, Role::Clinic, phone);
        identity.bin = Some(bin.into());
        identity.company_name = Some("Clinic".into());
        identity
    }

    #[tokio::test]
    async fn test_merge_by_phone_keeps_id_and_role() {
        let store = store();
        store.upsert_identity(clinic("c-1", "+7 700 000 0001", "456")).await.unwrap();

        let mut again = Identity::new("other-id", Role::Employee, "77000000001");
        again.leader_name = Some("Director".into());
        let merged = store.upsert_identity(again).await.unwrap();

        assert_eq!(merged.id, "c-1");
        assert_eq!(merged.role, Role::Clinic);
        assert_eq!(merged.bin.as_deref(), Some("456"));
        assert_eq!(merged.leader_name.as_deref(), Some("Director"));
    }

    #[tokio::test]
    async fn test_doctor_role_overwrites_on_merge() {
        let store = store();
        store
            .upsert_identity(Identity::new("e-1", Role::Employee, "77000000002"))
            .await
            .unwrap();
        let merged = store
            .upsert_identity(Identity::new("d-1", Role::Doctor, "77000000002"))
            .await
            .unwrap();
        assert_eq!(merged.id, "e-1");
        assert_eq!(merged.role, Role::Doctor);
    }

    #[tokio::test]
    async fn test_bin_conflict_names_value() {
        let store = store();
        store.upsert_identity(clinic("c-1", "77000000001", "456")).await.unwrap();
        let err = store
            .upsert_identity(clinic("c-2", "77000000009", "456"))
            .await
            .unwrap_err();
        match err {
            WorkflowError::Conflict { value, .. } => assert_eq!(value, "456"),
            other => panic!("Expected Conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lookup_by_each_key() {
        let store = store();
        store.upsert_identity(clinic("c-1", "77000000001", "456")).await.unwrap();

        for (key, value) in [
            (IdentityKey::Id, "c-1"),
            (IdentityKey::Phone, "+7 (700) 000-00-01"),
            (IdentityKey::Bin, "456"),
        ] {
            let found = store.find_identity(key, value).await.unwrap();
            assert_eq!(found.map(|i| i.id).as_deref(), Some("c-1"), "{:?}", key);
        }
        assert!(store.find_identity(IdentityKey::Id, "nope").await.unwrap().is_none());
        assert!(store.find_identity_by_bin("456", Role::Organization).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_staff_provisioning_updates_in_place() {
        let store = store();
        store.upsert_identity(clinic("c-1", "77000000001", "456")).await.unwrap();

        let first = store
            .provision_staff_identity("8 (701) 555-11-22", Role::Doctor, 1, "Айгуль", "c-1", "Кардиолог")
            .await
            .unwrap();
        assert!(first.id.starts_with("doctor_"));
        assert_eq!(first.phone, "87015551122");
        assert_eq!(first.clinic_bin.as_deref(), Some("456"));
        assert_eq!(first.company_name.as_deref(), Some("Айгуль"));
        assert_eq!(first.leader_name.as_deref(), Some("Айгуль"));

        let second = store
            .provision_staff_identity("87015551122", Role::Registration, 1, "Айгуль Серикова", "c-1", "Регистратор")
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.role, Role::Registration);
        assert_eq!(second.company_name.as_deref(), Some("Айгуль Серикова"));
        assert_eq!(second.leader_name.as_deref(), Some("Айгуль Серикова"));

        assert_eq!(store.remove_staff_identity("87015551122").await.unwrap(), 1);
        assert_eq!(store.remove_staff_identity("87015551122").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_staff_provisioning_never_touches_clinic_phone() {
        let store = store();
        store.upsert_identity(clinic("c-1", "77000000001", "456")).await.unwrap();
        let err = store
            .provision_staff_identity("77000000001", Role::Doctor, 1, "Айгуль", "c-1", "ЛОР")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        let kept = store.find_identity(IdentityKey::Id, "c-1").await.unwrap().unwrap();
        assert_eq!(kept.role, Role::Clinic);
    }

    #[tokio::test]
    async fn test_employee_identity_links_visit() {
        let store = store();
        let identity = store
            .upsert_employee_identity("emp-7", "77010000007", Some("Иванов"), "c-1", Some(3))
            .await
            .unwrap();
        assert_eq!(identity.id, "emp-7");
        assert_eq!(identity.employee_id.as_deref(), Some("emp-7"));
        assert_eq!(identity.contract_id.as_deref(), Some("3"));

        let ids = store.identity_ids_for_employee("emp-7").await.unwrap();
        assert_eq!(ids, vec!["emp-7".to_string()]);
    }
}
