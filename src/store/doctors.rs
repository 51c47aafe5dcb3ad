//! Doctor roster and per-contract doctor route sheets

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use super::{json_column, json_text, Budget, WorkflowStore};
use crate::error::{Result, WorkflowError};
use crate::schema::{now_rfc3339, Doctor, DoctorRouteSheet, RouteSheetInput};

const DOCTOR_COLUMNS: &str = "id, clinic_uid, name, specialty, phone, is_chairman, room_number";

fn doctor_from_row(row: &Row<'_>) -> rusqlite::Result<Doctor> {
    Ok(Doctor {
        id: row.get(0)?,
        clinic_uid: row.get(1)?,
        name: row.get(2)?,
        specialty: row.get(3)?,
        phone: row.get(4)?,
        is_chairman: row.get(5)?,
        room_number: row.get(6)?,
    })
}

fn route_sheet_from_row(row: &Row<'_>) -> rusqlite::Result<DoctorRouteSheet> {
    Ok(DoctorRouteSheet {
        id: row.get(0)?,
        doctor_id: row.get(1)?,
        contract_id: row.get(2)?,
        specialty: row.get(3)?,
        virtual_doctor: row.get(4)?,
        employees: json_column(row, 5)?,
        created_at: row.get(6)?,
    })
}

fn fetch(conn: &Connection, clinic_uid: &str, id: i64) -> Result<Option<Doctor>> {
    let sql = format!(
        "SELECT {} FROM doctors WHERE id = ?1 AND clinic_uid = ?2",
        DOCTOR_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![id, clinic_uid], doctor_from_row)
        .optional()?)
}

fn require_clinic(conn: &Connection, clinic_uid: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM identities WHERE id = ?1)",
        [clinic_uid],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(WorkflowError::not_found("clinic", clinic_uid))
    }
}

impl WorkflowStore {
    /// A clinic's doctors ordered by name
    pub async fn list_doctors(&self, clinic_uid: &str) -> Result<Vec<Doctor>> {
        let clinic_uid = clinic_uid.to_string();
        self.call(Budget::Scan, "list_doctors", move |conn| {
            let sql = format!(
                "SELECT {} FROM doctors WHERE clinic_uid = ?1 ORDER BY name, id",
                DOCTOR_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let doctors = stmt
                .query_map([&clinic_uid], doctor_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(doctors)
        })
        .await
    }

    pub async fn get_doctor(&self, clinic_uid: &str, id: i64) -> Result<Doctor> {
        let clinic_uid = clinic_uid.to_string();
        self.call(Budget::Lookup, "get_doctor", move |conn| {
            fetch(conn, &clinic_uid, id)?.ok_or_else(|| WorkflowError::not_found("doctor", id))
        })
        .await
    }

    pub async fn insert_doctor(&self, doctor: Doctor) -> Result<Doctor> {
        self.call(Budget::Write, "insert_doctor", move |conn| {
            let tx = conn.transaction()?;
            require_clinic(&tx, &doctor.clinic_uid)?;
            tx.execute(
                "INSERT INTO doctors (clinic_uid, name, specialty, phone, is_chairman, room_number)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    doctor.clinic_uid,
                    doctor.name.trim(),
                    doctor.specialty.trim(),
                    doctor.phone.trim(),
                    doctor.is_chairman,
                    doctor.room_number
                ],
            )?;
            let id = tx.last_insert_rowid();
            let stored = fetch(&tx, &doctor.clinic_uid, id)?
                .ok_or_else(|| WorkflowError::not_found("doctor", id))?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    /// Replace a doctor's fields, scoped to the owning clinic
    pub async fn update_doctor(&self, doctor: Doctor) -> Result<Doctor> {
        self.call(Budget::Write, "update_doctor", move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE doctors SET name = ?1, specialty = ?2, phone = ?3, is_chairman = ?4, room_number = ?5
                 WHERE id = ?6 AND clinic_uid = ?7",
                params![
                    doctor.name.trim(),
                    doctor.specialty.trim(),
                    doctor.phone.trim(),
                    doctor.is_chairman,
                    doctor.room_number,
                    doctor.id,
                    doctor.clinic_uid
                ],
            )?;
            if changed == 0 {
                return Err(WorkflowError::not_found("doctor", doctor.id));
            }
            let stored = fetch(&tx, &doctor.clinic_uid, doctor.id)?
                .ok_or_else(|| WorkflowError::not_found("doctor", doctor.id))?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    /// Delete a doctor (route sheets cascade). Returns the deleted snapshot.
    pub async fn delete_doctor(&self, clinic_uid: &str, id: i64) -> Result<Doctor> {
        let clinic_uid = clinic_uid.to_string();
        self.call(Budget::Write, "delete_doctor", move |conn| {
            let tx = conn.transaction()?;
            let existing = fetch(&tx, &clinic_uid, id)?
                .ok_or_else(|| WorkflowError::not_found("doctor", id))?;
            tx.execute("DELETE FROM doctors WHERE id = ?1", [id])?;
            tx.commit()?;
            Ok(existing)
        })
        .await
    }

    pub async fn list_doctor_route_sheets(
        &self,
        clinic_uid: &str,
        doctor_id: i64,
    ) -> Result<Vec<DoctorRouteSheet>> {
        let clinic_uid = clinic_uid.to_string();
        self.call(Budget::Scan, "list_doctor_route_sheets", move |conn| {
            fetch(conn, &clinic_uid, doctor_id)?
                .ok_or_else(|| WorkflowError::not_found("doctor", doctor_id))?;
            let mut stmt = conn.prepare(
                "SELECT id, doctor_id, contract_id, specialty, virtual_doctor, employees, created_at
                 FROM doctor_route_sheets WHERE doctor_id = ?1 ORDER BY contract_id",
            )?;
            let sheets = stmt
                .query_map([doctor_id], route_sheet_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(sheets)
        })
        .await
    }

    /// Create or replace the roster for one (doctor, contract) pair
    pub async fn upsert_doctor_route_sheet(
        &self,
        clinic_uid: &str,
        doctor_id: i64,
        contract_id: i64,
        input: RouteSheetInput,
    ) -> Result<DoctorRouteSheet> {
        let clinic_uid = clinic_uid.to_string();
        self.call(Budget::Write, "upsert_doctor_route_sheet", move |conn| {
            let tx = conn.transaction()?;
            fetch(&tx, &clinic_uid, doctor_id)?
                .ok_or_else(|| WorkflowError::not_found("doctor", doctor_id))?;
            super::contracts::fetch(&tx, contract_id)?
                .ok_or_else(|| WorkflowError::not_found("contract", contract_id))?;

            tx.execute(
                "INSERT INTO doctor_route_sheets (doctor_id, contract_id, specialty, virtual_doctor, employees, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(doctor_id, contract_id) DO UPDATE SET
                    specialty = excluded.specialty,
                    virtual_doctor = excluded.virtual_doctor,
                    employees = excluded.employees",
                params![
                    doctor_id,
                    contract_id,
                    input.specialty,
                    input.virtual_doctor,
                    json_text(&Value::Array(input.employees))?,
                    now_rfc3339()
                ],
            )?;
            let sheet = tx.query_row(
                "SELECT id, doctor_id, contract_id, specialty, virtual_doctor, employees, created_at
                 FROM doctor_route_sheets WHERE doctor_id = ?1 AND contract_id = ?2",
                params![doctor_id, contract_id],
                route_sheet_from_row,
            )?;
            tx.commit()?;
            Ok(sheet)
        })
        .await
    }
}
