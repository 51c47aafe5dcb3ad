//! Ambulatory record persistence

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use super::{json_column, json_text, Budget, WorkflowStore};
use crate::error::{Result, WorkflowError};
use crate::schema::{now_rfc3339, AmbulatoryRecord, RecordUpsert};

const RECORD_COLUMNS: &str = "id, patient_uid, iin, general, medical, specialist_entries, \
     lab_results, final_conclusion, communication, patient_instruction, created_at, updated_at";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AmbulatoryRecord> {
    let communication = json_column(row, 8)?;
    Ok(AmbulatoryRecord {
        id: row.get(0)?,
        patient_uid: row.get(1)?,
        iin: row.get(2)?,
        general: json_column(row, 3)?,
        medical: json_column(row, 4)?,
        specialist_entries: json_column(row, 5)?,
        lab_results: json_column(row, 6)?,
        final_conclusion: json_column(row, 7)?,
        communication: (!communication.is_null()).then_some(communication),
        patient_instruction: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn fetch_by(conn: &Connection, column: &str, value: &str) -> Result<Option<AmbulatoryRecord>> {
    let sql = format!(
        "SELECT {} FROM ambulatory_records WHERE {} = ?1 ORDER BY updated_at DESC LIMIT 1",
        RECORD_COLUMNS, column
    );
    Ok(conn.query_row(&sql, [value], record_from_row).optional()?)
}

/// Serialize a section, treating JSON null like an absent section
fn section(value: &Option<Value>) -> Result<Option<String>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => json_text(v).map(Some),
    }
}

impl WorkflowStore {
    /// Record by patient uid, else by national ID
    pub async fn get_record(
        &self,
        patient_uid: Option<String>,
        iin: Option<String>,
    ) -> Result<Option<AmbulatoryRecord>> {
        let patient_uid = patient_uid.filter(|v| !v.trim().is_empty());
        let iin = iin.filter(|v| !v.trim().is_empty());
        if patient_uid.is_none() && iin.is_none() {
            return Err(WorkflowError::validation("patientUid or iin is required"));
        }

        self.call(Budget::Lookup, "get_record", move |conn| {
            if let Some(uid) = &patient_uid {
                if let Some(record) = fetch_by(conn, "patient_uid", uid.trim())? {
                    return Ok(Some(record));
                }
            }
            match &iin {
                Some(iin) => fetch_by(conn, "iin", iin.trim()),
                None => Ok(None),
            }
        })
        .await
    }

    /// Upsert keyed on the patient key. Absent sections keep their stored
    /// value; `updated_at` is refreshed on every write.
    pub async fn upsert_record(&self, upsert: RecordUpsert) -> Result<AmbulatoryRecord> {
        let key = upsert.patient_key()?.to_string();
        self.call(Budget::Write, "upsert_record", move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO ambulatory_records (patient_uid, iin, general, medical, specialist_entries,
                                                 lab_results, final_conclusion, communication,
                                                 patient_instruction, created_at, updated_at)
                 VALUES (?1, ?2, COALESCE(?3, '{}'), COALESCE(?4, '{}'), COALESCE(?5, '{}'),
                         COALESCE(?6, '{}'), COALESCE(?7, '{}'), ?8, ?9, ?10, ?10)
                 ON CONFLICT(patient_uid) DO UPDATE SET
                    iin = CASE WHEN ?2 != '' THEN ?2 ELSE ambulatory_records.iin END,
                    general = COALESCE(?3, ambulatory_records.general),
                    medical = COALESCE(?4, ambulatory_records.medical),
                    specialist_entries = COALESCE(?5, ambulatory_records.specialist_entries),
                    lab_results = COALESCE(?6, ambulatory_records.lab_results),
                    final_conclusion = COALESCE(?7, ambulatory_records.final_conclusion),
                    communication = COALESCE(?8, ambulatory_records.communication),
                    patient_instruction = COALESCE(?9, ambulatory_records.patient_instruction),
                    updated_at = ?10",
                params![
                    key,
                    upsert.iin.trim(),
                    section(&upsert.general)?,
                    section(&upsert.medical)?,
                    section(&upsert.specialist_entries)?,
                    section(&upsert.lab_results)?,
                    section(&upsert.final_conclusion)?,
                    section(&upsert.communication)?,
                    upsert.patient_instruction,
                    now_rfc3339(),
                ],
            )?;
            let stored = fetch_by(&tx, "patient_uid", &key)?
                .ok_or_else(|| WorkflowError::not_found("ambulatory record", &key))?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }
}
