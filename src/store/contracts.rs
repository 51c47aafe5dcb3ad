//! Contract persistence

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::{json_column, json_text, typed_json_column, Budget, WorkflowStore};
use crate::error::{Result, WorkflowError};
use crate::schema::{CalendarPlan, Contract, ContractPatch};

const CONTRACT_COLUMNS: &str = "id, number, client_name, client_bin, client_signed, clinic_name, \
     clinic_bin, clinic_signed, date, status, price, planned_headcount, employees, documents, \
     calendar_plan, client_sign_otp, clinic_sign_otp";

fn contract_from_row(row: &Row<'_>) -> rusqlite::Result<Contract> {
    let employees = json_column(row, 12)?;
    let documents = json_column(row, 13)?;
    Ok(Contract {
        id: row.get(0)?,
        number: row.get(1)?,
        client_name: row.get(2)?,
        client_bin: row.get(3)?,
        client_signed: row.get(4)?,
        clinic_name: row.get(5)?,
        clinic_bin: row.get(6)?,
        clinic_signed: row.get(7)?,
        date: row.get(8)?,
        status: row.get(9)?,
        price: row.get(10)?,
        planned_headcount: row.get(11)?,
        employees: (!employees.is_null()).then_some(employees),
        documents: (!documents.is_null()).then_some(documents),
        calendar_plan: typed_json_column::<CalendarPlan>(row, 14)?,
        client_sign_otp: row.get(15)?,
        clinic_sign_otp: row.get(16)?,
    })
}

pub(super) fn fetch(conn: &Connection, id: i64) -> Result<Option<Contract>> {
    let sql = format!("SELECT {} FROM contracts WHERE id = ?1", CONTRACT_COLUMNS);
    Ok(conn.query_row(&sql, [id], contract_from_row).optional()?)
}

fn optional_json(value: &Option<serde_json::Value>) -> Result<Option<String>> {
    value.as_ref().map(json_text).transpose()
}

/// `SET` assignments for the fields present in a patch
fn patch_assignments(patch: &ContractPatch) -> Result<Vec<(&'static str, SqlValue)>> {
    fn text(value: Option<String>) -> SqlValue {
        value.map(SqlValue::Text).unwrap_or(SqlValue::Null)
    }

    let mut sets = Vec::new();
    if let Some(status) = &patch.status {
        sets.push(("status", SqlValue::Text(status.clone())));
    }
    if let Some(number) = &patch.number {
        sets.push(("number", SqlValue::Text(number.clone())));
    }
    if let Some(employees) = &patch.employees {
        sets.push(("employees", text(Some(json_text(employees)?))));
    }
    if let Some(documents) = &patch.documents {
        sets.push(("documents", text(Some(json_text(documents)?))));
    }
    if let Some(plan) = &patch.calendar_plan {
        let plan = plan.as_ref().map(serde_json::to_string).transpose()?;
        sets.push(("calendar_plan", text(plan)));
    }
    if let Some(signed) = patch.client_signed {
        sets.push(("client_signed", SqlValue::Integer(signed as i64)));
    }
    if let Some(signed) = patch.clinic_signed {
        sets.push(("clinic_signed", SqlValue::Integer(signed as i64)));
    }
    if let Some(otp) = &patch.client_sign_otp {
        sets.push(("client_sign_otp", text(otp.clone())));
    }
    if let Some(otp) = &patch.clinic_sign_otp {
        sets.push(("clinic_sign_otp", text(otp.clone())));
    }
    if let Some(price) = patch.price {
        sets.push(("price", SqlValue::Real(price)));
    }
    if let Some(headcount) = patch.planned_headcount {
        sets.push(("planned_headcount", SqlValue::Integer(headcount)));
    }
    Ok(sets)
}

impl WorkflowStore {
    /// Contracts where either party's BIN matches, newest first
    pub async fn list_contracts(&self, bin: &str) -> Result<Vec<Contract>> {
        let bin = bin.trim().to_string();
        self.call(Budget::Scan, "list_contracts", move |conn| {
            let sql = format!(
                "SELECT {} FROM contracts WHERE client_bin = ?1 OR clinic_bin = ?1
                 ORDER BY date DESC, id DESC",
                CONTRACT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let contracts = stmt
                .query_map([&bin], contract_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(contracts)
        })
        .await
    }

    pub async fn get_contract(&self, id: i64) -> Result<Contract> {
        self.call(Budget::Lookup, "get_contract", move |conn| {
            fetch(conn, id)?.ok_or_else(|| WorkflowError::not_found("contract", id))
        })
        .await
    }

    /// Insert a fully-defaulted contract and return the stored row
    pub async fn insert_contract(&self, contract: Contract) -> Result<Contract> {
        self.call(Budget::Write, "insert_contract", move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO contracts (number, client_name, client_bin, client_signed, clinic_name,
                                        clinic_bin, clinic_signed, date, status, price, planned_headcount,
                                        employees, documents, calendar_plan, client_sign_otp, clinic_sign_otp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    contract.number,
                    contract.client_name,
                    contract.client_bin,
                    contract.client_signed,
                    contract.clinic_name,
                    contract.clinic_bin,
                    contract.clinic_signed,
                    contract.date,
                    contract.status,
                    contract.price,
                    contract.planned_headcount,
                    optional_json(&contract.employees)?,
                    optional_json(&contract.documents)?,
                    contract
                        .calendar_plan
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    contract.client_sign_otp,
                    contract.clinic_sign_otp,
                ],
            )?;
            let id = tx.last_insert_rowid();
            let stored = fetch(&tx, id)?.ok_or_else(|| WorkflowError::not_found("contract", id))?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    /// Apply a merge-patch in one `UPDATE` and return the current row.
    /// Fields absent from the patch are untouched.
    pub async fn patch_contract(&self, id: i64, patch: ContractPatch) -> Result<Contract> {
        self.call(Budget::Write, "patch_contract", move |conn| {
            let sets = patch_assignments(&patch)?;
            if sets.is_empty() {
                return fetch(conn, id)?.ok_or_else(|| WorkflowError::not_found("contract", id));
            }

            let assignments: Vec<String> = sets
                .iter()
                .enumerate()
                .map(|(idx, (column, _))| format!("{} = ?{}", column, idx + 1))
                .collect();
            let sql = format!(
                "UPDATE contracts SET {} WHERE id = ?{}",
                assignments.join(", "),
                sets.len() + 1
            );
            let mut values: Vec<SqlValue> = sets.into_iter().map(|(_, value)| value).collect();
            values.push(SqlValue::Integer(id));

            let tx = conn.transaction()?;
            if tx.execute(&sql, params_from_iter(values))? == 0 {
                return Err(WorkflowError::not_found("contract", id));
            }
            let stored = fetch(&tx, id)?.ok_or_else(|| WorkflowError::not_found("contract", id))?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    /// Delete a contract. Visits keep existing with the reference cleared and
    /// doctor rosters for it are removed. Returns the deleted snapshot.
    pub async fn delete_contract(&self, id: i64) -> Result<Contract> {
        self.call(Budget::Write, "delete_contract", move |conn| {
            let tx = conn.transaction()?;
            let existing = fetch(&tx, id)?.ok_or_else(|| WorkflowError::not_found("contract", id))?;
            tx.execute("DELETE FROM contracts WHERE id = ?1", [id])?;
            tx.commit()?;
            Ok(existing)
        })
        .await
    }
}
