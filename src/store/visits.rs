//! Visit persistence and route-sheet reconciliation
//!
//! Reconciliation is one `UPDATE` over the JSON route-sheet column. The
//! statement rebuilds the step array with `json_each`/`json_group_array`,
//! marking pending steps whose specialty matches (via the registered
//! `route_step_matches` function) as completed. Completed steps keep their
//! original `completedAt`, so replaying the same entry changes nothing.

use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Deserialize;

use super::{json_column, json_text, typed_json_column, Budget, WorkflowStore};
use crate::error::{Result, WorkflowError};
use crate::schema::{now_rfc3339, today, NewVisit, RouteStep, Visit, VisitPatch, VisitStatus};
use crate::workflow::specialty;

const VISIT_COLUMNS: &str = "id, employee_id, employee_name, client_name, contract_id, clinic_id, \
     visit_date, status, route_sheet, documents_issued, check_in_time, check_out_time, \
     registered_by, notes, created_at, updated_at";

const OPEN_STATUSES: &str = "('registered', 'in_progress')";

const RECONCILE_SQL: &str = "
UPDATE visits SET
    route_sheet = (
        SELECT json_group_array(json(
            CASE
                WHEN json_extract(step.value, '$.status') IS NOT 'completed'
                     AND route_step_matches(json_extract(step.value, '$.specialty'), ?1)
                THEN json_set(step.value, '$.status', 'completed', '$.completedAt', ?2)
                ELSE step.value
            END))
        FROM json_each(visits.route_sheet) AS step
    ),
    status = CASE WHEN status = 'registered' THEN 'in_progress' ELSE status END,
    updated_at = ?2
WHERE id = ?3
  AND status IN ('registered', 'in_progress')
  AND EXISTS (
      SELECT 1 FROM json_each(visits.route_sheet) AS s
      WHERE route_step_matches(json_extract(s.value, '$.specialty'), ?1)
  )";

/// Filters for listing visits. `doctor_id` is a specialty label matched
/// against route-sheet steps.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VisitFilter {
    pub clinic_id: Option<String>,
    pub employee_id: Option<String>,
    pub doctor_id: Option<String>,
}

/// Outcome of reconciling one patient's open visit
#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// The visit after the update
    pub visit: Visit,
    /// Specialties of steps completed by this call
    pub newly_completed: Vec<String>,
    /// Whether any step matched (completed now or earlier)
    pub matched: bool,
    /// Open visits found for the patient; only the most recent is touched
    pub open_visits: usize,
}

fn visit_from_row(row: &Row<'_>) -> rusqlite::Result<Visit> {
    let status: String = row.get(7)?;
    let status = status
        .parse::<VisitStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
    Ok(Visit {
        id: row.get(0)?,
        employee_id: row.get(1)?,
        employee_name: row.get(2)?,
        client_name: row.get(3)?,
        contract_id: row.get(4)?,
        clinic_id: row.get(5)?,
        visit_date: row.get(6)?,
        status,
        route_sheet: typed_json_column::<Vec<RouteStep>>(row, 8)?.unwrap_or_default(),
        documents_issued: json_column(row, 9)?,
        check_in_time: row.get(10)?,
        check_out_time: row.get(11)?,
        registered_by: row.get(12)?,
        notes: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn fetch(conn: &Connection, id: i64) -> Result<Option<Visit>> {
    let sql = format!("SELECT {} FROM visits WHERE id = ?1", VISIT_COLUMNS);
    Ok(conn.query_row(&sql, [id], visit_from_row).optional()?)
}

/// Most recently updated open visit for an employee key, plus the open count
fn latest_open_visit(conn: &Connection, employee_key: &str) -> Result<(Option<i64>, usize)> {
    let sql = format!(
        "SELECT id FROM visits WHERE employee_id = ?1 AND status IN {}
         ORDER BY updated_at DESC, id DESC",
        OPEN_STATUSES
    );
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map([employee_key], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok((ids.first().copied(), ids.len()))
}

impl WorkflowStore {
    /// Register a visit. An unknown contract reference is a validation error.
    pub async fn insert_visit(&self, visit: NewVisit) -> Result<Visit> {
        visit.validate()?;
        self.call(Budget::Write, "insert_visit", move |conn| {
            let tx = conn.transaction()?;
            let contract_id = visit.contract_ref();
            if let Some(id) = contract_id {
                if super::contracts::fetch(&tx, id)?.is_none() {
                    return Err(WorkflowError::validation(format!(
                        "contract {} does not exist",
                        id
                    )));
                }
            }

            let now = now_rfc3339();
            let status = visit.status.unwrap_or(VisitStatus::Registered);
            tx.execute(
                "INSERT INTO visits (employee_id, employee_name, client_name, contract_id, clinic_id,
                                     visit_date, check_in_time, status, route_sheet, registered_by,
                                     notes, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?7, ?7)",
                params![
                    visit.employee_id.trim(),
                    visit.employee_name,
                    visit.client_name,
                    contract_id,
                    visit.clinic_id.trim(),
                    visit.visit_date.clone().unwrap_or_else(today),
                    now,
                    status.as_str(),
                    serde_json::to_string(&visit.route_sheet)?,
                    visit.registered_by,
                    visit.notes,
                ],
            )?;
            let id = tx.last_insert_rowid();
            let stored = fetch(&tx, id)?.ok_or_else(|| WorkflowError::not_found("visit", id))?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    pub async fn get_visit(&self, id: i64) -> Result<Visit> {
        self.call(Budget::Lookup, "get_visit", move |conn| {
            fetch(conn, id)?.ok_or_else(|| WorkflowError::not_found("visit", id))
        })
        .await
    }

    /// Visits matching every given filter, newest first
    pub async fn list_visits(&self, filter: VisitFilter) -> Result<Vec<Visit>> {
        self.call(Budget::Scan, "list_visits", move |conn| {
            let mut clauses = Vec::new();
            let mut values: Vec<String> = Vec::new();

            if let Some(clinic_id) = filter.clinic_id.filter(|v| !v.trim().is_empty()) {
                values.push(clinic_id.trim().to_string());
                clauses.push(format!("clinic_id = ?{}", values.len()));
            }
            if let Some(employee_id) = filter.employee_id.filter(|v| !v.trim().is_empty()) {
                values.push(employee_id.trim().to_string());
                clauses.push(format!("employee_id = ?{}", values.len()));
            }
            if let Some(label) = filter.doctor_id.filter(|v| !v.trim().is_empty()) {
                values.push(serde_json::to_string(&[label])?);
                clauses.push(format!(
                    "EXISTS (SELECT 1 FROM json_each(visits.route_sheet) AS s
                             WHERE route_step_matches(json_extract(s.value, '$.specialty'), ?{}))",
                    values.len()
                ));
            }

            let where_clause = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };
            let sql = format!(
                "SELECT {} FROM visits {} ORDER BY created_at DESC, id DESC",
                VISIT_COLUMNS, where_clause
            );
            let mut stmt = conn.prepare(&sql)?;
            let visits = stmt
                .query_map(params_from_iter(values), visit_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(visits)
        })
        .await
    }

    /// Apply a visit patch in one transaction.
    ///
    /// The status change is a conditional `UPDATE` guarded by the legal
    /// predecessors of the target status, so concurrent patches can never
    /// move a visit backwards or out of a terminal state.
    pub async fn patch_visit(&self, id: i64, patch: VisitPatch) -> Result<Visit> {
        self.call(Budget::Write, "patch_visit", move |conn| {
            let tx = conn.transaction()?;
            let now = now_rfc3339();

            if let Some(next) = patch.status {
                let predecessors: Vec<&str> =
                    next.predecessors().iter().map(VisitStatus::as_str).collect();
                let placeholders: Vec<String> =
                    (0..predecessors.len()).map(|i| format!("?{}", i + 4)).collect();
                let sql = format!(
                    "UPDATE visits SET
                        status = ?1,
                        check_out_time = CASE WHEN ?1 = 'completed'
                                              THEN COALESCE(check_out_time, ?2)
                                              ELSE check_out_time END,
                        updated_at = ?2
                     WHERE id = ?3 AND status IN ({})",
                    placeholders.join(", ")
                );
                let mut values: Vec<rusqlite::types::Value> = vec![
                    next.as_str().to_string().into(),
                    now.clone().into(),
                    id.into(),
                ];
                values.extend(predecessors.iter().map(|s| s.to_string().into()));

                if tx.execute(&sql, params_from_iter(values))? == 0 {
                    let current = fetch(&tx, id)?.ok_or_else(|| WorkflowError::not_found("visit", id))?;
                    return Err(WorkflowError::validation(format!(
                        "visit {} cannot move from {} to {}",
                        id, current.status, next
                    )));
                }
            }

            if let Some(steps) = &patch.route_sheet {
                tx.execute(
                    "UPDATE visits SET route_sheet = ?1, updated_at = ?2 WHERE id = ?3",
                    params![serde_json::to_string(steps)?, now, id],
                )?;
            }
            if let Some(notes) = &patch.notes {
                tx.execute(
                    "UPDATE visits SET notes = ?1, updated_at = ?2 WHERE id = ?3",
                    params![notes, now, id],
                )?;
            }
            if let Some(documents) = &patch.documents_issued {
                tx.execute(
                    "UPDATE visits SET documents_issued = ?1, updated_at = ?2 WHERE id = ?3",
                    params![json_text(documents)?, now, id],
                )?;
            }

            let stored = fetch(&tx, id)?.ok_or_else(|| WorkflowError::not_found("visit", id))?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    /// Mark route-sheet steps matching any of `specialties` as completed on
    /// the patient's most recently updated open visit.
    ///
    /// The visit is looked up by `employee_id = patient_uid`, falling back to
    /// `iin`. Returns `None` when the patient has no open visit.
    pub async fn reconcile_route_sheet(
        &self,
        patient_uid: &str,
        iin: &str,
        specialties: Vec<String>,
    ) -> Result<Option<Reconciliation>> {
        let keys: Vec<String> = [patient_uid.trim(), iin.trim()]
            .into_iter()
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();

        self.call(Budget::Write, "reconcile_route_sheet", move |conn| {
            let mut found = (None, 0);
            for key in &keys {
                found = latest_open_visit(conn, key)?;
                if found.0.is_some() {
                    break;
                }
            }
            let (Some(visit_id), open_visits) = found else {
                return Ok(None);
            };

            let tx = conn.transaction()?;
            let before = fetch(&tx, visit_id)?.ok_or_else(|| WorkflowError::not_found("visit", visit_id))?;
            let newly_completed: Vec<String> = before
                .route_sheet
                .iter()
                .filter(|step| {
                    !step.is_completed() && specialty::matches_any(&step.specialty, specialties.as_slice())
                })
                .map(|step| step.specialty.clone())
                .collect();

            let labels = serde_json::to_string(&specialties)?;
            let changed = tx.execute(RECONCILE_SQL, params![labels, now_rfc3339(), visit_id])?;
            let visit = fetch(&tx, visit_id)?.ok_or_else(|| WorkflowError::not_found("visit", visit_id))?;
            tx.commit()?;

            Ok(Some(Reconciliation {
                visit,
                newly_completed,
                matched: changed > 0,
                open_visits,
            }))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::StoreTimeouts;
    use crate::schema::StepStatus;
    use serde_json::json;

    fn store() -> WorkflowStore {
        WorkflowStore::open_in_memory(StoreTimeouts::default()).unwrap()
    }

    fn new_visit(employee_id: &str, steps: &[&str]) -> NewVisit {
        NewVisit {
            employee_id: employee_id.into(),
            clinic_id: "c-1".into(),
            route_sheet: steps.iter().map(|s| RouteStep::pending(*s)).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_insert_defaults() {
        let store = store();
        let visit = store.insert_visit(new_visit("emp-1", &["ЛОР"])).await.unwrap();
        assert_eq!(visit.status, VisitStatus::Registered);
        assert_eq!(visit.visit_date, today());
        assert!(visit.check_in_time.is_some());
        assert_eq!(visit.contract_id, None);
        assert_eq!(visit.documents_issued, json!([]));
    }

    #[tokio::test]
    async fn test_unknown_contract_is_validation_error() {
        let store = store();
        let mut visit = new_visit("emp-1", &[]);
        visit.contract_id = Some(42);
        assert_eq!(store.insert_visit(visit).await.unwrap_err().kind(), "validation");

        let mut self_pay = new_visit("emp-1", &[]);
        self_pay.contract_id = Some(0);
        assert!(store.insert_visit(self_pay).await.is_ok());
    }

    #[tokio::test]
    async fn test_reconcile_marks_step_and_advances() {
        let store = store();
        store
            .insert_visit(new_visit("emp-1", &["Кардиолог", "Невролог"]))
            .await
            .unwrap();

        let outcome = store
            .reconcile_route_sheet("emp-1", "", vec!["врач-кардиолог".into()])
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.matched);
        assert_eq!(outcome.newly_completed, vec!["Кардиолог".to_string()]);

        let visit = outcome.visit;
        assert_eq!(visit.status, VisitStatus::InProgress);
        assert_eq!(visit.route_sheet[0].status, StepStatus::Completed);
        assert!(visit.route_sheet[0].completed_at.is_some());
        assert_eq!(visit.route_sheet[1].status, StepStatus::Pending);
        assert!(visit.route_sheet[1].completed_at.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let store = store();
        store.insert_visit(new_visit("emp-1", &["Кардиолог"])).await.unwrap();

        let first = store
            .reconcile_route_sheet("emp-1", "", vec!["Кардиолог".into()])
            .await
            .unwrap()
            .unwrap();
        let second = store
            .reconcile_route_sheet("emp-1", "", vec!["Кардиолог".into()])
            .await
            .unwrap()
            .unwrap();
        assert!(second.newly_completed.is_empty());
        assert_eq!(first.visit.route_sheet, second.visit.route_sheet);
        assert_eq!(second.visit.status, VisitStatus::InProgress);
    }

    #[tokio::test]
    async fn test_reconcile_without_match_leaves_visit() {
        let store = store();
        let created = store.insert_visit(new_visit("emp-1", &["Кардиолог"])).await.unwrap();
        let outcome = store
            .reconcile_route_sheet("emp-1", "", vec!["Хирург".into()])
            .await
            .unwrap()
            .unwrap();
        assert!(!outcome.matched);
        assert_eq!(outcome.visit, created);
    }

    #[tokio::test]
    async fn test_reconcile_falls_back_to_iin_and_skips_closed() {
        let store = store();
        let created = store
            .insert_visit(new_visit("900101300123", &["ЛОР"]))
            .await
            .unwrap();
        let outcome = store
            .reconcile_route_sheet("uid-unknown", "900101300123", vec!["ЛОР".into()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.visit.id, created.id);

        store
            .patch_visit(
                created.id,
                VisitPatch {
                    status: Some(VisitStatus::Cancelled),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let none = store
            .reconcile_route_sheet("900101300123", "", vec!["ЛОР".into()])
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_touches_only_latest_open_visit() {
        let store = store();
        let older = store.insert_visit(new_visit("emp-1", &["ЛОР"])).await.unwrap();
        let newer = store.insert_visit(new_visit("emp-1", &["ЛОР"])).await.unwrap();

        let outcome = store
            .reconcile_route_sheet("emp-1", "", vec!["ЛОР".into()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.open_visits, 2);
        assert_eq!(outcome.visit.id, newer.id);

        let untouched = store.get_visit(older.id).await.unwrap();
        assert_eq!(untouched.status, VisitStatus::Registered);
    }

    #[tokio::test]
    async fn test_status_patch_is_monotonic() {
        let store = store();
        let visit = store.insert_visit(new_visit("emp-1", &[])).await.unwrap();
        let patch = |status| VisitPatch {
            status: Some(status),
            ..Default::default()
        };

        let err = store
            .patch_visit(visit.id, patch(VisitStatus::Completed))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        store.patch_visit(visit.id, patch(VisitStatus::InProgress)).await.unwrap();
        let done = store.patch_visit(visit.id, patch(VisitStatus::Completed)).await.unwrap();
        assert!(done.check_out_time.is_some());

        for next in [VisitStatus::Registered, VisitStatus::InProgress, VisitStatus::Cancelled] {
            let err = store.patch_visit(visit.id, patch(next)).await.unwrap_err();
            assert_eq!(err.kind(), "validation", "completed -> {}", next);
        }
        assert_eq!(
            store.patch_visit(999, patch(VisitStatus::InProgress)).await.unwrap_err().kind(),
            "not_found"
        );
    }

    #[tokio::test]
    async fn test_list_filters_by_specialty_label() {
        let store = store();
        store.insert_visit(new_visit("emp-1", &["Кардиолог"])).await.unwrap();
        store.insert_visit(new_visit("emp-2", &["Невролог"])).await.unwrap();

        let by_doctor = store
            .list_visits(VisitFilter {
                doctor_id: Some("врач-кардиолог".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_doctor.len(), 1);
        assert_eq!(by_doctor[0].employee_id, "emp-1");

        let all = store.list_visits(VisitFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].employee_id, "emp-2");
    }
}
