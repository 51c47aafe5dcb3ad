//! REST surface
//!
//! A declarative axum route table over the orchestrator. Handlers read raw
//! bodies and decode them with serde_json so malformed input maps onto the
//! same `validation` error kind as missing fields. Path ids are extracted as
//! strings and parsed here for the same reason.
//!
//! Every error renders as `{"kind": "<kind>", "error": "<message>"}`.
//!
//! All routes answer cross-origin requests from any origin, so the browser
//! frontend can be served from a different host.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::error::{Result, WorkflowError};
use crate::schema::{Contract, Doctor, Identity, IdentityKey, NewVisit, RecordUpsert, RouteSheetInput};
use crate::store::VisitFilter;
use crate::workflow::Orchestrator;

type ApiResult<T> = Result<T>;

impl IntoResponse for WorkflowError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        let body = json!({ "kind": self.kind(), "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Build the REST router
pub fn router(orchestrator: Orchestrator) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/identities", get(find_identity).post(upsert_identity))
        .route("/api/contracts", get(list_contracts).post(create_contract))
        .route(
            "/api/contracts/:id",
            get(get_contract).patch(patch_contract).delete(delete_contract),
        )
        .route(
            "/api/clinics/:clinic_id/doctors",
            get(list_doctors).post(create_doctor),
        )
        .route(
            "/api/clinics/:clinic_id/doctors/:id",
            get(get_doctor).put(update_doctor).delete(delete_doctor),
        )
        .route(
            "/api/clinics/:clinic_id/doctors/:id/route-sheets",
            get(list_doctor_route_sheets),
        )
        .route(
            "/api/clinics/:clinic_id/doctors/:id/route-sheets/:contract_id",
            put(put_doctor_route_sheet),
        )
        .route("/api/visits", get(list_visits).post(create_visit))
        .route("/api/visits/:id", get(get_visit).patch(patch_visit))
        .route(
            "/api/ambulatory-records",
            get(get_record).post(upsert_record),
        )
        .layer(cors)
        .with_state(orchestrator)
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| WorkflowError::validation(format!("invalid json: {}", e)))
}

fn parse_object(body: &Bytes) -> Result<Map<String, Value>> {
    match parse_body::<Value>(body)? {
        Value::Object(map) => Ok(map),
        _ => Err(WorkflowError::validation("request body must be a JSON object")),
    }
}

fn parse_id(raw: &str, field: &str) -> Result<i64> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| WorkflowError::validation(format!("invalid {}: {}", field, raw)))
}

fn ok_status() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn health() -> Json<Value> {
    ok_status()
}

// ============================================================================
// Identities
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct IdentityLookup {
    by: Option<String>,
    value: Option<String>,
}

async fn find_identity(
    State(orchestrator): State<Orchestrator>,
    Query(query): Query<IdentityLookup>,
) -> ApiResult<Json<Value>> {
    let key = match query.by.as_deref() {
        Some("phone") => IdentityKey::Phone,
        Some("bin") => IdentityKey::Bin,
        Some("id") | Some("uid") => IdentityKey::Id,
        Some(other) => {
            return Err(WorkflowError::validation(format!(
                "by must be phone, bin or id, got {}",
                other
            )))
        }
        None => return Err(WorkflowError::validation("by is required")),
    };
    let value = query.value.unwrap_or_default();
    let identity = orchestrator.find_identity(key, &value).await?;
    Ok(Json(json!({ "identity": identity })))
}

async fn upsert_identity(
    State(orchestrator): State<Orchestrator>,
    body: Bytes,
) -> ApiResult<Json<Identity>> {
    let identity: Identity = parse_body(&body)?;
    Ok(Json(orchestrator.upsert_identity(identity).await?))
}

// ============================================================================
// Contracts
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct BinQuery {
    bin: Option<String>,
}

async fn list_contracts(
    State(orchestrator): State<Orchestrator>,
    Query(query): Query<BinQuery>,
) -> ApiResult<Json<Vec<Contract>>> {
    let bin = query.bin.unwrap_or_default();
    Ok(Json(orchestrator.list_contracts(&bin).await?))
}

async fn create_contract(
    State(orchestrator): State<Orchestrator>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Contract>)> {
    let contract: Contract = parse_body(&body)?;
    let created = orchestrator.create_contract(contract).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_contract(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<String>,
) -> ApiResult<Json<Contract>> {
    let id = parse_id(&id, "contract id")?;
    Ok(Json(orchestrator.get_contract(id).await?))
}

async fn patch_contract(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Contract>> {
    let id = parse_id(&id, "contract id")?;
    let patch = parse_object(&body)?;
    Ok(Json(orchestrator.patch_contract(id, patch).await?))
}

async fn delete_contract(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id, "contract id")?;
    orchestrator.delete_contract(id).await?;
    Ok(ok_status())
}

// ============================================================================
// Doctors
// ============================================================================

async fn list_doctors(
    State(orchestrator): State<Orchestrator>,
    Path(clinic_id): Path<String>,
) -> ApiResult<Json<Vec<Doctor>>> {
    Ok(Json(orchestrator.list_doctors(&clinic_id).await?))
}

async fn create_doctor(
    State(orchestrator): State<Orchestrator>,
    Path(clinic_id): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Doctor>)> {
    let doctor: Doctor = parse_body(&body)?;
    let created = orchestrator.create_doctor(&clinic_id, doctor).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_doctor(
    State(orchestrator): State<Orchestrator>,
    Path((clinic_id, id)): Path<(String, String)>,
) -> ApiResult<Json<Doctor>> {
    let id = parse_id(&id, "doctor id")?;
    Ok(Json(orchestrator.get_doctor(&clinic_id, id).await?))
}

async fn update_doctor(
    State(orchestrator): State<Orchestrator>,
    Path((clinic_id, id)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Json<Doctor>> {
    let id = parse_id(&id, "doctor id")?;
    let doctor: Doctor = parse_body(&body)?;
    Ok(Json(orchestrator.update_doctor(&clinic_id, id, doctor).await?))
}

async fn delete_doctor(
    State(orchestrator): State<Orchestrator>,
    Path((clinic_id, id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id, "doctor id")?;
    orchestrator.delete_doctor(&clinic_id, id).await?;
    Ok(ok_status())
}

async fn list_doctor_route_sheets(
    State(orchestrator): State<Orchestrator>,
    Path((clinic_id, id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id, "doctor id")?;
    let sheets = orchestrator.list_doctor_route_sheets(&clinic_id, id).await?;
    Ok(Json(json!(sheets)))
}

async fn put_doctor_route_sheet(
    State(orchestrator): State<Orchestrator>,
    Path((clinic_id, id, contract_id)): Path<(String, String, String)>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id, "doctor id")?;
    let contract_id = parse_id(&contract_id, "contract id")?;
    let input: RouteSheetInput = parse_body(&body)?;
    let sheet = orchestrator
        .put_doctor_route_sheet(&clinic_id, id, contract_id, input)
        .await?;
    Ok(Json(json!(sheet)))
}

// ============================================================================
// Visits
// ============================================================================

async fn list_visits(
    State(orchestrator): State<Orchestrator>,
    Query(filter): Query<VisitFilter>,
) -> ApiResult<Json<Value>> {
    let visits = orchestrator.list_visits(filter).await?;
    Ok(Json(json!(visits)))
}

async fn create_visit(
    State(orchestrator): State<Orchestrator>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let visit: NewVisit = parse_body(&body)?;
    let created = orchestrator.create_visit(visit).await?;
    Ok((StatusCode::CREATED, Json(json!(created))))
}

async fn get_visit(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id, "visit id")?;
    Ok(Json(json!(orchestrator.get_visit(id).await?)))
}

async fn patch_visit(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id, "visit id")?;
    let patch = parse_object(&body)?;
    Ok(Json(json!(orchestrator.patch_visit(id, patch).await?)))
}

// ============================================================================
// Ambulatory records
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordLookup {
    patient_uid: Option<String>,
    iin: Option<String>,
}

async fn get_record(
    State(orchestrator): State<Orchestrator>,
    Query(query): Query<RecordLookup>,
) -> ApiResult<Json<Value>> {
    let record = orchestrator.get_record(query.patient_uid, query.iin).await?;
    Ok(Json(json!(record)))
}

async fn upsert_record(
    State(orchestrator): State<Orchestrator>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let upsert: RecordUpsert = parse_body(&body)?;
    Ok(Json(json!(orchestrator.upsert_record(upsert).await?)))
}
