use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use dicom_bridge::apply::MapOp;
use dicom_bridge::uid::{generate_uid as mint_uid, ResourceLevel};
use dicom_core::header::Header;
use dicom_object::InMemDicomObject;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::context::{resource_type_to_level, ServerContext};
use crate::index::{ChangeRecord, ContentType, ExportRecord, ResourceType, Statistics};
use crate::modify::ModificationPlan;

use super::archive::build_archive;
use super::error::ApiError;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn resource_kind(kind: &str) -> Result<ResourceType, ApiError> {
    match kind {
        "patients" => Ok(ResourceType::Patient),
        "studies" => Ok(ResourceType::Study),
        "series" => Ok(ResourceType::Series),
        "instances" => Ok(ResourceType::Instance),
        other => Err(ApiError(crate::error::CoreError::BadRequest(format!(
            "unknown resource kind '{other}'"
        )))),
    }
}

fn parse_tag_key(key: &str) -> Option<dicom_core::Tag> {
    if key.len() != 8 {
        return None;
    }
    let group = u16::from_str_radix(&key[0..4], 16).ok()?;
    let element = u16::from_str_radix(&key[4..8], 16).ok()?;
    Some(dicom_core::Tag(group, element))
}

// --- /system, /statistics, /tools/* ----------------------------------------

pub async fn system() -> impl IntoResponse {
    Json(json!({ "Version": VERSION, "Name": "orthanc_core" }))
}

pub async fn statistics(State(context): State<Arc<ServerContext>>) -> Result<Json<Statistics>, ApiError> {
    Ok(Json(context.statistics().await?))
}

pub async fn now() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Deserialize)]
pub struct GenerateUidParams {
    level: String,
}

pub async fn generate_uid(Query(params): Query<GenerateUidParams>) -> Result<String, ApiError> {
    let uid = match params.level.as_str() {
        "patient" => dicom_bridge::uid::generate_patient_id(),
        "study" => mint_uid(ResourceLevel::Study),
        "series" => mint_uid(ResourceLevel::Series),
        "instance" => mint_uid(ResourceLevel::Instance),
        other => {
            return Err(ApiError(crate::error::CoreError::BadRequest(format!(
                "unknown level '{other}'"
            ))))
        }
    };
    Ok(uid)
}

/// Scripting is an external collaborator this core never embeds; the
/// endpoint exists for API parity but has nothing to execute against.
pub async fn execute_script() -> Response {
    (StatusCode::NOT_IMPLEMENTED, "no embedded scripting engine is configured").into_response()
}

#[derive(Deserialize)]
pub struct CreateDicomRequest {
    #[serde(flatten)]
    tags: HashMap<String, String>,
}

pub async fn create_dicom(
    State(context): State<Arc<ServerContext>>,
    Json(request): Json<CreateDicomRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut object = InMemDicomObject::from_element_iter(Vec::new());
    let ops: Vec<MapOp> = request
        .tags
        .iter()
        .filter_map(|(key, value)| parse_tag_key(key).map(|tag| MapOp::Replace(tag, value.clone())))
        .collect();
    dicom_bridge::apply::apply(&mut object, &ops).map_err(crate::error::CoreError::from)?;

    for (tag, level) in [
        (dicom_dictionary_std::tags::STUDY_INSTANCE_UID, ResourceLevel::Study),
        (dicom_dictionary_std::tags::SERIES_INSTANCE_UID, ResourceLevel::Series),
        (dicom_dictionary_std::tags::SOP_INSTANCE_UID, ResourceLevel::Instance),
    ] {
        if object.element(tag).is_err() {
            dicom_bridge::apply::apply(&mut object, &[MapOp::Replace(tag, mint_uid(level))])
                .map_err(crate::error::CoreError::from)?;
        }
    }
    if object.element(dicom_dictionary_std::tags::SOP_CLASS_UID).is_err() {
        dicom_bridge::apply::apply(
            &mut object,
            &[MapOp::Replace(
                dicom_dictionary_std::tags::SOP_CLASS_UID,
                "1.2.840.10008.5.1.4.1.1.7".to_string(),
            )],
        )
        .map_err(crate::error::CoreError::from)?;
    }

    let sop_class = element_str(&object, dicom_dictionary_std::tags::SOP_CLASS_UID);
    let sop_instance = element_str(&object, dicom_dictionary_std::tags::SOP_INSTANCE_UID);
    let meta = dicom_object::FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class.as_deref().unwrap_or_default())
        .media_storage_sop_instance_uid(sop_instance.as_deref().unwrap_or_default())
        .transfer_syntax("1.2.840.10008.1.2.1")
        .build()
        .map_err(|e| crate::error::CoreError::BadFileFormat(e.to_string()))?;
    let file_object = object.with_exact_meta(meta);

    let outcome = context.store_instance(file_object, "orthanc_core").await?;
    let receipt = outcome.receipt();
    Ok(Json(json!({
        "ID": receipt.instance_id,
        "ParentPatient": receipt.patient_id,
        "ParentStudy": receipt.study_id,
        "ParentSeries": receipt.series_id,
    })))
}

fn element_str(object: &InMemDicomObject, tag: dicom_core::Tag) -> Option<String> {
    object.element(tag).ok().and_then(|e| e.to_str().ok()).map(|s| s.trim_end_matches('\0').to_string())
}

// --- /{kind}/{id} ------------------------------------------------------------

pub async fn get_resource(
    State(context): State<Arc<ServerContext>>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let resource_type = resource_kind(&kind)?;
    let record = context
        .index
        .get_resource_by_public_id(&id)
        .await
        .map_err(crate::error::CoreError::from)?
        .ok_or(ApiError(crate::error::CoreError::UnknownResource))?;
    if record.resource_type != resource_type {
        return Err(ApiError(crate::error::CoreError::UnknownResource));
    }
    let tags = context
        .index
        .get_main_dicom_tags(record.id)
        .await
        .map_err(crate::error::CoreError::from)?;
    let main_tags: HashMap<String, String> = tags.into_iter().collect();
    Ok(Json(json!({
        "ID": record.public_id,
        "Type": kind,
        "MainDicomTags": main_tags,
    })))
}

pub async fn delete_resource(
    State(context): State<Arc<ServerContext>>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let _ = resource_kind(&kind)?;
    let remaining = context.delete_resource(&id).await?;
    Ok(Json(json!({ "RemainingAncestor": remaining })))
}

pub async fn get_archive(
    State(context): State<Arc<ServerContext>>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let _ = resource_kind(&kind)?;
    let bytes = build_archive(&context, &id).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/zip")],
        bytes,
    )
        .into_response())
}

#[derive(Deserialize, Default)]
pub struct ModifyRequest {
    #[serde(default)]
    replace: HashMap<String, String>,
    #[serde(default)]
    remove: Vec<String>,
    #[serde(default)]
    keep: Vec<String>,
}

pub async fn modify_resource(
    State(context): State<Arc<ServerContext>>,
    Path((kind, id)): Path<(String, String)>,
    Json(request): Json<ModifyRequest>,
) -> Result<Response, ApiError> {
    let resource_type = resource_kind(&kind)?;
    let mut plan = ModificationPlan::new(resource_type_to_level(resource_type));
    for (key, value) in &request.replace {
        if let Some(tag) = parse_tag_key(key) {
            plan.replace.insert(tag, value.clone());
        }
    }
    for key in &request.remove {
        if let Some(tag) = parse_tag_key(key) {
            plan.remove.insert(tag);
        }
    }
    for key in &request.keep {
        if let Some(tag) = parse_tag_key(key) {
            plan.keep.insert(tag);
        }
    }

    let outcome = context.apply_modification(&id, plan, false, "orthanc_core").await?;
    Ok(modification_response(kind, outcome))
}

pub async fn anonymize_resource(
    State(context): State<Arc<ServerContext>>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let _ = resource_kind(&kind)?;
    let plan = ModificationPlan::anonymization_preset();
    let outcome = context.apply_modification(&id, plan, true, "orthanc_core").await?;
    Ok(modification_response(kind, outcome))
}

/// Instance-level requests never stored a new instance; Orthanc hands the
/// rewritten file straight back instead of a JSON resource description.
fn modification_response(kind: String, outcome: crate::context::ModificationOutcome) -> Response {
    match outcome.instance_bytes {
        Some(bytes) => ([(header::CONTENT_TYPE, "application/dicom")], bytes).into_response(),
        None => Json(json!({
            "ID": outcome.public_id,
            "PatientID": outcome.patient_id,
            "Path": outcome.path,
            "Type": kind,
        }))
        .into_response(),
    }
}

// --- /{kind}/{id}/attachments -------------------------------------------------

fn resolve_user_content_type(context: &ServerContext, name: &str) -> Result<u16, ApiError> {
    if let Some(code) = context.config.user_content_type.get(name) {
        return Ok(*code);
    }
    name.parse::<u16>()
        .map_err(|_| ApiError(crate::error::CoreError::BadRequest(format!("unknown attachment name '{name}'"))))
}

pub async fn put_attachment(
    State(context): State<Arc<ServerContext>>,
    Path((kind, id, name)): Path<(String, String, String)>,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let _ = resource_kind(&kind)?;
    let content_type = resolve_user_content_type(&context, &name)?;
    let attachment = context.put_user_attachment(&id, content_type, &body).await?;
    Ok(Json(json!({
        "Uuid": attachment.uuid.to_string(),
        "Path": format!("/{kind}/{id}/attachments/{name}"),
        "UncompressedSize": attachment.uncompressed_size,
        "UncompressedMD5": attachment.uncompressed_md5,
    })))
}

pub async fn get_attachment(
    State(context): State<Arc<ServerContext>>,
    Path((kind, id, name)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let _ = resource_kind(&kind)?;
    let content_type = resolve_user_content_type(&context, &name)?;
    let bytes = context.read_user_attachment(&id, content_type).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes).into_response())
}

pub async fn list_attachments(
    State(context): State<Arc<ServerContext>>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let _ = resource_kind(&kind)?;
    let types = context.list_attachments(&id).await?;
    let names: Vec<String> = types
        .into_iter()
        .filter_map(|ct| match ct {
            ContentType::UserDefined(code) => Some(
                context
                    .config
                    .user_content_type
                    .iter()
                    .find(|(_, v)| **v == code)
                    .map(|(k, _)| k.clone())
                    .unwrap_or_else(|| code.to_string()),
            ),
            _ => None,
        })
        .collect();
    Ok(Json(json!(names)))
}

// --- /{kind}/{id}/metadata ----------------------------------------------------

/// Resolve a metadata route segment to the string key used in storage.
/// Standard metadata (`RemoteAET`, `ReceptionDate`, ...) is addressed by
/// name directly; a purely numeric segment is looked up in `UserMetadata`
/// and mapped back to the name it was registered under.
fn resolve_metadata_name(context: &ServerContext, name: &str) -> String {
    if let Ok(code) = name.parse::<u16>() {
        if let Some((key, _)) = context.config.user_metadata.iter().find(|(_, v)| **v == code) {
            return key.clone();
        }
    }
    name.to_string()
}

pub async fn list_metadata(
    State(context): State<Arc<ServerContext>>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let _ = resource_kind(&kind)?;
    let names = context.list_metadata(&id).await?;
    Ok(Json(json!(names)))
}

pub async fn get_metadata(
    State(context): State<Arc<ServerContext>>,
    Path((kind, id, name)): Path<(String, String, String)>,
) -> Result<String, ApiError> {
    let _ = resource_kind(&kind)?;
    let metadata_type = resolve_metadata_name(&context, &name);
    context
        .get_metadata(&id, &metadata_type)
        .await?
        .ok_or_else(|| ApiError(crate::error::CoreError::UnknownResource))
}

pub async fn put_metadata(
    State(context): State<Arc<ServerContext>>,
    Path((kind, id, name)): Path<(String, String, String)>,
    body: String,
) -> Result<StatusCode, ApiError> {
    let _ = resource_kind(&kind)?;
    let metadata_type = resolve_metadata_name(&context, &name);
    context.set_metadata(&id, metadata_type, body).await?;
    Ok(StatusCode::OK)
}

pub async fn delete_metadata(
    State(context): State<Arc<ServerContext>>,
    Path((kind, id, name)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    let _ = resource_kind(&kind)?;
    let metadata_type = resolve_metadata_name(&context, &name);
    context.delete_metadata(&id, &metadata_type).await?;
    Ok(StatusCode::OK)
}

// --- /changes, /exports ------------------------------------------------------

#[derive(Deserialize, Default)]
pub struct ChangesParams {
    #[serde(default)]
    since: u64,
    limit: Option<usize>,
    #[serde(default)]
    last: bool,
}

#[derive(Serialize)]
pub struct ChangesResponse {
    changes: Vec<ChangeRecord>,
    done: bool,
}

pub async fn get_changes(
    State(context): State<Arc<ServerContext>>,
    Query(params): Query<ChangesParams>,
) -> Result<Json<ChangesResponse>, ApiError> {
    let changes = if params.last {
        context.get_last_change().await?.into_iter().collect()
    } else {
        context.get_changes(params.since, params.limit).await?
    };
    let done = changes.len() < params.limit.unwrap_or(100);
    Ok(Json(ChangesResponse { changes, done }))
}

pub async fn clear_changes(State(context): State<Arc<ServerContext>>) -> Result<StatusCode, ApiError> {
    context.clear_changes().await?;
    Ok(StatusCode::OK)
}

#[derive(Serialize)]
pub struct ExportsResponse {
    exports: Vec<ExportRecord>,
}

pub async fn get_exports(
    State(context): State<Arc<ServerContext>>,
    Query(params): Query<ChangesParams>,
) -> Result<Json<ExportsResponse>, ApiError> {
    let exports = context.get_exports(params.since, params.limit).await?;
    Ok(Json(ExportsResponse { exports }))
}

pub async fn clear_exports(State(context): State<Arc<ServerContext>>) -> Result<StatusCode, ApiError> {
    context.clear_exports().await?;
    Ok(StatusCode::OK)
}
