//! `/data/*` handlers: rule-gated reads and writes against the tree.
//!
//! `PATCH` is treated as a write to every child it names, so each child path is
//! checked on its own; an empty patch is checked at the target path. Every key in a
//! written body must be a valid single segment before any rule is consulted.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{request_context, AppState};
use crate::error::{AppError, AppResult};
use crate::identity::RequestContext;
use crate::paths::{join_path, parse_data_path, validate_key, validate_value_keys};
use crate::rules::{DataContext, Operation};

fn segments(raw: &str) -> AppResult<Vec<String>> {
    parse_data_path(raw).map_err(|e| AppError::user("invalid_path".to_string(), e.to_string()))
}

fn check_body(value: &Value) -> AppResult<()> {
    validate_value_keys(value).map_err(|e| AppError::user("invalid_path".to_string(), format!("{:#}", e)))
}

fn authorize(state: &AppState, ctx: &RequestContext, path: &[String], op: Operation, data: &DataContext<'_>) -> AppResult<()> {
    if ctx.auth.is_admin() {
        return Ok(());
    }
    let decision = state.rules.evaluate_segments(path, op, &ctx.auth, data);
    if decision.allow {
        Ok(())
    } else {
        debug!(target: "http", op = %op, path = %join_path(path), uid = ?ctx.auth.uid, request_id = ?ctx.request_id, rule = %decision.rule_path, "denied");
        Err(AppError::access_denied())
    }
}

async fn read(state: AppState, headers: HeaderMap, raw: &str) -> AppResult<Json<Value>> {
    let ctx = request_context(&state, &headers, None)?;
    let path = segments(raw)?;
    let value = state.tree.get_segments(&path);
    authorize(&state, &ctx, &path, Operation::Read, &DataContext { data: Some(&value), ..DataContext::read(&state.tree) })?;
    Ok(Json(json!({"status": "ok", "path": join_path(&path), "exists": !value.is_null(), "value": value})))
}

async fn write(state: AppState, headers: HeaderMap, raw: &str, value: Value) -> AppResult<Json<Value>> {
    let ctx = request_context(&state, &headers, None)?;
    let path = segments(raw)?;
    check_body(&value)?;
    let current = state.tree.get_segments(&path);
    authorize(&state, &ctx, &path, Operation::Write, &DataContext::write(&state.tree, &current, &value))?;
    let event = state.tree.set(&join_path(&path), value, ctx.auth.context.clone())?;
    debug!(target: "http", seq = event.seq, path = %event.path, request_id = ?ctx.request_id, "set");
    Ok(Json(json!({"status": "ok", "path": event.path, "seq": event.seq})))
}

async fn patch(state: AppState, headers: HeaderMap, raw: &str, children: Map<String, Value>) -> AppResult<Json<Value>> {
    let ctx = request_context(&state, &headers, None)?;
    let path = segments(raw)?;
    for (key, child) in &children {
        validate_key(key).map_err(|e| AppError::user("invalid_path".to_string(), format!("'{}': {}", key, e)))?;
        check_body(child)?;
    }
    if children.is_empty() {
        let current = state.tree.get_segments(&path);
        authorize(&state, &ctx, &path, Operation::Write, &DataContext::write(&state.tree, &current, &current))?;
    }
    for (key, new_child) in &children {
        let mut child_path = path.clone();
        child_path.push(key.clone());
        let current = state.tree.get_segments(&child_path);
        authorize(&state, &ctx, &child_path, Operation::Write, &DataContext::write(&state.tree, &current, new_child))?;
    }
    let event = state.tree.update(&join_path(&path), children, ctx.auth.context.clone())?;
    debug!(target: "http", seq = event.seq, path = %event.path, request_id = ?ctx.request_id, "update");
    Ok(Json(json!({"status": "ok", "path": event.path, "seq": event.seq})))
}

async fn delete(state: AppState, headers: HeaderMap, raw: &str) -> AppResult<Json<Value>> {
    let ctx = request_context(&state, &headers, None)?;
    let path = segments(raw)?;
    let current = state.tree.get_segments(&path);
    authorize(&state, &ctx, &path, Operation::Write, &DataContext::write(&state.tree, &current, &Value::Null))?;
    let event = state.tree.remove(&join_path(&path), ctx.auth.context.clone())?;
    debug!(target: "http", seq = event.seq, path = %event.path, request_id = ?ctx.request_id, "remove");
    Ok(Json(json!({"status": "ok", "path": event.path, "seq": event.seq})))
}

fn object_body(body: Value) -> AppResult<Map<String, Value>> {
    match body {
        Value::Object(m) => Ok(m),
        _ => Err(AppError::user("invalid_body", "PATCH body must be a JSON object")),
    }
}

pub async fn get_value(State(state): State<AppState>, Path(path): Path<String>, headers: HeaderMap) -> impl IntoResponse {
    read(state, headers, &path).await
}

pub async fn put_value(State(state): State<AppState>, Path(path): Path<String>, headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    write(state, headers, &path, body).await
}

pub async fn patch_value(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Json<Value>> {
    patch(state, headers, &path, object_body(body)?).await
}

pub async fn delete_value(State(state): State<AppState>, Path(path): Path<String>, headers: HeaderMap) -> impl IntoResponse {
    delete(state, headers, &path).await
}

pub async fn get_root(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse { read(state, headers, "/").await }

pub async fn put_root(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    write(state, headers, "/", body).await
}

pub async fn patch_root(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> AppResult<Json<Value>> {
    patch(state, headers, "/", object_body(body)?).await
}

pub async fn delete_root(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse { delete(state, headers, "/").await }
