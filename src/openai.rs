//! OpenAI-compatible request helpers: peeking the `model` field out of a
//! JSON body without consuming it, and synthesizing `/v1/models` from the
//! registry.
//!
//! Small single-purpose extraction helpers in the style of `proxy.rs`'s
//! own hostname extraction, applied here to a JSON body field instead of
//! a `Host` header.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::Request;
use serde::Serialize;

use crate::instance::InstanceSnapshot;

/// Reads the whole request body into memory and returns it alongside a
/// request with the same headers/method/uri but a replayable body, so the
/// caller can inspect the JSON before forwarding the original bytes
/// upstream unchanged.
pub async fn buffer_body(
    req: Request<Incoming>,
) -> Result<(Request<BoxBody<Bytes, hyper::Error>>, Bytes), hyper::Error> {
    let (parts, body) = req.into_parts();
    let collected = body.collect().await?;
    let bytes = collected.to_bytes();
    let replay = Request::from_parts(parts, full_body(bytes.clone()));
    Ok((replay, bytes))
}

pub fn full_body(bytes: Bytes) -> BoxBody<Bytes, hyper::Error> {
    Full::new(bytes).map_err(|e| match e {}).boxed()
}

/// Extracts the `model` field from a JSON request body, per the OpenAI
/// request shape. Returns `None` if the body isn't a JSON object or has no
/// string `model` field.
pub fn extract_model(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("model")?.as_str().map(str::to_string)
}

#[derive(Serialize)]
struct ModelListEntry {
    id: String,
    object: &'static str,
    created: i64,
    owned_by: &'static str,
}

#[derive(Serialize)]
struct ModelList {
    object: &'static str,
    data: Vec<ModelListEntry>,
}

/// Builds the `/v1/models` response body from the current instance
/// registry: one entry per instance, named after the instance.
pub fn models_list_json(instances: &[InstanceSnapshot]) -> String {
    let data = instances
        .iter()
        .map(|snap| ModelListEntry {
            id: snap.name.clone(),
            object: "model",
            created: snap.created_at,
            owned_by: "llamactl",
        })
        .collect();
    let list = ModelList {
        object: "list",
        data,
    };
    serde_json::to_string(&list).unwrap_or_else(|_| r#"{"object":"list","data":[]}"#.to_string())
}
