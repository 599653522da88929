use std::collections::HashMap;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};

use super::object::{body_to_reader, require_content_length};
use super::{empty_response, xml_response};
use crate::error::S3Error;
use crate::server::AppState;
use crate::storage::multipart::{MAX_PART_NUMBER, MIN_PART_NUMBER};
use crate::xml::{
    response::to_xml,
    types::{
        rfc3339, CompleteMultipartUploadResult, InitiateMultipartUploadResult,
        ListMultipartUploadsResult, ListPartsResult, PartEntry, Principal, UploadEntry,
    },
};

const COMPLETE_BODY_MAX: usize = 1024 * 1024;

pub async fn create_multipart_upload(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    _headers: HeaderMap,
) -> Result<Response<Body>, S3Error> {
    ensure_bucket_exists(&state, &bucket).await?;

    let upload_id = state.uploads.initiate(&bucket, &key).await?;
    let xml = to_xml(&InitiateMultipartUploadResult {
        bucket,
        key,
        upload_id,
    })
    .map_err(S3Error::internal)?;

    Ok(xml_response(StatusCode::OK, xml))
}

pub async fn upload_part(
    State(state): State<AppState>,
    Path((_bucket, _key)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response<Body>, S3Error> {
    let upload_id = require_upload_id(&params)?;
    let part_number = params
        .get("partNumber")
        .ok_or_else(|| S3Error::invalid_argument("partNumber is required"))?
        .parse::<u32>()
        .ok()
        .filter(|n| (MIN_PART_NUMBER..=MAX_PART_NUMBER).contains(n))
        .ok_or_else(|| {
            S3Error::invalid_argument(&format!(
                "part number must be an integer between {} and {}",
                MIN_PART_NUMBER, MAX_PART_NUMBER
            ))
        })?;
    require_content_length(&headers)?;

    let reader = body_to_reader(&headers, body).await?;
    let etag = state
        .uploads
        .upload_part(upload_id, part_number, reader)
        .await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("ETag", &etag)
        .body(Body::empty())
        .unwrap())
}

pub async fn complete_multipart_upload(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    body: Body,
) -> Result<Response<Body>, S3Error> {
    let upload_id = require_upload_id(&params)?;

    let bytes = axum::body::to_bytes(body, COMPLETE_BODY_MAX)
        .await
        .map_err(S3Error::internal)?;
    let manifest = parse_complete_parts(&String::from_utf8_lossy(&bytes))?;
    if manifest.is_empty() {
        return Err(S3Error::malformed_xml());
    }

    let completed = state.uploads.complete(upload_id, &manifest).await?;

    let xml = to_xml(&CompleteMultipartUploadResult {
        location: format!("/{}/{}", bucket, key),
        bucket,
        key,
        etag: completed.etag,
    })
    .map_err(S3Error::internal)?;

    Ok(xml_response(StatusCode::OK, xml))
}

pub async fn abort_multipart_upload(
    State(state): State<AppState>,
    Path((_bucket, _key)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response<Body>, S3Error> {
    let upload_id = require_upload_id(&params)?;
    state.uploads.abort(upload_id).await?;
    Ok(empty_response(StatusCode::NO_CONTENT))
}

pub async fn list_parts(
    State(state): State<AppState>,
    Path((bucket, _key)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response<Body>, S3Error> {
    let upload_id = require_upload_id(&params)?;
    let (upload, parts) = state.uploads.list_parts(upload_id).await?;

    let xml = to_xml(&ListPartsResult {
        bucket,
        key: upload.key,
        upload_id: upload.upload_id,
        initiator: Principal::server(),
        owner: Principal::server(),
        storage_class: "STANDARD".into(),
        part_number_marker: 0,
        next_part_number_marker: 0,
        max_parts: 1000,
        is_truncated: false,
        parts: parts
            .into_iter()
            .map(|p| PartEntry {
                part_number: p.part_number,
                last_modified: rfc3339(&p.last_modified),
                etag: p.etag,
                size: p.size,
            })
            .collect(),
    })
    .map_err(S3Error::internal)?;

    Ok(xml_response(StatusCode::OK, xml))
}

pub async fn list_multipart_uploads(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
) -> Result<Response<Body>, S3Error> {
    ensure_bucket_exists(&state, &bucket).await?;

    let uploads = state.uploads.list_uploads(&bucket).await;
    let xml = to_xml(&ListMultipartUploadsResult {
        bucket,
        key_marker: String::new(),
        upload_id_marker: String::new(),
        next_key_marker: String::new(),
        next_upload_id_marker: String::new(),
        max_uploads: 1000,
        is_truncated: false,
        uploads: uploads
            .into_iter()
            .map(|u| UploadEntry {
                key: u.key,
                upload_id: u.upload_id,
                initiator: Principal::server(),
                owner: Principal::server(),
                storage_class: "STANDARD".into(),
                initiated: rfc3339(&u.initiated),
            })
            .collect(),
    })
    .map_err(S3Error::internal)?;

    Ok(xml_response(StatusCode::OK, xml))
}

async fn ensure_bucket_exists(state: &AppState, bucket: &str) -> Result<(), S3Error> {
    if state.storage.head_bucket(bucket).await? {
        Ok(())
    } else {
        Err(S3Error::no_such_bucket(bucket))
    }
}

fn require_upload_id(params: &HashMap<String, String>) -> Result<&str, S3Error> {
    params
        .get("uploadId")
        .map(String::as_str)
        .ok_or_else(|| S3Error::invalid_argument("missing uploadId"))
}

/// Parse a `<CompleteMultipartUpload>` body into `(part_number, etag)`
/// pairs. ETags are normalized to their quoted form so they compare equal
/// to what upload_part returned.
fn parse_complete_parts(xml: &str) -> Result<Vec<(u32, String)>, S3Error> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut parts = Vec::new();
    let mut in_part = false;
    let mut in_part_number = false;
    let mut in_etag = false;
    let mut part_number: Option<u32> = None;
    let mut etag: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(quick_xml::events::Event::Start(e)) => match e.name().as_ref() {
                b"Part" => {
                    in_part = true;
                    part_number = None;
                    etag = None;
                }
                b"PartNumber" if in_part => in_part_number = true,
                b"ETag" if in_part => in_etag = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(e)) => {
                if in_part_number {
                    let value = e.unescape().map_err(|_| S3Error::malformed_xml())?;
                    part_number = Some(value.parse::<u32>().map_err(|_| {
                        S3Error::invalid_argument("part number must be an integer")
                    })?);
                    in_part_number = false;
                } else if in_etag {
                    let value = e
                        .unescape()
                        .map_err(|_| S3Error::malformed_xml())?
                        .into_owned();
                    let normalized = if value.starts_with('"') && value.ends_with('"') {
                        value
                    } else {
                        format!("\"{}\"", value)
                    };
                    etag = Some(normalized);
                    in_etag = false;
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.name().as_ref() {
                b"PartNumber" => in_part_number = false,
                b"ETag" => in_etag = false,
                b"Part" => {
                    let number = part_number.ok_or_else(S3Error::malformed_xml)?;
                    let tag = etag.clone().ok_or_else(S3Error::malformed_xml)?;
                    parts.push((number, tag));
                    in_part = false;
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(_) => return Err(S3Error::malformed_xml()),
            _ => {}
        }
    }

    Ok(parts)
}
