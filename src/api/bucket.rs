use std::collections::HashMap;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
};

use super::{empty_response, multipart, xml_response};
use crate::error::S3Error;
use crate::server::AppState;
use crate::xml::{
    response::to_xml,
    types::{
        rfc3339, BucketEntry, Buckets, CommonPrefixEntry, ListAllMyBucketsResult,
        ListBucketResult, ObjectEntry, Principal,
    },
};

const DEFAULT_MAX_KEYS: usize = 1000;

pub async fn list_buckets(State(state): State<AppState>) -> Result<Response<Body>, S3Error> {
    let buckets = state.storage.list_buckets().await?;
    let xml = to_xml(&ListAllMyBucketsResult {
        owner: Principal::server(),
        buckets: Buckets {
            buckets: buckets
                .into_iter()
                .map(|b| BucketEntry {
                    name: b.name,
                    creation_date: rfc3339(&b.created),
                })
                .collect(),
        },
    })
    .map_err(S3Error::internal)?;
    Ok(xml_response(StatusCode::OK, xml))
}

pub async fn create_bucket(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
) -> Result<Response<Body>, S3Error> {
    state.storage.create_bucket(&bucket).await?;
    Ok(empty_response(StatusCode::OK))
}

pub async fn delete_bucket(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
) -> Result<Response<Body>, S3Error> {
    // A completed upload would silently recreate the bucket directory, so
    // refuse deletion while any multipart upload still targets it.
    if !state.uploads.list_uploads(&bucket).await.is_empty() {
        return Err(S3Error::bucket_not_empty(&bucket));
    }
    state.storage.delete_bucket(&bucket).await?;
    Ok(empty_response(StatusCode::NO_CONTENT))
}

pub async fn head_bucket(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
) -> Result<Response<Body>, S3Error> {
    if state.storage.head_bucket(&bucket).await? {
        Ok(empty_response(StatusCode::OK))
    } else {
        Err(S3Error::no_such_bucket(&bucket))
    }
}

pub async fn get_bucket(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response<Body>, S3Error> {
    if params.contains_key("uploads") {
        return multipart::list_multipart_uploads(State(state), Path(bucket)).await;
    }
    list_objects(state, bucket, params).await
}

async fn list_objects(
    state: AppState,
    bucket: String,
    params: HashMap<String, String>,
) -> Result<Response<Body>, S3Error> {
    let prefix = params.get("prefix").cloned().unwrap_or_default();
    let delimiter = params.get("delimiter").cloned().unwrap_or_default();
    let max_keys = params
        .get("max-keys")
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_MAX_KEYS);

    let list = state
        .storage
        .list_objects(&bucket, &prefix, &delimiter, max_keys)
        .await?;

    let xml = to_xml(&ListBucketResult {
        name: bucket,
        prefix,
        delimiter,
        max_keys,
        is_truncated: false,
        contents: list
            .objects
            .into_iter()
            .map(|obj| ObjectEntry {
                key: obj.key,
                last_modified: rfc3339(&obj.last_modified),
                etag: obj.etag,
                size: obj.size,
                storage_class: "STANDARD".into(),
            })
            .collect(),
        common_prefixes: list
            .common_prefixes
            .into_iter()
            .map(|prefix| CommonPrefixEntry { prefix })
            .collect(),
    })
    .map_err(S3Error::internal)?;

    Ok(xml_response(StatusCode::OK, xml))
}
