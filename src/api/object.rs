use std::collections::HashMap;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};
use tokio_util::io::ReaderStream;

use super::{empty_response, multipart};
use crate::error::S3Error;
use crate::server::AppState;
use crate::storage::ByteStream;

pub async fn put_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response<Body>, S3Error> {
    if params.contains_key("uploadId") {
        return multipart::upload_part(State(state), Path((bucket, key)), Query(params), headers, body)
            .await;
    }

    let declared_len = require_content_length(&headers)?;
    let reader = body_to_reader(&headers, body).await?;
    let result = state
        .storage
        .put_object(&bucket, &key, reader, declared_len)
        .await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("ETag", &result.etag)
        .body(Body::empty())
        .unwrap())
}

pub async fn get_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response<Body>, S3Error> {
    if params.contains_key("uploadId") {
        return multipart::list_parts(State(state), Path((bucket, key)), Query(params)).await;
    }

    let (reader, info) = state.storage.get_object(&bucket, &key).await?;
    let stream = ReaderStream::new(reader);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/octet-stream")
        .header("Content-Length", info.size.to_string())
        .header("ETag", &info.etag)
        .header("Last-Modified", to_http_date(&info.last_modified))
        .body(Body::from_stream(stream))
        .unwrap())
}

pub async fn head_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response<Body>, S3Error> {
    let info = state.storage.head_object(&bucket, &key).await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/octet-stream")
        .header("Content-Length", info.size.to_string())
        .header("ETag", &info.etag)
        .header("Last-Modified", to_http_date(&info.last_modified))
        .body(Body::empty())
        .unwrap())
}

pub async fn delete_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response<Body>, S3Error> {
    if params.contains_key("uploadId") {
        return multipart::abort_multipart_upload(State(state), Path((bucket, key)), Query(params))
            .await;
    }

    state.storage.delete_object(&bucket, &key).await?;
    Ok(empty_response(StatusCode::NO_CONTENT))
}

pub async fn post_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response<Body>, S3Error> {
    if params.contains_key("uploads") {
        return multipart::create_multipart_upload(State(state), Path((bucket, key)), headers).await;
    }
    if params.contains_key("uploadId") {
        return multipart::complete_multipart_upload(
            State(state),
            Path((bucket, key)),
            Query(params),
            body,
        )
        .await;
    }
    Err(S3Error::method_not_allowed())
}

/// Convert a timestamp to the RFC 7231 HTTP-date used by Last-Modified.
pub(crate) fn to_http_date(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub(crate) fn require_content_length(headers: &HeaderMap) -> Result<u64, S3Error> {
    headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(S3Error::missing_content_length)
}

/// Turn the request body into an AsyncRead, decoding AWS chunked transfer
/// framing when the client signed with the streaming payload sentinel.
pub(crate) async fn body_to_reader(headers: &HeaderMap, body: Body) -> Result<ByteStream, S3Error> {
    let is_aws_chunked = headers
        .get("x-amz-content-sha256")
        .and_then(|v| v.to_str().ok())
        == Some("STREAMING-AWS4-HMAC-SHA256-PAYLOAD");

    let stream = body.into_data_stream();
    let raw_reader =
        tokio_util::io::StreamReader::new(stream.map_err(std::io::Error::other));

    if !is_aws_chunked {
        return Ok(Box::pin(raw_reader));
    }

    // Each chunk is "<hex-size>;chunk-signature=<sig>\r\n<data>\r\n"; a
    // zero-size chunk terminates the body.
    let mut buf_reader = tokio::io::BufReader::new(raw_reader);
    let mut decoded = Vec::new();
    loop {
        let mut line = String::new();
        let n = buf_reader
            .read_line(&mut line)
            .await
            .map_err(S3Error::internal)?;
        if n == 0 {
            break;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        let size_str = line.split(';').next().unwrap_or("0");
        let chunk_size = usize::from_str_radix(size_str.trim(), 16)
            .map_err(|_| S3Error::internal("invalid chunk size"))?;
        if chunk_size == 0 {
            break;
        }
        let mut chunk = vec![0u8; chunk_size];
        buf_reader
            .read_exact(&mut chunk)
            .await
            .map_err(S3Error::internal)?;
        decoded.extend_from_slice(&chunk);
        let mut crlf = [0u8; 2];
        let _ = buf_reader.read_exact(&mut crlf).await;
    }
    Ok(Box::pin(std::io::Cursor::new(decoded)))
}
