use axum::response::{IntoResponse, Response};
use http::StatusCode;

use crate::storage::StorageError;

#[derive(Debug)]
pub struct S3Error {
    pub code: S3ErrorCode,
    pub message: String,
    pub resource: Option<String>,
}

#[derive(Debug)]
pub enum S3ErrorCode {
    AccessDenied,
    BucketAlreadyExists,
    BucketNotEmpty,
    InternalError,
    InvalidArgument,
    InvalidPart,
    MalformedXML,
    MethodNotAllowed,
    MissingContentLength,
    NoSuchBucket,
    NoSuchKey,
    NoSuchUpload,
}

impl S3ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessDenied => "AccessDenied",
            Self::BucketAlreadyExists => "BucketAlreadyExists",
            Self::BucketNotEmpty => "BucketNotEmpty",
            Self::InternalError => "InternalError",
            Self::InvalidArgument => "InvalidArgument",
            Self::InvalidPart => "InvalidPart",
            Self::MalformedXML => "MalformedXML",
            Self::MethodNotAllowed => "MethodNotAllowed",
            Self::MissingContentLength => "MissingContentLength",
            Self::NoSuchBucket => "NoSuchBucket",
            Self::NoSuchKey => "NoSuchKey",
            Self::NoSuchUpload => "NoSuchUpload",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AccessDenied => StatusCode::FORBIDDEN,
            Self::BucketAlreadyExists | Self::BucketNotEmpty => StatusCode::CONFLICT,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::MissingContentLength => StatusCode::LENGTH_REQUIRED,
            Self::NoSuchBucket | Self::NoSuchKey | Self::NoSuchUpload => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl S3Error {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        tracing::error!("Internal error: {}", err);
        Self {
            code: S3ErrorCode::InternalError,
            message: "We encountered an internal error. Please try again.".into(),
            resource: None,
        }
    }

    pub fn no_such_bucket(bucket: &str) -> Self {
        Self {
            code: S3ErrorCode::NoSuchBucket,
            message: format!("The specified bucket does not exist: {}", bucket),
            resource: Some(format!("/{}", bucket)),
        }
    }

    pub fn no_such_key(key: &str) -> Self {
        Self {
            code: S3ErrorCode::NoSuchKey,
            message: "The specified key does not exist.".into(),
            resource: Some(key.to_string()),
        }
    }

    pub fn no_such_upload(upload_id: &str) -> Self {
        Self {
            code: S3ErrorCode::NoSuchUpload,
            message: "The specified multipart upload does not exist.".into(),
            resource: Some(upload_id.to_string()),
        }
    }

    pub fn bucket_already_exists(bucket: &str) -> Self {
        Self {
            code: S3ErrorCode::BucketAlreadyExists,
            message: format!("The requested bucket name is not available: {}", bucket),
            resource: Some(format!("/{}", bucket)),
        }
    }

    pub fn bucket_not_empty(bucket: &str) -> Self {
        Self {
            code: S3ErrorCode::BucketNotEmpty,
            message: "The bucket you tried to delete is not empty.".into(),
            resource: Some(format!("/{}", bucket)),
        }
    }

    pub fn invalid_argument(msg: &str) -> Self {
        Self {
            code: S3ErrorCode::InvalidArgument,
            message: msg.to_string(),
            resource: None,
        }
    }

    pub fn invalid_part(msg: &str) -> Self {
        Self {
            code: S3ErrorCode::InvalidPart,
            message: msg.to_string(),
            resource: None,
        }
    }

    pub fn malformed_xml() -> Self {
        Self {
            code: S3ErrorCode::MalformedXML,
            message: "The XML you provided was not well-formed.".into(),
            resource: None,
        }
    }

    pub fn missing_content_length() -> Self {
        Self {
            code: S3ErrorCode::MissingContentLength,
            message: "You must provide the Content-Length HTTP header.".into(),
            resource: None,
        }
    }

    pub fn method_not_allowed() -> Self {
        Self {
            code: S3ErrorCode::MethodNotAllowed,
            message: "The specified method is not allowed against this resource.".into(),
            resource: None,
        }
    }

    pub fn access_denied(msg: &str) -> Self {
        Self {
            code: S3ErrorCode::AccessDenied,
            message: msg.to_string(),
            resource: None,
        }
    }
}

impl From<StorageError> for S3Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::BucketNotFound(bucket) => Self::no_such_bucket(&bucket),
            StorageError::BucketExists(bucket) => Self::bucket_already_exists(&bucket),
            StorageError::BucketNotEmpty(bucket) => Self::bucket_not_empty(&bucket),
            StorageError::ObjectNotFound(key) => Self::no_such_key(&key),
            StorageError::UploadNotFound(upload_id) => Self::no_such_upload(&upload_id),
            StorageError::InvalidBucketName(msg) | StorageError::InvalidKey(msg) => {
                Self::invalid_argument(&msg)
            }
            StorageError::InvalidPart { number, reason } => {
                Self::invalid_part(&format!("part {}: {}", number, reason))
            }
            err => Self::internal(err),
        }
    }
}

impl IntoResponse for S3Error {
    fn into_response(self) -> Response {
        let resource = self.resource.as_deref().unwrap_or("");
        let request_id = uuid::Uuid::new_v4();
        let xml = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <Error>\
             <Code>{}</Code>\
             <Message>{}</Message>\
             <Resource>{}</Resource>\
             <RequestId>{}</RequestId>\
             </Error>",
            self.code.as_str(),
            self.message,
            resource,
            request_id,
        );

        let status = self.code.status_code();
        (
            status,
            [
                ("content-type", "application/xml"),
                ("x-amz-request-id", &request_id.to_string()),
            ],
            xml,
        )
            .into_response()
    }
}
