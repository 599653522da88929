pub mod bucket;
pub mod multipart;
pub mod object;

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    routing::get,
    Router,
};
use http::Method;

use crate::error::S3Error;
use crate::server::AppState;

pub fn s3_router() -> Router<AppState> {
    let bucket_routes = get(bucket::get_bucket)
        .put(bucket::create_bucket)
        .head(bucket::head_bucket)
        .delete(bucket::delete_bucket)
        .fallback(method_not_allowed);

    Router::new()
        .route("/", get(bucket::list_buckets).fallback(method_not_allowed))
        .route("/{bucket}", bucket_routes.clone())
        .route("/{bucket}/", bucket_routes)
        .route(
            "/{bucket}/{*key}",
            get(object::get_object)
                .put(object::put_object)
                .head(object::head_object)
                .delete(object::delete_object)
                .post(object::post_object)
                .fallback(method_not_allowed),
        )
}

async fn method_not_allowed() -> S3Error {
    S3Error::method_not_allowed()
}

/// Read-only mode rejects every mutating verb before it reaches a handler.
pub async fn read_only_guard(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, S3Error> {
    if state.config.read_only {
        let method = request.method();
        if method == Method::PUT || method == Method::POST || method == Method::DELETE {
            return Err(S3Error::access_denied("Server is in read-only mode"));
        }
    }
    Ok(next.run(request).await)
}

pub(crate) fn xml_response(status: StatusCode, xml: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/xml")
        .body(Body::from(xml))
        .unwrap()
}

pub(crate) fn empty_response(status: StatusCode) -> Response<Body> {
    Response::builder().status(status).body(Body::empty()).unwrap()
}
