use axum::{
    Json,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
};

use crate::application::{RequestContext, error::HttpError};

use super::HttpState;
use super::models::{DelegateRequest, PreAuthorizeResponse, ResourceInfoResponse};

const SOURCE: &str = "infra::http::handlers";

pub(super) async fn resource_info(
    State(state): State<HttpState>,
    Json(request): Json<DelegateRequest>,
) -> Result<Json<ResourceInfoResponse>, HttpError> {
    let ctx = request_context(request)?;
    let info = state.delegate.resource_info(&ctx).await?;
    Ok(Json(ResourceInfoResponse {
        uri: info.uri,
        headers: info.headers,
    }))
}

pub(super) async fn pre_authorize(
    State(state): State<HttpState>,
    Json(request): Json<DelegateRequest>,
) -> Result<Json<PreAuthorizeResponse>, HttpError> {
    let ctx = request_context(request)?;
    let authorized = state.delegate.pre_authorize(&ctx).await?;
    Ok(Json(PreAuthorizeResponse { authorized }))
}

fn request_context(request: DelegateRequest) -> Result<RequestContext, HttpError> {
    let mut request_headers = HeaderMap::new();
    for (name, values) in &request.request_headers {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
            HttpError::from_error(SOURCE, StatusCode::BAD_REQUEST, "Invalid header name", &err)
        })?;
        for value in values.iter() {
            let header_value = HeaderValue::from_str(value).map_err(|err| {
                HttpError::from_error(
                    SOURCE,
                    StatusCode::BAD_REQUEST,
                    "Invalid header value",
                    &err,
                )
            })?;
            request_headers.append(header_name.clone(), header_value);
        }
    }

    Ok(RequestContext {
        identifier: request.identifier,
        request_headers,
    })
}
