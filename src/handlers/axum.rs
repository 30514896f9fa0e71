//! Axum integration: converts inbound requests into the internal
//! [`ApiRequest`] shape, dispatches through [`App::handle_request`], and
//! converts the result back. Routing itself lives in the app's route table,
//! so the axum router is a single fallback.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::Response;

use berth_core::types::{ApiRequest, ApiResponse, HttpMethod};

use crate::core::App;

/// Build the server router around the app.
pub fn router(app: Arc<App>) -> Router {
    Router::new().fallback(dispatch).with_state(app)
}

async fn dispatch(State(app): State<Arc<App>>, req: Request) -> Response {
    // Present when served via `into_make_service_with_connect_info`.
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let api_req = match convert_request(req, peer).await {
        Ok(api_req) => api_req,
        Err(response) => return response,
    };
    convert_response(app.handle_request(api_req).await)
}

async fn convert_request(
    req: Request,
    peer: Option<SocketAddr>,
) -> Result<ApiRequest, Response> {
    let (parts, body) = req.into_parts();

    let method = match parts.method {
        axum::http::Method::GET => HttpMethod::Get,
        axum::http::Method::POST => HttpMethod::Post,
        axum::http::Method::PUT => HttpMethod::Put,
        axum::http::Method::DELETE => HttpMethod::Delete,
        axum::http::Method::PATCH => HttpMethod::Patch,
        axum::http::Method::OPTIONS => HttpMethod::Options,
        axum::http::Method::HEAD => HttpMethod::Head,
        _ => {
            return Err(plain_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "Unsupported HTTP method",
            ));
        }
    };

    let mut api_req = ApiRequest::new(method, parts.uri.path());

    for (name, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            api_req
                .headers
                .insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }
    // Record the transport peer so rate limiting works without a proxy.
    if let Some(peer) = peer {
        api_req
            .headers
            .entry("x-client-addr".to_string())
            .or_insert_with(|| peer.ip().to_string());
    }

    if let Some(query) = parts.uri.query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            api_req.query.insert(key.into_owned(), value.into_owned());
        }
    }

    match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) if !bytes.is_empty() => api_req.body = Some(bytes.to_vec()),
        Ok(_) => {}
        Err(_) => {
            return Err(plain_response(
                StatusCode::BAD_REQUEST,
                "Failed to read request body",
            ));
        }
    }

    Ok(api_req)
}

fn convert_response(api_response: ApiResponse) -> Response {
    let mut builder = Response::builder().status(
        StatusCode::from_u16(api_response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );

    for (name, value) in &api_response.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    for cookie in &api_response.cookies {
        if let Ok(value) = HeaderValue::from_str(cookie) {
            builder = builder.header(header::SET_COOKIE, value);
        }
    }

    builder
        .body(Body::from(api_response.body))
        .unwrap_or_else(|_| {
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        })
}

fn plain_response(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_string()))
        .unwrap_or_default()
}
