//! The server dispatcher (C13, §4.13): route, deserialize, invoke, serialize.
//!
//! Mirrors `control`'s `AppError`/`IntoResponse` shape — a `thiserror` enum
//! whose variants carry exactly the information needed to answer the wire
//! request, with server-fault errors logged via `tracing::error!` before
//! their detail is dropped from the response.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use forge_context::Context;
use forge_error::{ErrorKind, Fault, RuntimeError};
use forge_router::{MatchResult, RouteFailure, Router};
use futures::FutureExt;

use crate::codec::Codec;

/// A request as handed to the dispatcher by some concrete transport
/// (§6.3's `HttpRequest`, stripped to what routing and codecs need).
pub struct IncomingRequest {
    pub method: String,
    pub path: String,
    pub raw_query: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl IncomingRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        IncomingRequest {
            method: method.into(),
            path: path.into(),
            raw_query: String::new(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_query(mut self, raw_query: impl Into<String>) -> Self {
        self.raw_query = raw_query.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// The wire response the dispatcher hands back to the transport.
pub struct OutgoingResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl OutgoingResponse {
    fn empty(status: u16) -> Self {
        OutgoingResponse { status, headers: Vec::new(), body: Bytes::new() }
    }

    fn json(status: u16, content_type: &str, body: Bytes) -> Self {
        OutgoingResponse {
            status,
            headers: vec![("content-type".to_string(), content_type.to_string())],
            body,
        }
    }
}

/// One operation's handler: the registered-business-logic half of §4.13
/// steps 2–4, playing request deserializer, handler, and response
/// serializer all at once since this crate stands in for a generated
/// protocol binding rather than implementing one.
///
/// `labels` carries the router's captured path/query values (§4.13 step 2's
/// "captured labels"); the handler — not the dispatcher — decides how they
/// bind onto the typed input, since that binding is protocol- and
/// shape-specific.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(
        &self,
        input: serde_json::Value,
        labels: &std::collections::HashMap<String, Vec<String>>,
        context: &Context,
    ) -> Result<serde_json::Value, RuntimeError>;
}

/// A registered operation: the handler plus the response metadata the
/// dispatcher needs once the handler returns successfully.
pub struct Operation {
    pub name: String,
    pub success_status: u16,
    pub is_event_stream: bool,
    pub handler: Arc<dyn OperationHandler>,
}

impl Operation {
    pub fn new(name: impl Into<String>, success_status: u16, handler: Arc<dyn OperationHandler>) -> Self {
        Operation { name: name.into(), success_status, is_event_stream: false, handler }
    }

    /// Marks this operation as carrying an event-stream member (§4.13 step
    /// 5); callers splice the body through [`crate::eventstream`] themselves
    /// rather than the dispatcher's ordinary JSON path.
    pub fn event_stream(mut self) -> Self {
        self.is_event_stream = true;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no operation matches this request")]
    UnknownOperation,
    #[error("the matched path does not support this method")]
    MethodNotAllowed,
    #[error("malformed request: {0}")]
    MalformedRequest(#[source] RuntimeError),
    #[error(transparent)]
    Handler(#[from] RuntimeError),
    #[error("internal failure")]
    InternalFailure,
}

impl DispatchError {
    fn status(&self) -> u16 {
        match self {
            DispatchError::UnknownOperation => 404,
            DispatchError::MethodNotAllowed => 405,
            DispatchError::MalformedRequest(_) => 400,
            DispatchError::Handler(err) => err.http_status().unwrap_or(match err.fault() {
                Fault::Client => 400,
                Fault::Server | Fault::Unknown => 500,
            }),
            DispatchError::InternalFailure => 500,
        }
    }
}

/// Composes a built [`Router`] over [`Operation`]s with a [`Codec`] into a
/// single entry point a transport calls once per request.
pub struct Dispatcher {
    router: Router<Operation>,
    codec: Arc<dyn Codec>,
}

impl Dispatcher {
    pub fn new(router: Router<Operation>, codec: Arc<dyn Codec>) -> Self {
        Dispatcher { router, codec }
    }

    /// Runs the full five-step flow from §4.13, never returning an `Err` —
    /// every failure mode (`Router/*`, framing, handler throw, handler
    /// panic) is mapped to a wire response before this returns.
    #[tracing::instrument(skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn dispatch(&self, request: IncomingRequest) -> OutgoingResponse {
        match self.router.match_request(&request.method, &request.path, &request.raw_query) {
            Ok(matched) => self.invoke(matched, request.body).await,
            Err(RouteFailure::NotFound) => self.error_response(DispatchError::UnknownOperation),
            Err(RouteFailure::MethodNotAllowed) => self.error_response(DispatchError::MethodNotAllowed),
            Err(RouteFailure::BadQuery) => self.error_response(DispatchError::MalformedRequest(
                RuntimeError::new(ErrorKind::CallValidation, "query string did not match any registered pattern"),
            )),
        }
    }

    async fn invoke(&self, matched: MatchResult<'_, Operation>, body: Bytes) -> OutgoingResponse {
        let input = match self.codec.decode(&body) {
            Ok(value) => value,
            Err(err) => return self.error_response(DispatchError::MalformedRequest(err)),
        };

        let operation = matched.operation;
        let context = Context::new();
        let handler = operation.handler.clone();
        let labels = matched.labels;

        let outcome = AssertUnwindSafe(handler.handle(input, &labels, &context))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(output)) => match self.codec.encode(&output) {
                Ok(body) => OutgoingResponse::json(operation.success_status, self.codec.content_type(), body),
                Err(err) => self.error_response(DispatchError::Handler(err)),
            },
            Ok(Err(err)) => self.error_response(DispatchError::Handler(err)),
            Err(_panic) => {
                tracing::error!(operation = %operation.name, "handler panicked");
                self.error_response(DispatchError::InternalFailure)
            }
        }
    }

    fn error_response(&self, err: DispatchError) -> OutgoingResponse {
        let status = err.status();
        match &err {
            DispatchError::UnknownOperation | DispatchError::MethodNotAllowed => OutgoingResponse::empty(status),
            DispatchError::InternalFailure => OutgoingResponse::empty(status),
            DispatchError::MalformedRequest(cause) => {
                if status >= 500 {
                    tracing::error!(error = %cause, "malformed request classified as a server fault");
                }
                let body = serde_json::json!({ "code": "MalformedRequest", "message": cause.to_string() });
                self.codec
                    .encode(&body)
                    .map(|b| OutgoingResponse::json(status, self.codec.content_type(), b))
                    .unwrap_or_else(|_| OutgoingResponse::empty(status))
            }
            DispatchError::Handler(cause) => {
                if status >= 500 {
                    tracing::error!(error = %cause, "handler error classified as a server fault");
                }
                let body = serde_json::json!({ "code": cause.kind().to_string(), "message": cause.message() });
                self.codec
                    .encode(&body)
                    .map(|b| OutgoingResponse::json(status, self.codec.content_type(), b))
                    .unwrap_or_else(|_| OutgoingResponse::empty(status))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use forge_router::{QueryPattern, UriPattern};
    use std::collections::HashMap;

    struct Echo;
    #[async_trait]
    impl OperationHandler for Echo {
        async fn handle(
            &self,
            input: serde_json::Value,
            labels: &HashMap<String, Vec<String>>,
            _context: &Context,
        ) -> Result<serde_json::Value, RuntimeError> {
            Ok(serde_json::json!({ "input": input, "id": labels.get("id").and_then(|v| v.first()) }))
        }
    }

    struct AlwaysFails;
    #[async_trait]
    impl OperationHandler for AlwaysFails {
        async fn handle(
            &self,
            _input: serde_json::Value,
            _labels: &HashMap<String, Vec<String>>,
            _context: &Context,
        ) -> Result<serde_json::Value, RuntimeError> {
            Err(RuntimeError::new(ErrorKind::CallValidation, "bad widget name").with_http_status(422))
        }
    }

    struct Panics;
    #[async_trait]
    impl OperationHandler for Panics {
        async fn handle(
            &self,
            _input: serde_json::Value,
            _labels: &HashMap<String, Vec<String>>,
            _context: &Context,
        ) -> Result<serde_json::Value, RuntimeError> {
            panic!("boom");
        }
    }

    fn dispatcher() -> Dispatcher {
        let router = Router::builder()
            .register(
                UriPattern::new("GET", "/widgets/{id}", QueryPattern::new()).unwrap(),
                Operation::new("GetWidget", 200, Arc::new(Echo)),
            )
            .register(
                UriPattern::new("POST", "/widgets", QueryPattern::new()).unwrap(),
                Operation::new("CreateWidget", 201, Arc::new(AlwaysFails)),
            )
            .register(
                UriPattern::new("POST", "/explode", QueryPattern::new()).unwrap(),
                Operation::new("Explode", 200, Arc::new(Panics)),
            )
            .build()
            .unwrap();
        Dispatcher::new(router, Arc::new(JsonCodec))
    }

    #[tokio::test]
    async fn routes_and_binds_labels_into_the_handler() {
        let response = dispatcher()
            .dispatch(IncomingRequest::new("GET", "/widgets/abc"))
            .await;
        assert_eq!(response.status, 200);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["id"], serde_json::json!("abc"));
    }

    #[tokio::test]
    async fn unmatched_path_is_a_404_with_an_empty_body() {
        let response = dispatcher().dispatch(IncomingRequest::new("GET", "/nope")).await;
        assert_eq!(response.status, 404);
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn matched_path_wrong_method_is_a_405() {
        let response = dispatcher().dispatch(IncomingRequest::new("DELETE", "/widgets/abc")).await;
        assert_eq!(response.status, 405);
    }

    #[tokio::test]
    async fn malformed_body_is_a_400() {
        let response = dispatcher()
            .dispatch(IncomingRequest::new("POST", "/explode").with_body(Bytes::from_static(b"{not json")))
            .await;
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn modeled_handler_error_uses_its_http_status() {
        let response = dispatcher()
            .dispatch(IncomingRequest::new("POST", "/widgets").with_body(Bytes::from_static(b"{}")))
            .await;
        assert_eq!(response.status, 422);
    }

    #[tokio::test]
    async fn handler_panic_is_a_500_without_exposing_detail() {
        let response = dispatcher()
            .dispatch(IncomingRequest::new("POST", "/explode").with_body(Bytes::from_static(b"{}")))
            .await;
        assert_eq!(response.status, 500);
        assert!(response.body.is_empty());
    }
}
