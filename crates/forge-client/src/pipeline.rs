//! The client invocation pipeline (component C9, §4.9): the state machine
//! that turns one typed input into one typed output, running
//!
//! ```text
//! START -> RESOLVE_AUTH -> RESOLVE_ENDPOINT -> SERIALIZE_INPUT
//!       -> APPLY_AUTH_HEADERS -> ENTER_RETRY_LOOP -> ACQUIRE_TOKEN
//!       -> ATTEMPT(SIGN -> TRANSMIT -> RECEIVE -> CLASSIFY) -> ...
//! ```
//!
//! External collaborators (§6.2/§6.3 — serializer, deserializer, transport,
//! endpoint resolver, auth schemes, retry strategy, identity) are all
//! generic parameters or trait objects rather than concrete types, the way
//! `flow-client::Client` threads a `reqwest::Client` and a journal router
//! through its call sites without hardcoding either.

use std::sync::Arc;

use forge_error::{ErrorKind, RuntimeError};
use forge_retry::RetryStrategy;

use crate::auth::{pick_auth_scheme, AuthSchemeResolver, RegisteredAuthScheme};
use crate::endpoint::{EndpointParams, EndpointResolver};
use crate::interceptor::{InterceptorChain, InterceptorContext};
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// Serializes a typed input into an [`HttpRequest`] against a resolved
/// endpoint (§6.2's `Serializer<I>` collaborator).
pub trait RequestSerializer<I>: Send + Sync {
    fn serialize(&self, input: &I, endpoint_uri: &str) -> Result<HttpRequest, RuntimeError>;
}

/// Deserializes an [`HttpResponse`] into a typed output, or a modeled
/// failure surfaced as an `Err` with [`ErrorKind::CallModeled`] (§6.2's
/// `Deserializer<O>` collaborator). Implementors own the protocol-specific
/// status-code-to-exception-shape mapping; the pipeline only distinguishes
/// success from failure.
pub trait ResponseDeserializer<O>: Send + Sync {
    fn deserialize(&self, response: &HttpResponse) -> Result<O, RuntimeError>;
}

/// Input types that carry an idempotency-token member the pipeline should
/// populate with a fresh UUID when the caller left it unset (§4.9's
/// `SERIALIZE_INPUT` step). Implement with the default body for inputs with
/// no such member.
pub trait IdempotencyTokenProvider {
    fn idempotency_token_mut(&mut self) -> Option<&mut Option<String>> {
        None
    }
}

/// Everything the pipeline needs to run one operation, assembled once per
/// client and shared across every call (`Arc`-wrapped internally by
/// callers that need to clone a client handle).
pub struct ClientPipeline<I, O> {
    pub endpoint_resolver: Arc<dyn EndpointResolver>,
    pub auth_scheme_resolver: Arc<dyn AuthSchemeResolver>,
    pub registered_auth_schemes: Vec<Box<dyn RegisteredAuthScheme>>,
    pub interceptors: InterceptorChain<I, O>,
    pub serializer: Arc<dyn RequestSerializer<I>>,
    pub deserializer: Arc<dyn ResponseDeserializer<O>>,
    pub transport: Arc<dyn Transport>,
    pub operation_name: String,
}

impl<I, O> ClientPipeline<I, O>
where
    I: IdempotencyTokenProvider + Send + Sync,
    O: Send,
{
    /// Runs one operation invocation to completion, retrying attempts per
    /// `strategy` until it reports success or exhaustion.
    ///
    /// `readAfterExecution` fires exactly once no matter which stage fails —
    /// every early-exit path below feeds its error into `ctx.output` instead
    /// of returning straight out of `execute`, so the hook always sees a
    /// final context.
    #[tracing::instrument(skip_all, fields(operation = %self.operation_name))]
    pub async fn execute<S>(
        &self,
        mut input: I,
        endpoint_params: &EndpointParams,
        strategy: &S,
    ) -> Result<O, RuntimeError>
    where
        S: RetryStrategy,
    {
        if let Some(slot) = input.idempotency_token_mut() {
            if slot.is_none() {
                *slot = Some(uuid::Uuid::new_v4().to_string());
            }
        }

        let mut ctx = InterceptorContext::<I, O>::new(input);
        if let Err(err) = self.run_to_completion(&mut ctx, endpoint_params, strategy).await {
            ctx.output = Some(Err(err));
        }

        if let Err(err) = self.interceptors.modify_before_completion(&mut ctx).await {
            ctx.output = Some(Err(err));
        }
        let _ = self.interceptors.read_after_execution(&ctx).await;

        ctx.output.expect("run_to_completion always sets output before returning")
    }

    /// The actual state machine body; every fallible step here uses `?`
    /// freely, since its only caller folds any `Err` into `ctx.output`
    /// before running the completion hooks.
    async fn run_to_completion<S>(
        &self,
        ctx: &mut InterceptorContext<I, O>,
        endpoint_params: &EndpointParams,
        strategy: &S,
    ) -> Result<(), RuntimeError>
    where
        S: RetryStrategy,
    {
        self.interceptors.read_before_execution(ctx).await?;
        self.interceptors.modify_before_serialization(ctx).await?;
        self.interceptors.read_before_serialization(ctx).await?;

        let auth_options = self.auth_scheme_resolver.resolve_auth_schemes(&self.operation_name);
        let (_auth_option, auth_scheme) = pick_auth_scheme(&auth_options, &self.registered_auth_schemes).await?;

        let endpoint = self.endpoint_resolver.resolve(endpoint_params)?;

        let input_ref = ctx.input.as_ref().expect("input set at context construction");
        let mut request = self.serializer.serialize(input_ref, &endpoint.uri)?;
        for (name, value) in &endpoint.headers {
            request = request.with_header(name.clone(), value.clone());
        }
        ctx.request = Some(request);
        self.interceptors.read_after_serialization(ctx).await?;

        self.interceptors.modify_before_retry_loop(ctx).await?;

        let (mut token, initial_delay) = strategy.acquire_initial_token(&self.operation_name)?;
        if !initial_delay.is_zero() {
            tokio::time::sleep(initial_delay).await;
        }

        loop {
            self.interceptors.read_before_attempt(ctx).await?;

            let attempt_result = self.run_attempt(auth_scheme, ctx).await;
            self.interceptors.modify_before_attempt_completion(ctx).await?;
            self.interceptors.read_after_attempt(ctx).await?;

            match attempt_result {
                Ok(()) => {
                    strategy.record_success(token);
                    return Ok(());
                }
                Err(err) => {
                    // §4.7: non-retry-safe errors bypass `refresh_retry_token`
                    // outright — enforced here rather than left to each
                    // `RetryStrategy` impl, since a strategy that forgot the
                    // check would otherwise silently retry it.
                    if !err.is_retry_safe() {
                        ctx.output = Some(Err(err));
                        return Ok(());
                    }
                    let retry_after = err.retry_after();
                    match strategy.refresh_retry_token(token, &err, retry_after) {
                        Ok((next_token, delay)) => {
                            token = next_token;
                            ctx.output = None;
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                        }
                        Err(_exhausted) => {
                            ctx.output = Some(Err(err));
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// One attempt: sign, transmit, receive, deserialize. Writes the
    /// outcome into `ctx.output` and returns `Err` only for the retry
    /// loop's own decision-making — the real result always lands in
    /// `ctx.output`.
    async fn run_attempt(
        &self,
        auth_scheme: &dyn RegisteredAuthScheme,
        ctx: &mut InterceptorContext<I, O>,
    ) -> Result<(), RuntimeError> {
        self.interceptors.modify_before_signing(ctx).await?;
        self.interceptors.read_before_signing(ctx).await?;

        let unsigned = ctx.request.clone().expect("request serialized before the retry loop");
        let auth_options = self.auth_scheme_resolver.resolve_auth_schemes(&self.operation_name);
        let option = auth_options
            .iter()
            .find(|o| o.scheme_id == self.registered_scheme_id_for(auth_scheme))
            .cloned()
            .unwrap_or_else(|| crate::auth::AuthSchemeOption::new(self.registered_scheme_id_for(auth_scheme)));
        let signed = auth_scheme.sign(unsigned, &option)?;
        ctx.request = Some(signed);
        self.interceptors.read_after_signing(ctx).await?;

        self.interceptors.modify_before_transmit(ctx).await?;
        self.interceptors.read_before_transmit(ctx).await?;

        let request = ctx.request.clone().expect("request signed before transmit");
        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(err) => {
                ctx.output = Some(Err(err.clone_for_retry()));
                return Err(err);
            }
        };
        ctx.response = Some(response);
        self.interceptors.read_after_transmit(ctx).await?;

        self.interceptors.modify_before_deserialization(ctx).await?;
        self.interceptors.read_before_deserialization(ctx).await?;

        let response_ref = ctx.response.as_ref().expect("response set after transmit");
        let outcome = self.deserializer.deserialize(response_ref);
        self.interceptors.read_after_deserialization(ctx).await?;

        match outcome {
            Ok(output) => {
                ctx.output = Some(Ok(output));
                Ok(())
            }
            Err(err) => {
                ctx.output = Some(Err(err.clone_for_retry()));
                Err(err)
            }
        }
    }

    fn registered_scheme_id_for(&self, scheme: &dyn RegisteredAuthScheme) -> crate::auth::AuthSchemeId {
        scheme.scheme_id().clone()
    }
}

/// A default [`RequestSerializer`]/[`ResponseDeserializer`] pair backed by
/// a plain function, for tests and for protocols simple enough not to
/// warrant a dedicated codec type.
pub struct FnCodec<I, O, Ser, De> {
    pub serialize: Ser,
    pub deserialize: De,
    _marker: std::marker::PhantomData<(I, O)>,
}

impl<I, O, Ser, De> FnCodec<I, O, Ser, De>
where
    Ser: Fn(&I, &str) -> Result<HttpRequest, RuntimeError> + Send + Sync,
    De: Fn(&HttpResponse) -> Result<O, RuntimeError> + Send + Sync,
{
    pub fn new(serialize: Ser, deserialize: De) -> Self {
        FnCodec { serialize, deserialize, _marker: std::marker::PhantomData }
    }
}

impl<I, O, Ser, De> RequestSerializer<I> for FnCodec<I, O, Ser, De>
where
    Ser: Fn(&I, &str) -> Result<HttpRequest, RuntimeError> + Send + Sync,
    De: Fn(&HttpResponse) -> Result<O, RuntimeError> + Send + Sync,
    I: Send + Sync,
    O: Send + Sync,
{
    fn serialize(&self, input: &I, endpoint_uri: &str) -> Result<HttpRequest, RuntimeError> {
        (self.serialize)(input, endpoint_uri)
    }
}

impl<I, O, Ser, De> ResponseDeserializer<O> for FnCodec<I, O, Ser, De>
where
    Ser: Fn(&I, &str) -> Result<HttpRequest, RuntimeError> + Send + Sync,
    De: Fn(&HttpResponse) -> Result<O, RuntimeError> + Send + Sync,
    I: Send + Sync,
    O: Send + Sync,
{
    fn deserialize(&self, response: &HttpResponse) -> Result<O, RuntimeError> {
        (self.deserialize)(response)
    }
}

trait CloneForRetry {
    fn clone_for_retry(&self) -> Self;
}

impl CloneForRetry for RuntimeError {
    /// `RuntimeError`'s `cause` is not `Clone` (it is `dyn Error`), but the
    /// pipeline needs to both return an error to the retry loop and stash
    /// one in `ctx.output` for the final result. Rebuilding from the public
    /// accessors drops any `cause`, which only ever mattered for the
    /// `tracing` span this error was created under.
    fn clone_for_retry(&self) -> Self {
        let mut rebuilt = RuntimeError::new(self.kind(), self.message().to_owned())
            .with_fault(self.fault())
            .with_retry_safe(self.retry_safety())
            .with_throttle(self.is_throttle());
        if let Some(retry_after) = self.retry_after() {
            rebuilt = rebuilt.with_retry_after(retry_after);
        }
        if let Some(schema_id) = self.schema_id() {
            rebuilt = rebuilt.with_schema_id(schema_id.to_owned());
        }
        if let Some(status) = self.http_status() {
            rebuilt = rebuilt.with_http_status(status);
        }
        rebuilt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthSchemeId, AuthSchemeOption, StaticAuthSchemeResolver};
    use crate::endpoint::StaticEndpointResolver;
    use crate::transport::FnTransport;
    use forge_retry::ExponentialBackoffStrategy;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Clone)]
    struct Input {
        token: Option<String>,
    }
    impl IdempotencyTokenProvider for Input {
        fn idempotency_token_mut(&mut self) -> Option<&mut Option<String>> {
            Some(&mut self.token)
        }
    }

    #[derive(Debug, PartialEq)]
    struct Output {
        body: String,
    }

    struct AlwaysOnScheme;
    #[async_trait::async_trait]
    impl RegisteredAuthScheme for AlwaysOnScheme {
        fn scheme_id(&self) -> &AuthSchemeId {
            &AuthSchemeId::HttpApiKey
        }
        async fn try_resolve(&self, _option: &AuthSchemeOption) -> Result<bool, RuntimeError> {
            Ok(true)
        }
        fn sign(&self, request: HttpRequest, _option: &AuthSchemeOption) -> Result<HttpRequest, RuntimeError> {
            Ok(request.with_header("x-api-key", "k"))
        }
    }

    fn pipeline(
        transport: Arc<dyn Transport>,
    ) -> ClientPipeline<Input, Output> {
        ClientPipeline {
            endpoint_resolver: Arc::new(StaticEndpointResolver::new("https://example.com")),
            auth_scheme_resolver: Arc::new(StaticAuthSchemeResolver::new(vec![AuthSchemeOption::new(
                AuthSchemeId::HttpApiKey,
            )])),
            registered_auth_schemes: vec![Box::new(AlwaysOnScheme)],
            interceptors: InterceptorChain::new(),
            serializer: Arc::new(FnCodec::new(
                |input: &Input, uri: &str| Ok(HttpRequest::new("POST", uri).with_header("x-token", input.token.clone().unwrap_or_default())),
                |_resp: &HttpResponse| Ok(Output { body: String::new() }),
            )),
            deserializer: Arc::new(FnCodec::new(
                |input: &Input, uri: &str| Ok(HttpRequest::new("POST", uri).with_header("x-token", input.token.clone().unwrap_or_default())),
                |resp: &HttpResponse| {
                    if resp.status >= 500 {
                        Err(RuntimeError::new(ErrorKind::CallServer5xx, "boom")
                            .with_retry_safe(forge_error::RetrySafety::Yes))
                    } else {
                        Ok(Output { body: String::from_utf8(resp.body.to_vec()).unwrap() })
                    }
                },
            )),
            transport,
            operation_name: "TestOperation".into(),
        }
    }

    #[tokio::test]
    async fn successful_attempt_populates_idempotency_token_and_returns_output() {
        let p = pipeline(Arc::new(FnTransport(|req: HttpRequest| {
            assert!(req.header("x-token").is_some());
            Ok(HttpResponse { status: 200, headers: Vec::new(), body: bytes::Bytes::from_static(b"ok") })
        })));

        let strategy = ExponentialBackoffStrategy::new(3).with_min(Duration::from_millis(1));
        let out = p
            .execute(Input { token: None }, &EndpointParams::default(), &strategy)
            .await
            .unwrap();
        assert_eq!(out.body, "ok");
    }

    #[tokio::test]
    async fn retries_retry_safe_failures_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let p = pipeline(Arc::new(FnTransport(move |_req: HttpRequest| {
            let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Ok(HttpResponse { status: 500, headers: Vec::new(), body: bytes::Bytes::new() })
            } else {
                Ok(HttpResponse { status: 200, headers: Vec::new(), body: bytes::Bytes::from_static(b"done") })
            }
        })));

        let strategy = ExponentialBackoffStrategy::new(5).with_min(Duration::from_millis(1)).with_max(Duration::from_millis(5));
        let out = p
            .execute(Input { token: None }, &EndpointParams::default(), &strategy)
            .await
            .unwrap();
        assert_eq!(out.body, "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausting_retries_surfaces_the_last_attempts_error() {
        let p = pipeline(Arc::new(FnTransport(|_req: HttpRequest| {
            Ok(HttpResponse { status: 500, headers: Vec::new(), body: bytes::Bytes::new() })
        })));

        let strategy = ExponentialBackoffStrategy::new(2).with_min(Duration::from_millis(1));
        let err = p
            .execute(Input { token: None }, &EndpointParams::default(), &strategy)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CallServer5xx);
    }

    struct PanicsOnRefresh;
    impl RetryStrategy for PanicsOnRefresh {
        type Token = ();
        fn acquire_initial_token(&self, _scope: &str) -> Result<((), Duration), RuntimeError> {
            Ok(((), Duration::ZERO))
        }
        fn refresh_retry_token(
            &self,
            _token: (),
            _last_error: &RuntimeError,
            _suggested_delay_from_server: Option<Duration>,
        ) -> Result<((), Duration), RuntimeError> {
            panic!("refresh_retry_token must not be called for a non-retry-safe error");
        }
        fn record_success(&self, _token: ()) -> Option<()> {
            None
        }
        fn max_attempts(&self) -> u32 {
            5
        }
    }

    #[tokio::test]
    async fn non_retry_safe_errors_bypass_refresh_regardless_of_strategy() {
        let p = pipeline(Arc::new(FnTransport(|_req: HttpRequest| {
            Ok(HttpResponse { status: 400, headers: Vec::new(), body: bytes::Bytes::new() })
        })));

        // The pipeline's own deserializer only distinguishes >=500 from
        // success, so build one here that reports a non-retry-safe error —
        // `PanicsOnRefresh` would fail this test immediately if the pipeline
        // ever called `refresh_retry_token` for it.
        let p = ClientPipeline {
            deserializer: Arc::new(FnCodec::new(
                |input: &Input, uri: &str| {
                    Ok(HttpRequest::new("POST", uri).with_header("x-token", input.token.clone().unwrap_or_default()))
                },
                |_resp: &HttpResponse| {
                    Err(RuntimeError::new(ErrorKind::CallValidation, "bad request")
                        .with_retry_safe(forge_error::RetrySafety::No))
                },
            )),
            ..p
        };

        let err = p
            .execute(Input { token: None }, &EndpointParams::default(), &PanicsOnRefresh)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CallValidation);
    }

    struct StaticAwsCredentials;
    #[async_trait::async_trait]
    impl forge_identity::IdentityResolver<forge_identity::AwsCredentials> for StaticAwsCredentials {
        fn resolver_id(&self) -> &str {
            "static"
        }
        async fn resolve(&self) -> forge_identity::IdentityResult<forge_identity::AwsCredentials> {
            forge_identity::IdentityResult::Identity(forge_identity::AwsCredentials::new(
                "AKIDEXAMPLE",
                "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY",
                None,
            ))
        }
    }

    #[tokio::test]
    async fn sigv4_scheme_signs_the_request_reaching_the_transport() {
        use crate::auth::SigV4AuthScheme;

        let sigv4 = SigV4AuthScheme::new(
            forge_identity::IdentityChain::new(vec![Box::new(StaticAwsCredentials)]),
            "us-east-1",
            "service",
        );

        let p = ClientPipeline {
            endpoint_resolver: Arc::new(StaticEndpointResolver::new("https://example.amazonaws.com")),
            auth_scheme_resolver: Arc::new(StaticAuthSchemeResolver::new(vec![AuthSchemeOption::new(AuthSchemeId::Sigv4)])),
            registered_auth_schemes: vec![Box::new(sigv4)],
            interceptors: InterceptorChain::new(),
            serializer: Arc::new(FnCodec::new(
                |input: &Input, uri: &str| {
                    Ok(HttpRequest::new("POST", uri).with_header("x-token", input.token.clone().unwrap_or_default()))
                },
                |_resp: &HttpResponse| Ok(Output { body: String::new() }),
            )),
            deserializer: Arc::new(FnCodec::new(
                |input: &Input, uri: &str| {
                    Ok(HttpRequest::new("POST", uri).with_header("x-token", input.token.clone().unwrap_or_default()))
                },
                |resp: &HttpResponse| Ok(Output { body: String::from_utf8(resp.body.to_vec()).unwrap() }),
            )),
            transport: Arc::new(FnTransport(|req: HttpRequest| {
                let auth = req.header("authorization").expect("sigv4 scheme must set an Authorization header");
                assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
                assert!(req.header("x-amz-date").is_some());
                Ok(HttpResponse { status: 200, headers: Vec::new(), body: bytes::Bytes::from_static(b"signed") })
            })),
            operation_name: "SigV4Operation".into(),
        };

        let strategy = ExponentialBackoffStrategy::new(3).with_min(Duration::from_millis(1));
        let out = p
            .execute(Input { token: None }, &EndpointParams::default(), &strategy)
            .await
            .unwrap();
        assert_eq!(out.body, "signed");
    }
}
