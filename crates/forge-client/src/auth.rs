//! Auth-scheme resolution (`RESOLVE_AUTH`, §4.9).
//!
//! The resolver returns a priority-ordered list of [`AuthSchemeOption`]s;
//! the pipeline picks the first whose scheme the client has registered and
//! whose identity actually resolves.

use std::collections::HashMap;
use std::sync::Mutex;

use forge_error::{ErrorKind, RuntimeError};
use forge_identity::{AwsCredentials, IdentityChain, SignableRequest, SigV4Signer, SigningCache};

/// The standard auth scheme identifiers named in the trait vocabulary
/// (§3), plus an escape hatch for schemes the runtime does not special-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuthSchemeId {
    Sigv4,
    HttpApiKey,
    HttpBearer,
    HttpDigest,
    HttpBasic,
    Custom(String),
}

/// `(schemeId, identityProperties, signerProperties)` — one candidate
/// returned by an [`AuthSchemeResolver`], in priority order.
#[derive(Debug, Clone)]
pub struct AuthSchemeOption {
    pub scheme_id: AuthSchemeId,
    pub identity_properties: HashMap<String, String>,
    pub signer_properties: HashMap<String, String>,
}

impl AuthSchemeOption {
    pub fn new(scheme_id: AuthSchemeId) -> Self {
        AuthSchemeOption { scheme_id, identity_properties: HashMap::new(), signer_properties: HashMap::new() }
    }
}

pub trait AuthSchemeResolver: Send + Sync {
    fn resolve_auth_schemes(&self, operation: &str) -> Vec<AuthSchemeOption>;
}

/// Always offers the same fixed, ordered list of schemes, regardless of
/// operation — the common case for a client bound to one service.
pub struct StaticAuthSchemeResolver {
    options: Vec<AuthSchemeOption>,
}

impl StaticAuthSchemeResolver {
    pub fn new(options: Vec<AuthSchemeOption>) -> Self {
        StaticAuthSchemeResolver { options }
    }
}

impl AuthSchemeResolver for StaticAuthSchemeResolver {
    fn resolve_auth_schemes(&self, _operation: &str) -> Vec<AuthSchemeOption> {
        self.options.clone()
    }
}

/// One scheme the client has registered: it knows how to resolve an
/// identity for this scheme id and, if resolved, how to sign a request
/// with it. Kept separate from identity resolution proper (`forge-identity`)
/// so a caller can register a scheme backed by any identity type.
#[async_trait::async_trait]
pub trait RegisteredAuthScheme: Send + Sync {
    fn scheme_id(&self) -> &AuthSchemeId;

    /// Attempts to resolve an identity for `option`. Returns `Ok(None)` if
    /// this scheme's resolver chain reports `notFound` rather than erroring
    /// outright, so the pipeline can move to the next candidate option.
    async fn try_resolve(&self, option: &AuthSchemeOption) -> Result<bool, RuntimeError>;

    /// Signs `request` using whatever identity `try_resolve` last resolved.
    fn sign(
        &self,
        request: crate::transport::HttpRequest,
        option: &AuthSchemeOption,
    ) -> Result<crate::transport::HttpRequest, RuntimeError>;
}

/// Picks the first [`AuthSchemeOption`] whose scheme is registered in
/// `registered` and whose identity resolves. If none succeeds, the error
/// concatenates every attempted option's failure, per §4.9.
pub async fn pick_auth_scheme<'a>(
    options: &'a [AuthSchemeOption],
    registered: &'a [Box<dyn RegisteredAuthScheme>],
) -> Result<(&'a AuthSchemeOption, &'a dyn RegisteredAuthScheme), RuntimeError> {
    let mut misses = Vec::new();
    for option in options {
        let Some(scheme) = registered.iter().find(|s| s.scheme_id() == &option.scheme_id) else {
            misses.push(format!("{:?}: not registered on this client", option.scheme_id));
            continue;
        };
        match scheme.try_resolve(option).await {
            Ok(true) => return Ok((option, scheme.as_ref())),
            Ok(false) => misses.push(format!("{:?}: identity not found", option.scheme_id)),
            Err(err) => misses.push(format!("{:?}: {err}", option.scheme_id)),
        }
    }
    Err(RuntimeError::new(
        ErrorKind::IdentityNotFound,
        format!("no auth scheme could be resolved: [{}]", misses.join("; ")),
    ))
}

/// The concrete SigV4 [`RegisteredAuthScheme`] (§4.6): wraps an
/// [`IdentityChain`] of `AwsCredentials` resolvers and a [`SigV4Signer`]
/// bound to one region/service/key cache. This is the scheme a client
/// builder registers by default for `sigv4`-authed operations.
///
/// `try_resolve` and `sign` are separate trait methods with no shared
/// parameter carrying the resolved identity between them, so the identity
/// resolved by the most recent `try_resolve` call is stashed in `resolved`
/// for `sign` to pick up — the same split `pick_auth_scheme` already
/// assumes of every `RegisteredAuthScheme` impl.
pub struct SigV4AuthScheme {
    identity: IdentityChain<AwsCredentials>,
    region: String,
    service: String,
    cache: SigningCache,
    resolved: Mutex<Option<AwsCredentials>>,
}

impl SigV4AuthScheme {
    pub fn new(identity: IdentityChain<AwsCredentials>, region: impl Into<String>, service: impl Into<String>) -> Self {
        SigV4AuthScheme {
            identity,
            region: region.into(),
            service: service.into(),
            cache: SigningCache::new(64),
            resolved: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl RegisteredAuthScheme for SigV4AuthScheme {
    fn scheme_id(&self) -> &AuthSchemeId {
        &AuthSchemeId::Sigv4
    }

    async fn try_resolve(&self, _option: &AuthSchemeOption) -> Result<bool, RuntimeError> {
        match self.identity.resolve().await {
            Ok(credentials) => {
                *self.resolved.lock().unwrap() = Some(credentials);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    fn sign(
        &self,
        request: crate::transport::HttpRequest,
        _option: &AuthSchemeOption,
    ) -> Result<crate::transport::HttpRequest, RuntimeError> {
        let credentials = self
            .resolved
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| RuntimeError::new(ErrorKind::IdentityNotFound, "sigv4: sign called before an identity resolved"))?;

        let now = chrono::Utc::now();
        let date = now.format("%Y%m%d").to_string();
        let date_time = now.format("%Y%m%dT%H%M%SZ").to_string();

        let url = url::Url::parse(&request.uri)
            .map_err(|e| RuntimeError::new(ErrorKind::TransportProtocol, "invalid URI for sigv4 signing").with_cause(e))?;
        let query_pairs: Vec<(String, String)> =
            url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();

        let mut request = request.with_header("x-amz-date", date_time.clone());
        if request.header("host").is_none() {
            request = request.with_header("host", url.host_str().unwrap_or_default());
        }
        if let Some(token) = &credentials.session_token {
            request = request.with_header("x-amz-security-token", token.clone());
        }

        let signable = SignableRequest {
            method: request.method.clone(),
            canonical_path: url.path().to_owned(),
            query_pairs,
            headers: request.headers.clone(),
            body: request.body.to_vec(),
            body_replayable: true,
        };

        let signer = SigV4Signer { region: &self.region, service: &self.service, cache: &self.cache };
        let authorization = signer.sign(&credentials, &signable, &date, &date_time);

        Ok(request.with_header("authorization", authorization))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HttpRequest;

    struct AlwaysFails;
    #[async_trait::async_trait]
    impl RegisteredAuthScheme for AlwaysFails {
        fn scheme_id(&self) -> &AuthSchemeId {
            &AuthSchemeId::HttpBearer
        }
        async fn try_resolve(&self, _option: &AuthSchemeOption) -> Result<bool, RuntimeError> {
            Ok(false)
        }
        fn sign(&self, request: HttpRequest, _option: &AuthSchemeOption) -> Result<HttpRequest, RuntimeError> {
            Ok(request)
        }
    }

    struct AlwaysSucceeds;
    #[async_trait::async_trait]
    impl RegisteredAuthScheme for AlwaysSucceeds {
        fn scheme_id(&self) -> &AuthSchemeId {
            &AuthSchemeId::HttpApiKey
        }
        async fn try_resolve(&self, _option: &AuthSchemeOption) -> Result<bool, RuntimeError> {
            Ok(true)
        }
        fn sign(&self, request: HttpRequest, _option: &AuthSchemeOption) -> Result<HttpRequest, RuntimeError> {
            Ok(request.with_header("x-api-key", "secret"))
        }
    }

    #[tokio::test]
    async fn picks_first_option_whose_identity_resolves() {
        let options = vec![
            AuthSchemeOption::new(AuthSchemeId::HttpBearer),
            AuthSchemeOption::new(AuthSchemeId::HttpApiKey),
        ];
        let registered: Vec<Box<dyn RegisteredAuthScheme>> = vec![Box::new(AlwaysFails), Box::new(AlwaysSucceeds)];

        let (option, scheme) = pick_auth_scheme(&options, &registered).await.unwrap();
        assert_eq!(option.scheme_id, AuthSchemeId::HttpApiKey);
        let signed = scheme.sign(HttpRequest::new("GET", "/"), option).unwrap();
        assert_eq!(signed.header("x-api-key"), Some("secret"));
    }

    #[tokio::test]
    async fn concatenates_every_failure_when_none_resolve() {
        let options = vec![AuthSchemeOption::new(AuthSchemeId::HttpBearer)];
        let registered: Vec<Box<dyn RegisteredAuthScheme>> = vec![Box::new(AlwaysFails)];
        let err = pick_auth_scheme(&options, &registered).await.unwrap_err();
        assert!(err.message().contains("HttpBearer"));
    }
}
