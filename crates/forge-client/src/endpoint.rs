//! Endpoint resolution (the `RESOLVE_ENDPOINT` pipeline stage) and
//! `hostPrefix` template expansion.
//!
//! `RESOLVE_ENDPOINT` needs an input; this fills that with a small typed
//! parameter bag, grounded in `iam-auth::config`'s per-provider config
//! structs.

use std::collections::HashMap;

use forge_error::{ErrorKind, RuntimeError};

/// `(uri, headers, properties)` per §3's Endpoint data model.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub properties: HashMap<String, String>,
}

impl Endpoint {
    pub fn new(uri: impl Into<String>) -> Self {
        Endpoint { uri: uri.into(), headers: Vec::new(), properties: HashMap::new() }
    }
}

/// Parameters feeding endpoint resolution: region plus the handful of
/// dual-stack/FIPS/override toggles every AWS-style client exposes.
#[derive(Debug, Clone, Default)]
pub struct EndpointParams {
    pub region: Option<String>,
    pub use_dual_stack: bool,
    pub use_fips: bool,
    pub endpoint_override: Option<String>,
    /// `hostLabel` member values, keyed by member name, to interpolate into
    /// an operation's `hostPrefix` template before resolution.
    pub host_labels: HashMap<String, String>,
}

pub trait EndpointResolver: Send + Sync {
    fn resolve(&self, params: &EndpointParams) -> Result<Endpoint, RuntimeError>;
}

/// Resolves to a fixed base URI, optionally prefixed with the operation's
/// expanded `hostPrefix` template (e.g. `{Bucket}.`).
pub struct StaticEndpointResolver {
    base_uri: String,
    host_prefix_template: Option<String>,
}

impl StaticEndpointResolver {
    pub fn new(base_uri: impl Into<String>) -> Self {
        StaticEndpointResolver { base_uri: base_uri.into(), host_prefix_template: None }
    }

    pub fn with_host_prefix_template(mut self, template: impl Into<String>) -> Self {
        self.host_prefix_template = Some(template.into());
        self
    }
}

impl EndpointResolver for StaticEndpointResolver {
    fn resolve(&self, params: &EndpointParams) -> Result<Endpoint, RuntimeError> {
        if let Some(override_uri) = &params.endpoint_override {
            return Ok(Endpoint::new(override_uri.clone()));
        }

        let uri = match &self.host_prefix_template {
            Some(template) => {
                let prefix = expand_host_prefix(template, &params.host_labels)?;
                prepend_host_prefix(&self.base_uri, &prefix)?
            }
            None => self.base_uri.clone(),
        };
        Ok(Endpoint::new(uri))
    }
}

/// Expands a `hostPrefix` template like `{Bucket}.` by substituting each
/// `{label}` with its value from `host_labels`. Fails if a referenced label
/// was not supplied — the trait requires every `hostLabel` member be bound.
fn expand_host_prefix(template: &str, host_labels: &HashMap<String, String>) -> Result<String, RuntimeError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' {
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            let value = host_labels.get(&name).ok_or_else(|| {
                RuntimeError::new(
                    ErrorKind::CallValidation,
                    format!("hostPrefix template references unbound label '{name}'"),
                )
            })?;
            out.push_str(value);
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

fn prepend_host_prefix(base_uri: &str, prefix: &str) -> Result<String, RuntimeError> {
    let parsed = url::Url::parse(base_uri)
        .map_err(|e| RuntimeError::new(ErrorKind::CallValidation, "invalid endpoint base URI").with_cause(e))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| RuntimeError::new(ErrorKind::CallValidation, "endpoint base URI has no host"))?;
    let mut out = parsed.clone();
    out.set_host(Some(&format!("{prefix}{host}")))
        .map_err(|_| RuntimeError::new(ErrorKind::CallValidation, "invalid host after hostPrefix expansion"))?;
    Ok(out.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_prefix_template_is_interpolated_before_the_base_host() {
        let resolver = StaticEndpointResolver::new("https://example.amazonaws.com/")
            .with_host_prefix_template("{Bucket}.");
        let mut params = EndpointParams::default();
        params.host_labels.insert("Bucket".into(), "my-bucket".into());

        let endpoint = resolver.resolve(&params).unwrap();
        assert_eq!(endpoint.uri, "https://my-bucket.example.amazonaws.com/");
    }

    #[test]
    fn explicit_override_bypasses_host_prefix_expansion() {
        let resolver = StaticEndpointResolver::new("https://example.amazonaws.com/");
        let params = EndpointParams { endpoint_override: Some("https://custom.example.com".into()), ..Default::default() };
        let endpoint = resolver.resolve(&params).unwrap();
        assert_eq!(endpoint.uri, "https://custom.example.com");
    }

    #[test]
    fn unbound_host_label_fails_resolution() {
        let resolver = StaticEndpointResolver::new("https://example.amazonaws.com/")
            .with_host_prefix_template("{Bucket}.");
        let err = resolver.resolve(&EndpointParams::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CallValidation);
    }
}
