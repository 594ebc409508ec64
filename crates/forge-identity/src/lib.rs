//! Identity resolution and SigV4 request signing (component C6).
//!
//! An [`IdentityResolver`] chain tries each member in priority order and
//! returns the first identity found; a signer then derives and caches SigV4
//! signing keys the way `gazette::Router` caches dialed channels — a plain
//! `std::sync::RwLock` guarding a small bounded map, not a lock-free
//! structure, since both the read and write paths are short and CPU-bound.

use std::collections::VecDeque;
use std::sync::RwLock;

use forge_error::{ErrorKind, RuntimeError};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// The outcome of one [`IdentityResolver`] attempt.
pub enum IdentityResult<I> {
    Identity(I),
    NotFound { resolver_id: String, message: String },
}

/// Resolves an identity of type `I` from some source: an environment,
/// a config file, an instance-metadata endpoint, and so on.
#[async_trait::async_trait]
pub trait IdentityResolver<I>: Send + Sync {
    fn resolver_id(&self) -> &str;
    async fn resolve(&self) -> IdentityResult<I>;
}

/// Tries each resolver in order, returning the first resolved identity.
/// `notFound` messages from every member are accumulated into the final
/// error if none resolves.
pub struct IdentityChain<I> {
    resolvers: Vec<Box<dyn IdentityResolver<I>>>,
}

impl<I> IdentityChain<I> {
    pub fn new(resolvers: Vec<Box<dyn IdentityResolver<I>>>) -> Self {
        IdentityChain { resolvers }
    }

    #[tracing::instrument(skip(self), fields(candidates = self.resolvers.len()))]
    pub async fn resolve(&self) -> Result<I, RuntimeError> {
        let mut misses = Vec::with_capacity(self.resolvers.len());
        for resolver in &self.resolvers {
            match resolver.resolve().await {
                IdentityResult::Identity(identity) => return Ok(identity),
                IdentityResult::NotFound { resolver_id, message } => {
                    misses.push(format!("{resolver_id}: {message}"));
                }
            }
        }
        Err(RuntimeError::new(
            ErrorKind::IdentityNotFound,
            format!("no identity resolver in the chain succeeded: [{}]", misses.join("; ")),
        ))
    }
}

/// AWS-style static credentials. `secret_access_key` is the only field the
/// signer needs to guard; wrapping it in [`Zeroizing`] clears it on drop,
/// the same protection `iam-auth` applies to its generated tokens.
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: Zeroizing<String>,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>, session_token: Option<String>) -> Self {
        AwsCredentials {
            access_key_id: access_key_id.into(),
            secret_access_key: Zeroizing::new(secret_access_key.into()),
            session_token,
        }
    }
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A minimal HTTP request shape the signer needs: enough to build the
/// canonical request of §4.6 without depending on a concrete transport's
/// request type.
#[derive(Debug, Clone)]
pub struct SignableRequest {
    pub method: String,
    pub canonical_path: String,
    pub query_pairs: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub body_replayable: bool,
}

/// An owned, derived `kSigning` HMAC key. Zeroized on drop so it never
/// lingers in memory past the cache entry holding it.
#[derive(Clone)]
struct SigningKey(Zeroizing<Vec<u8>>);

#[derive(Clone)]
struct CacheEntry {
    key: SigningKey,
    date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    secret_access_key: String,
    region: String,
    service: String,
}

/// A bounded FIFO cache of derived `kSigning` keys, keyed by
/// `(secretKey, region, service)` (§3's signing-cache invariant). An entry
/// is reused only if its stored date equals the date of the current
/// signing request; otherwise it is recomputed and the cache entry
/// refreshed in place (the date is part of the value, not the key, since a
/// given secret/region/service triple rotates through at most one cached
/// date at a time).
pub struct SigningCache {
    capacity: usize,
    state: RwLock<CacheState>,
}

struct CacheState {
    entries: std::collections::HashMap<CacheKey, CacheEntry>,
    insertion_order: VecDeque<CacheKey>,
}

impl SigningCache {
    pub fn new(capacity: usize) -> Self {
        SigningCache {
            capacity,
            state: RwLock::new(CacheState {
                entries: std::collections::HashMap::new(),
                insertion_order: VecDeque::new(),
            }),
        }
    }

    fn derive(secret: &str, region: &str, service: &str, date: &str) -> SigningKey {
        let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes());
        let k_region = hmac_sha256(&k_date, region.as_bytes());
        let k_service = hmac_sha256(&k_region, service.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        SigningKey(Zeroizing::new(k_signing))
    }

    /// Returns the `kSigning` bytes for `(secret, region, service, date)`,
    /// reusing a cached derivation if its date matches.
    fn signing_key(&self, secret: &str, region: &str, service: &str, date: &str) -> Vec<u8> {
        let cache_key = CacheKey {
            secret_access_key: secret.to_owned(),
            region: region.to_owned(),
            service: service.to_owned(),
        };

        if let Some(entry) = self.state.read().unwrap().entries.get(&cache_key) {
            if entry.date == date {
                return entry.key.0.to_vec();
            }
        }

        let derived = Self::derive(secret, region, service, date);
        let mut state = self.state.write().unwrap();
        // Re-check under the write lock: another writer may have refreshed
        // this exact key while we were deriving.
        if let Some(entry) = state.entries.get(&cache_key) {
            if entry.date == date {
                return entry.key.0.to_vec();
            }
        }
        let bytes = derived.0.to_vec();
        if state.entries.insert(cache_key.clone(), CacheEntry { key: derived, date: date.to_owned() }).is_none() {
            state.insertion_order.push_back(cache_key);
            while state.insertion_order.len() > self.capacity {
                if let Some(oldest) = state.insertion_order.pop_front() {
                    state.entries.remove(&oldest);
                }
            }
        }
        bytes
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// A SigV4 signer bound to one signing name, region, and key cache.
///
/// Open question (§9(a)): this implementation's policy for
/// `httpChecksumRequired` versus unsigned-payload signing is to always hash
/// the body when it is replayable (bounded, in-memory, or file-backed) and
/// fall back to the unsigned-payload sentinel only when the body is both
/// unbounded *and* non-replayable — never based on a checksum trait, since
/// the spec does not define how the two interact. See DESIGN.md.
pub struct SigV4Signer<'a> {
    pub region: &'a str,
    pub service: &'a str,
    pub cache: &'a SigningCache,
}

impl<'a> SigV4Signer<'a> {
    /// Signs `request` at instant `(date, date_time)` (`date` is `yyyymmdd`,
    /// `date_time` is `yyyymmddThhmmssZ`) with `credentials`, returning the
    /// `Authorization` header value to attach to the request.
    #[tracing::instrument(skip(self, credentials, request), fields(region = self.region, service = self.service))]
    pub fn sign(
        &self,
        credentials: &AwsCredentials,
        request: &SignableRequest,
        date: &str,
        date_time: &str,
    ) -> String {
        let payload_hash = if request.body_replayable || !request.body.is_empty() {
            sha256_hex(&request.body)
        } else {
            UNSIGNED_PAYLOAD.to_owned()
        };

        let canonical_query = canonical_query_string(&request.query_pairs);
        let (canonical_headers, signed_headers) = canonical_headers(&request.headers);
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            request.method, request.canonical_path, canonical_query, canonical_headers, signed_headers, payload_hash
        );

        let scope = format!("{date}/{}/{}/aws4_request", self.region, self.service);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{date_time}\n{scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );

        let k_signing = self.cache.signing_key(credentials.secret_access_key.as_str(), self.region, self.service, date);
        let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

        format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key_id
        )
    }
}

fn canonical_query_string(pairs: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = pairs.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn percent_encode(s: &str) -> String {
    percent_encoding::utf8_percent_encode(s, percent_encoding::NON_ALPHANUMERIC)
        .to_string()
        .replace("%2D", "-")
        .replace("%2E", ".")
        .replace("%5F", "_")
        .replace("%7E", "~")
}

fn canonical_headers(headers: &[(String, String)]) -> (String, String) {
    let mut normalized: Vec<(String, String)> = headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_owned()))
        .collect();
    normalized.sort_by(|a, b| a.0.cmp(&b.0));

    let canonical = normalized
        .iter()
        .map(|(k, v)| format!("{k}:{v}\n"))
        .collect::<Vec<_>>()
        .concat();
    let signed = normalized.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>().join(";");
    (canonical, signed)
}
