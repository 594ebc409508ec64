//! The runtime's shared error taxonomy (component C12).
//!
//! Every other `forge-*` crate reports failures as a [`RuntimeError`] so that
//! callers at the top of the client pipeline or server dispatcher can make a
//! single, uniform decision about retry/throttle/fault classification instead
//! of matching on each subsystem's private error type.

use std::fmt;
use std::time::Duration;

/// A coarse classification of where a [`RuntimeError`] originated.
///
/// Mirrors the taxonomy's named kinds; grouped by subsystem rather than by a
/// single flat enum so that `match` arms at call sites read as "transport
/// problem" vs. "router problem" vs. "waiter problem".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransportConnect,
    TransportSocketTimeout,
    TransportTls,
    TransportProtocol,
    TransportGeneric,
    CallClient4xx,
    CallServer5xx,
    CallModeled,
    CallValidation,
    FramingEventStream,
    PipelineInterceptor,
    IdentityNotFound,
    RetryExhausted,
    RetryAcquisition,
    WaiterTimeout,
    WaiterUnmatchedException,
    RouterNotFound,
    RouterMethodNotAllowed,
}

impl ErrorKind {
    /// The default fault attribution for errors of this kind, absent more
    /// specific information from the caller.
    pub fn default_fault(self) -> Fault {
        use ErrorKind::*;
        match self {
            CallClient4xx | CallValidation | RouterNotFound | RouterMethodNotAllowed => {
                Fault::Client
            }
            CallServer5xx | TransportGeneric | TransportConnect | TransportTls => Fault::Server,
            _ => Fault::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TransportConnect => "transport/connect",
            ErrorKind::TransportSocketTimeout => "transport/socket-timeout",
            ErrorKind::TransportTls => "transport/tls",
            ErrorKind::TransportProtocol => "transport/protocol",
            ErrorKind::TransportGeneric => "transport/generic",
            ErrorKind::CallClient4xx => "call/client-4xx",
            ErrorKind::CallServer5xx => "call/server-5xx",
            ErrorKind::CallModeled => "call/modeled",
            ErrorKind::CallValidation => "call/validation",
            ErrorKind::FramingEventStream => "framing/event-stream",
            ErrorKind::PipelineInterceptor => "pipeline/interceptor",
            ErrorKind::IdentityNotFound => "identity/not-found",
            ErrorKind::RetryExhausted => "retry/exhausted",
            ErrorKind::RetryAcquisition => "retry/acquisition",
            ErrorKind::WaiterTimeout => "waiter/timeout",
            ErrorKind::WaiterUnmatchedException => "waiter/unmatched-exception",
            ErrorKind::RouterNotFound => "router/not-found",
            ErrorKind::RouterMethodNotAllowed => "router/method-not-allowed",
        };
        f.write_str(s)
    }
}

/// Who is responsible for a failure: the caller, the remote peer, or
/// indeterminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Client,
    Server,
    Unknown,
}

/// Whether it is safe for the pipeline to retry the call that produced this
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrySafety {
    Yes,
    No,
    Maybe,
}

impl RetrySafety {
    pub fn is_retry_safe(self) -> bool {
        matches!(self, RetrySafety::Yes | RetrySafety::Maybe)
    }
}

/// A single structured failure, carrying everything a retry loop or a caller
/// needs to decide what to do next.
///
/// `cause` is boxed as `dyn Error` rather than a generic parameter so that
/// `RuntimeError` stays a single concrete type usable across crate
/// boundaries — every `forge-*` crate's local error converts `Into<RuntimeError>`
/// at its public surface.
#[derive(Debug)]
pub struct RuntimeError {
    kind: ErrorKind,
    fault: Fault,
    retry_safe: RetrySafety,
    throttle: bool,
    retry_after: Option<Duration>,
    message: String,
    cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    schema_id: Option<String>,
    http_status: Option<u16>,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let fault = kind.default_fault();
        RuntimeError {
            kind,
            fault,
            retry_safe: RetrySafety::No,
            throttle: false,
            retry_after: None,
            message: message.into(),
            cause: None,
            schema_id: None,
            http_status: None,
        }
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = fault;
        self
    }

    pub fn with_retry_safe(mut self, retry_safe: RetrySafety) -> Self {
        self.retry_safe = retry_safe;
        self
    }

    pub fn with_throttle(mut self, throttle: bool) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_schema_id(mut self, schema_id: impl Into<String>) -> Self {
        self.schema_id = Some(schema_id.into());
        self
    }

    /// The wire status code bound to this error's shape (the `httpError`
    /// trait's value), when one was modeled. Absent for errors classified
    /// purely by [`ErrorKind`], which callers map to a status themselves.
    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn fault(&self) -> Fault {
        self.fault
    }

    pub fn is_retry_safe(&self) -> bool {
        self.retry_safe.is_retry_safe()
    }

    pub fn retry_safety(&self) -> RetrySafety {
        self.retry_safe
    }

    pub fn is_throttle(&self) -> bool {
        self.throttle
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn schema_id(&self) -> Option<&str> {
        self.schema_id.as_deref()
    }

    pub fn http_status(&self) -> Option<u16> {
        self.http_status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_fault_is_assigned_from_kind() {
        let err = RuntimeError::new(ErrorKind::RouterNotFound, "no route");
        assert_eq!(err.fault(), Fault::Client);
        assert!(!err.is_retry_safe());
    }

    #[test]
    fn display_never_leaks_cause_by_default() {
        let err = RuntimeError::new(ErrorKind::TransportGeneric, "connection reset");
        assert_eq!(err.to_string(), "transport/generic: connection reset");
    }

    #[test]
    fn retry_safety_maybe_counts_as_retry_safe() {
        assert!(RetrySafety::Maybe.is_retry_safe());
        assert!(!RetrySafety::No.is_retry_safe());
    }
}
