//! The interceptor chain (component C8, §4.8): nineteen named hook points
//! spanning one operation invocation, each either a `read*` (observe only)
//! or `modify*` (observe and replace) stage.
//!
//! A single generic [`Interceptor`] trait carries all nineteen methods with
//! no-op default bodies, the same shape `tower::Layer` middleware takes in
//! this codebase's HTTP-facing crates: implementors override only the
//! hooks they care about. [`InterceptorChain`] then drives registration
//! order for every hook except the `readAfter*` family, which runs in
//! *reverse* registration order: symmetric unwind, like a stack of RAII
//! guards.

use std::sync::Arc;

use forge_error::RuntimeError;

use crate::transport::{HttpRequest, HttpResponse};

/// The mutable state threaded through one invocation's interceptor hooks.
/// Fields become `Some` as the pipeline progresses past the stage that
/// produces them; a `modify*` hook may replace its stage's field, a
/// `read*` hook may only inspect.
pub struct InterceptorContext<I, O> {
    pub input: Option<I>,
    pub request: Option<HttpRequest>,
    pub response: Option<HttpResponse>,
    pub output: Option<Result<O, RuntimeError>>,
    /// Property bag for interceptors to pass data between their own hooks
    /// across an attempt or the whole execution (§4.8's "interceptor
    /// context" property store).
    pub properties: forge_context::Context,
}

impl<I, O> InterceptorContext<I, O> {
    pub fn new(input: I) -> Self {
        InterceptorContext {
            input: Some(input),
            request: None,
            response: None,
            output: None,
            properties: forge_context::Context::new(),
        }
    }
}

/// One of the nineteen hooks named in §4.8. Every method defaults to a
/// no-op so implementors override only what they need; `modify*` hooks
/// return `Result` so a rejected mutation can fail the execution, `read*`
/// hooks return `Result<()>` for the same reason (a logging interceptor
/// that fails to flush should be able to fail the call).
#[async_trait::async_trait]
pub trait Interceptor<I, O>: Send + Sync {
    async fn read_before_execution(&self, _ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn modify_before_serialization(&self, _ctx: &mut InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn read_before_serialization(&self, _ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn read_after_serialization(&self, _ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn modify_before_retry_loop(&self, _ctx: &mut InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn read_before_attempt(&self, _ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn modify_before_signing(&self, _ctx: &mut InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn read_before_signing(&self, _ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn read_after_signing(&self, _ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn modify_before_transmit(&self, _ctx: &mut InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn read_before_transmit(&self, _ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn read_after_transmit(&self, _ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn modify_before_deserialization(&self, _ctx: &mut InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn read_before_deserialization(&self, _ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn read_after_deserialization(&self, _ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn modify_before_attempt_completion(&self, _ctx: &mut InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn read_after_attempt(&self, _ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn modify_before_completion(&self, _ctx: &mut InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        Ok(())
    }
    async fn read_after_execution(&self, _ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Drives a registered list of interceptors through the nineteen hooks in
/// the order §4.8 requires: `modify*`/`readBefore*`/mid-stage `read*` hooks
/// fire in registration order; `readAfter*` hooks fire in reverse
/// registration order, so the last interceptor to see a request is the
/// first to see its response.
#[derive(Clone, Default)]
pub struct InterceptorChain<I, O> {
    interceptors: Vec<Arc<dyn Interceptor<I, O>>>,
}

impl<I, O> InterceptorChain<I, O> {
    pub fn new() -> Self {
        InterceptorChain { interceptors: Vec::new() }
    }

    pub fn register(mut self, interceptor: Arc<dyn Interceptor<I, O>>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub async fn read_before_execution(&self, ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        for i in &self.interceptors {
            i.read_before_execution(ctx).await?;
        }
        Ok(())
    }

    pub async fn modify_before_serialization(&self, ctx: &mut InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        for i in &self.interceptors {
            i.modify_before_serialization(ctx).await?;
        }
        Ok(())
    }

    pub async fn read_before_serialization(&self, ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        for i in &self.interceptors {
            i.read_before_serialization(ctx).await?;
        }
        Ok(())
    }

    pub async fn read_after_serialization(&self, ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        for i in self.interceptors.iter().rev() {
            i.read_after_serialization(ctx).await?;
        }
        Ok(())
    }

    pub async fn modify_before_retry_loop(&self, ctx: &mut InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        for i in &self.interceptors {
            i.modify_before_retry_loop(ctx).await?;
        }
        Ok(())
    }

    pub async fn read_before_attempt(&self, ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        for i in &self.interceptors {
            i.read_before_attempt(ctx).await?;
        }
        Ok(())
    }

    pub async fn modify_before_signing(&self, ctx: &mut InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        for i in &self.interceptors {
            i.modify_before_signing(ctx).await?;
        }
        Ok(())
    }

    pub async fn read_before_signing(&self, ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        for i in &self.interceptors {
            i.read_before_signing(ctx).await?;
        }
        Ok(())
    }

    pub async fn read_after_signing(&self, ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        for i in self.interceptors.iter().rev() {
            i.read_after_signing(ctx).await?;
        }
        Ok(())
    }

    pub async fn modify_before_transmit(&self, ctx: &mut InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        for i in &self.interceptors {
            i.modify_before_transmit(ctx).await?;
        }
        Ok(())
    }

    pub async fn read_before_transmit(&self, ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        for i in &self.interceptors {
            i.read_before_transmit(ctx).await?;
        }
        Ok(())
    }

    pub async fn read_after_transmit(&self, ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        for i in self.interceptors.iter().rev() {
            i.read_after_transmit(ctx).await?;
        }
        Ok(())
    }

    pub async fn modify_before_deserialization(&self, ctx: &mut InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        for i in &self.interceptors {
            i.modify_before_deserialization(ctx).await?;
        }
        Ok(())
    }

    pub async fn read_before_deserialization(&self, ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        for i in &self.interceptors {
            i.read_before_deserialization(ctx).await?;
        }
        Ok(())
    }

    pub async fn read_after_deserialization(&self, ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        for i in self.interceptors.iter().rev() {
            i.read_after_deserialization(ctx).await?;
        }
        Ok(())
    }

    pub async fn modify_before_attempt_completion(&self, ctx: &mut InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        for i in &self.interceptors {
            i.modify_before_attempt_completion(ctx).await?;
        }
        Ok(())
    }

    pub async fn read_after_attempt(&self, ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        for i in self.interceptors.iter().rev() {
            i.read_after_attempt(ctx).await?;
        }
        Ok(())
    }

    pub async fn modify_before_completion(&self, ctx: &mut InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        for i in &self.interceptors {
            i.modify_before_completion(ctx).await?;
        }
        Ok(())
    }

    pub async fn read_after_execution(&self, ctx: &InterceptorContext<I, O>) -> Result<(), RuntimeError> {
        for i in self.interceptors.iter().rev() {
            i.read_after_execution(ctx).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Interceptor<(), ()> for Recorder {
        async fn read_before_execution(&self, _ctx: &InterceptorContext<(), ()>) -> Result<(), RuntimeError> {
            self.log.lock().unwrap().push(format!("{}:before", self.name));
            Ok(())
        }
        async fn read_after_execution(&self, _ctx: &InterceptorContext<(), ()>) -> Result<(), RuntimeError> {
            self.log.lock().unwrap().push(format!("{}:after", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn before_hooks_run_in_registration_order_after_hooks_run_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = InterceptorChain::new()
            .register(Arc::new(Recorder { name: "a", log: log.clone() }))
            .register(Arc::new(Recorder { name: "b", log: log.clone() }));

        let ctx = InterceptorContext::new(());
        chain.read_before_execution(&ctx).await.unwrap();
        chain.read_after_execution(&ctx).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["a:before", "b:before", "b:after", "a:after"]);
    }

    struct Rejector;
    #[async_trait::async_trait]
    impl Interceptor<(), ()> for Rejector {
        async fn modify_before_serialization(&self, _ctx: &mut InterceptorContext<(), ()>) -> Result<(), RuntimeError> {
            Err(RuntimeError::new(forge_error::ErrorKind::PipelineInterceptor, "rejected"))
        }
    }

    #[tokio::test]
    async fn a_failing_modify_hook_short_circuits_the_chain() {
        let chain = InterceptorChain::new().register(Arc::new(Rejector));
        let mut ctx = InterceptorContext::new(());
        let err = chain.modify_before_serialization(&mut ctx).await.unwrap_err();
        assert_eq!(err.kind(), forge_error::ErrorKind::PipelineInterceptor);
    }
}
