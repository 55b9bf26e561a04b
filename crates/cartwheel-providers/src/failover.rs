//! Failover provider — wraps multiple providers in priority order.
//!
//! On error (rate limit, timeout, 5xx), falls back to the next provider in
//! the list. The first configured provider is primary.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use cartwheel_core::error::{CartwheelError, Result};

use crate::{Invocation, InvokeRequest, LlmProvider};

pub struct FailoverProvider {
    providers: Vec<Arc<dyn LlmProvider>>,
    label: String,
}

impl FailoverProvider {
    pub fn new(label: impl Into<String>, providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        Self {
            providers,
            label: label.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl LlmProvider for FailoverProvider {
    fn id(&self) -> &str {
        &self.label
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<Invocation> {
        let mut last_error = None;

        for (i, provider) in self.providers.iter().enumerate() {
            match provider.invoke(request).await {
                Ok(invocation) => {
                    if i > 0 {
                        info!(
                            provider = provider.id(),
                            attempt = i + 1,
                            agent = %request.agent,
                            "Failover succeeded"
                        );
                    }
                    return Ok(invocation);
                }
                Err(e) => {
                    warn!(
                        provider = provider.id(),
                        attempt = i + 1,
                        agent = %request.agent,
                        %e,
                        "Provider failed, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| CartwheelError::Llm("no providers configured in failover".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Usage;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedProvider {
        id: String,
        fail: bool,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(id: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                fail,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn id(&self) -> &str {
            &self.id
        }

        async fn invoke(&self, _request: &InvokeRequest) -> Result<Invocation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CartwheelError::LlmUnavailable(format!("{} down", self.id)))
            } else {
                Ok(Invocation {
                    text: format!("from {}", self.id),
                    usage: Usage::default(),
                })
            }
        }
    }

    #[tokio::test]
    async fn falls_through_to_first_healthy_provider() {
        let broken = ScriptedProvider::new("primary", true);
        let healthy = ScriptedProvider::new("backup", false);
        let failover = FailoverProvider::new(
            "chain",
            vec![broken.clone() as Arc<dyn LlmProvider>, healthy.clone()],
        );

        let out = failover
            .invoke(&InvokeRequest::new("meta_agent", "sys"))
            .await
            .unwrap();
        assert_eq!(out.text, "from backup");
        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn primary_success_skips_backups() {
        let primary = ScriptedProvider::new("primary", false);
        let backup = ScriptedProvider::new("backup", false);
        let failover =
            FailoverProvider::new("chain", vec![primary.clone() as Arc<dyn LlmProvider>, backup.clone()]);

        failover
            .invoke(&InvokeRequest::new("meta_agent", "sys"))
            .await
            .unwrap();
        assert_eq!(backup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_chain_reports_misconfiguration() {
        let failover = FailoverProvider::new("empty", vec![]);
        let err = failover
            .invoke(&InvokeRequest::new("meta_agent", "sys"))
            .await
            .unwrap_err();
        assert!(matches!(err, CartwheelError::Llm(_)));
    }
}
