//! Scripted provider for tests. Each call to `submit` plays back the next
//! scripted event sequence; requests are captured for assertions.

use crate::errors::{PryxError, PryxResult};
use crate::providers::base::{
    EVENT_CHANNEL_CAPACITY, LlmProvider, ProviderEvent, ProviderRequest,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct MockProvider {
    scripts: Mutex<VecDeque<Vec<ProviderEvent>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    /// Delay between scripted events, for cancellation tests.
    pub event_delay: std::time::Duration,
}

impl MockProvider {
    pub fn new(scripts: Vec<Vec<ProviderEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            event_delay: std::time::Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.event_delay = delay;
        self
    }

    /// Requests observed so far, in submission order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }

    async fn submit(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> PryxResult<mpsc::Receiver<ProviderEvent>> {
        {
            let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            requests.push(request);
        }
        let script = {
            let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
            scripts.pop_front()
        };
        let Some(script) = script else {
            return Err(PryxError::Provider {
                message: "mock provider exhausted".into(),
                retryable: false,
            });
        };

        let delay = self.event_delay;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            for event in script {
                if !delay.is_zero() {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}
