//! Mid-run block detection for web origins.
//!
//! A monitor records how an origin answers for its root page and a random
//! missing page, then re-checks on a jittered interval. A changed root page
//! (status or body) or a changed status for the missing page is reported to
//! the [`AdaptiveController`] as a block signal, and the monitor stops.

use super::errors::EngineError;
use super::events::{Event, EventSender};
use super::policy::AdaptiveController;
use crate::config::{DelayRange, EngineConfig};
use async_trait::async_trait;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RANDOM_PATH_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub body_hash: Vec<u8>,
}

impl ProbeResponse {
    pub fn new(status: u16, body: &[u8]) -> Self {
        Self {
            status,
            body_hash: Sha256::digest(body).to_vec(),
        }
    }
}

/// One GET without following redirects. `None` when the request failed.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn fetch(&self, url: &str) -> Option<ProbeResponse>;
}

pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(config.scan.user_agent.clone());
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| EngineError::ConfigInvalid(format!("proxy '{}': {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| EngineError::ConfigInvalid(format!("http client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn fetch(&self, url: &str) -> Option<ProbeResponse> {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Health check request to {} failed: {}", url, e);
                return None;
            }
        };
        let status = response.status().as_u16();
        let body = response.bytes().await.ok()?;
        Some(ProbeResponse::new(status, &body))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Baseline {
    pub root: ProbeResponse,
    pub missing: ProbeResponse,
}

pub struct HealthMonitor {
    probe: Arc<dyn HealthProbe>,
    origin: String,
    interval: DelayRange,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn HealthProbe>, origin: &str, interval: DelayRange) -> Self {
        Self {
            probe,
            origin: origin.trim_end_matches('/').to_string(),
            interval,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn root_url(&self) -> String {
        format!("{}/", self.origin)
    }

    fn missing_url(&self) -> String {
        let mut rng = rand::thread_rng();
        let path: String = (0..RANDOM_PATH_LEN)
            .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
            .collect();
        format!("{}/{}", self.origin, path)
    }

    pub async fn baseline(&self) -> Option<Baseline> {
        let root = self.probe.fetch(&self.root_url()).await?;
        let missing = self.probe.fetch(&self.missing_url()).await?;
        Some(Baseline { root, missing })
    }

    /// Describe how the origin now differs from `baseline`, if it does.
    /// Failed requests say nothing either way.
    pub async fn check(&self, baseline: &Baseline) -> Option<String> {
        let root = self.probe.fetch(&self.root_url()).await?;
        if root.status != baseline.root.status {
            return Some(format!(
                "{} root page status {} -> {}",
                self.origin, baseline.root.status, root.status
            ));
        }
        if root.body_hash != baseline.root.body_hash {
            return Some(format!(
                "{} root page body changed (status {})",
                self.origin, root.status
            ));
        }
        let missing = self.probe.fetch(&self.missing_url()).await?;
        (missing.status != baseline.missing.status).then(|| {
            format!(
                "{} missing-page status {} -> {}",
                self.origin, baseline.missing.status, missing.status
            )
        })
    }

    /// Watch until `stop` fires or a change is seen.
    pub async fn watch(
        self,
        controller: Arc<AdaptiveController>,
        events: Option<EventSender>,
        stop: CancellationToken,
    ) {
        let baseline = tokio::select! {
            baseline = self.baseline() => baseline,
            _ = stop.cancelled() => return,
        };
        let Some(baseline) = baseline else {
            tracing::warn!("Health check: no baseline for {}, not monitoring", self.origin);
            return;
        };
        tracing::debug!(origin = %self.origin, "Health check baseline: {:?}", baseline);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval.sample()) => {}
                _ = stop.cancelled() => return,
            }
            let change = tokio::select! {
                change = self.check(&baseline) => change,
                _ = stop.cancelled() => return,
            };
            let Some(reason) = change else {
                continue;
            };
            if let Some(policy) = controller.record_block_signal(&reason) {
                if let Some(tx) = &events {
                    let _ = tx.send(Event::PolicyChanged {
                        revision: policy.revision,
                        reason: format!("block detected: {}", reason),
                        safe_mode: policy.safe_mode,
                        concurrency: policy.concurrency_limit,
                    });
                }
            }
            return;
        }
    }
}
