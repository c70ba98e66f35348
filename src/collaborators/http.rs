//! HTTP probe detector.
//!
//! Repeatedly requests each target endpoint across the observation window
//! and turns transport failures, error statuses and obviously broken HTML
//! into [`Defect`]s. It cannot see in-page script errors; deployments that
//! need those plug in a browser-driven [`Detector`] instead.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use tokio::time::Instant;
use tracing::debug;

use super::{Defect, DefectCategory, Detector, Severity};

/// Default spacing between probe rounds inside one window.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct HttpProbeDetector {
    client: Client,
    probe_interval: Duration,
}

impl HttpProbeDetector {
    /// Create a detector whose individual requests time out after `request_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("mender/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self {
            client,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        })
    }

    #[must_use]
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    async fn probe(&self, target: &str) -> Vec<Defect> {
        let response = match self.client.get(target).send().await {
            Ok(response) => response,
            Err(e) => {
                let message = if e.is_timeout() {
                    format!("request to {target} timed out")
                } else {
                    format!("request to {target} failed: {e}")
                };
                return vec![Defect::new(DefectCategory::Network, message)
                    .with_severity(Severity::Critical)
                    .with_location(target)];
            }
        };

        let status = response.status();
        let is_html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/html"));
        let body = if is_html {
            response.text().await.unwrap_or_default()
        } else {
            String::new()
        };

        classify_response(target, status, is_html, &body)
    }
}

/// Turn one HTTP response into zero or more defects.
pub fn classify_response(target: &str, status: StatusCode, is_html: bool, body: &str) -> Vec<Defect> {
    let mut defects = Vec::new();

    if status.is_server_error() {
        defects.push(
            Defect::new(DefectCategory::Network, format!("GET {target} returned {status}"))
                .with_severity(Severity::High)
                .with_location(target),
        );
        return defects;
    }
    if status.is_client_error() {
        defects.push(
            Defect::new(DefectCategory::Network, format!("GET {target} returned {status}"))
                .with_location(target),
        );
        return defects;
    }

    if is_html {
        let lower = body.to_lowercase();
        if lower.trim().is_empty() {
            defects.push(
                Defect::new(DefectCategory::Markup, format!("{target} served an empty document"))
                    .with_location(target),
            );
        } else if !lower.contains("<title") {
            defects.push(
                Defect::new(DefectCategory::Usability, format!("{target} has no <title>"))
                    .with_severity(Severity::Low)
                    .with_location(target)
                    .with_remediable(false),
            );
        }
    }

    defects
}

#[async_trait]
impl Detector for HttpProbeDetector {
    fn name(&self) -> &str {
        "http-probe"
    }

    async fn detect(&self, targets: &[String], window: Duration) -> Result<Vec<Defect>> {
        let deadline = Instant::now() + window;
        let mut defects: Vec<Defect> = Vec::new();
        let mut rounds = 0u32;

        loop {
            rounds += 1;
            for target in targets {
                for defect in self.probe(target).await {
                    if !defects.contains(&defect) {
                        defects.push(defect);
                    }
                }
            }

            if Instant::now() + self.probe_interval >= deadline {
                break;
            }
            tokio::time::sleep(self.probe_interval).await;
        }

        debug!(rounds, count = defects.len(), "HTTP probe window finished");
        Ok(defects)
    }
}
