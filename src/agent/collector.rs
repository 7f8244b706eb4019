//! Telemetry delivery.

use async_trait::async_trait;
use url::Url;

use super::report::TelemetryReport;
use crate::{Error, Result};

/// Where telemetry reports go.
///
/// Delivery is best-effort: the agent logs a failed delivery and moves on.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Deliver one report.
    async fn deliver(&self, report: TelemetryReport) -> Result<()>;
}

/// Posts reports as JSON to `<base>/v0/event`.
#[derive(Debug, Clone)]
pub struct HttpCollector {
    client: reqwest::Client,
    url: Url,
}

impl HttpCollector {
    /// A collector for the given base URL.
    pub fn new(base: &str) -> Result<Self> {
        Self::with_client(reqwest::Client::new(), base)
    }

    /// A collector sharing an existing HTTP client.
    pub fn with_client(client: reqwest::Client, base: &str) -> Result<Self> {
        Ok(Self {
            client,
            url: event_url(base)?,
        })
    }

    /// The URL reports are posted to.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ReportSink for HttpCollector {
    async fn deliver(&self, report: TelemetryReport) -> Result<()> {
        self.client
            .post(self.url.clone())
            .json(&report)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Error::Telemetry(e.to_string()))?;
        Ok(())
    }
}

/// Append `v0/event` to the base path, keeping any query string.
fn event_url(base: &str) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| Error::Telemetry(format!("invalid collector URL '{base}': {e}")))?;
    let query = url.query().map(str::to_string);
    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{path}/v0/event"));
    url.set_query(query.as_deref());
    Ok(url)
}
