//! OWASP ZAP adapter over its JSON API.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use scanwarden_model::{Confidence, ExternalJobRef, ScanScope, Severity};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::{
    AlertBatch, EngineAlert, EngineError, EngineStatus, ScannerEngine,
    TargetSubmission,
};

const API_KEY_HEADER: &str = "X-ZAP-API-Key";
const DEFAULT_REMEDIATION: &str = "No remediation provided";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ZapEngineConfig {
    /// Base URL of the ZAP API, e.g. `http://zap:8080`.
    pub base_url: String,
    /// Sent as `X-ZAP-API-Key` when present.
    pub api_key: Option<String>,
    /// Upper bound on a single API call, connect time included.
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Alerts requested per `core/view/alerts` page.
    pub alert_page_size: u32,
    /// Spider `maxChildren`; 0 leaves it unlimited.
    pub max_children: u32,
}

impl Default for ZapEngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://zap:8080".to_string(),
            api_key: None,
            request_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            alert_page_size: 500,
            max_children: 0,
        }
    }
}

pub struct ZapEngine {
    http: reqwest::Client,
    config: ZapEngineConfig,
}

impl fmt::Debug for ZapEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZapEngine")
            .field("base_url", &self.config.base_url)
            .field("api_key", &self.config.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ZapErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScanStarted {
    scan: String,
}

#[derive(Debug, Deserialize)]
struct ScanStatus {
    status: String,
}

#[derive(Debug, Deserialize)]
struct RecordsToScan {
    #[serde(rename = "recordsToScan")]
    records_to_scan: String,
}

#[derive(Debug, Deserialize)]
struct ContextCreated {
    #[serde(rename = "contextId")]
    context_id: String,
}

#[derive(Debug, Deserialize)]
struct ContextView {
    context: ContextDetails,
}

#[derive(Debug, Deserialize)]
struct ContextDetails {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AlertCount {
    #[serde(rename = "numberOfAlerts")]
    number_of_alerts: String,
}

#[derive(Debug, Deserialize)]
struct ActionResult {
    #[serde(rename = "Result")]
    result: String,
}

#[derive(Debug, Deserialize)]
struct AlertsPage {
    #[serde(default)]
    alerts: Vec<ZapAlert>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ZapAlert {
    id: String,
    #[serde(rename = "pluginId")]
    plugin_id: String,
    name: String,
    alert: String,
    risk: String,
    confidence: String,
    url: String,
    description: String,
    solution: String,
    param: String,
    evidence: String,
    cweid: String,
}

impl ZapEngine {
    pub fn new(config: ZapEngineConfig) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|err| {
                EngineError::Unavailable(format!(
                    "failed to build HTTP client: {err}"
                ))
            })?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ZapEngineConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> Result<Url, EngineError> {
        let base = self.config.base_url.trim_end_matches('/');
        Url::parse(&format!("{base}/JSON/{path}/")).map_err(|err| {
            EngineError::Rejected(format!("invalid engine endpoint {path}: {err}"))
        })
    }

    async fn get_json<T>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, EngineError>
    where
        T: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let mut request = self.http.get(url).query(query);
        if let Some(key) = &self.config.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|err| {
                EngineError::Rejected(format!(
                    "unexpected payload from {path}: {err}"
                ))
            });
        }

        let body = response.json::<ZapErrorBody>().await.ok();
        let message = body
            .as_ref()
            .and_then(|body| body.message.clone().or_else(|| body.code.clone()))
            .unwrap_or_else(|| format!("{path} failed with status {status}"));

        if status.is_server_error() {
            Err(EngineError::Unavailable(message))
        } else if body
            .as_ref()
            .and_then(|body| body.code.as_deref())
            .is_some_and(|code| code == "already_exists")
        {
            Err(EngineError::Rejected(format!("already_exists: {message}")))
        } else {
            Err(EngineError::Rejected(message))
        }
    }

    async fn action(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<(), EngineError> {
        let result: ActionResult = self.get_json(path, query).await?;
        if result.result.eq_ignore_ascii_case("OK") {
            Ok(())
        } else {
            Err(EngineError::Rejected(format!(
                "{path} returned {}",
                result.result
            )))
        }
    }

    async fn scan_percent(
        &self,
        component: &str,
        scan_id: &str,
    ) -> Result<u8, EngineError> {
        let status: ScanStatus = self
            .get_json(
                &format!("{component}/view/status"),
                &[("scanId", scan_id)],
            )
            .await?;
        parse_percent(&status.status)
    }

    async fn lookup_context_id(&self, name: &str) -> Result<String, EngineError> {
        let view: ContextView = self
            .get_json("context/view/context", &[("contextName", name)])
            .await?;
        Ok(view.context.id)
    }

    /// The sub-task currently doing work: audit once it exists, else crawl.
    fn current_task<'a>(
        job: &'a ExternalJobRef,
    ) -> Result<(&'static str, &'a str), EngineError> {
        match (&job.audit_ref, &job.crawl_ref) {
            (Some(audit), _) => Ok(("ascan", audit.as_str())),
            (None, Some(crawl)) => Ok(("spider", crawl.as_str())),
            (None, None) => Err(EngineError::Rejected(format!(
                "no engine task started for {}",
                job.target_ref
            ))),
        }
    }
}

pub(crate) fn context_name(submission: &TargetSubmission) -> String {
    format!("scanwarden-{}", submission.scan_job_id.as_uuid().simple())
}

/// Inclusion regex for the engine context, derived from scope.
pub fn scope_regex(target: &Url, scope: ScanScope) -> String {
    let host = regex::escape(target.host_str().unwrap_or_default());
    match scope {
        ScanScope::Path => {
            let path = target.path();
            let prefix = match path.rfind('/') {
                Some(idx) => &path[..=idx],
                None => "/",
            };
            let origin = target.origin().ascii_serialization();
            format!("^{}{}.*", regex::escape(&origin), regex::escape(prefix))
        }
        ScanScope::Domain => format!(r"^https?://{host}(:\d+)?(/.*)?$"),
        ScanScope::Subdomain => {
            format!(r"^https?://([^/?#]+\.)?{host}(:\d+)?(/.*)?$")
        }
    }
}

pub(crate) fn map_risk(risk: &str) -> Severity {
    match risk.trim().to_ascii_lowercase().as_str() {
        "high" => Severity::High,
        "medium" => Severity::Medium,
        "low" => Severity::Low,
        "informational" | "info" => Severity::Info,
        other => {
            debug!(risk = other, "unknown engine risk, treating as info");
            Severity::Info
        }
    }
}

pub(crate) fn map_confidence(confidence: &str) -> Confidence {
    match confidence.trim().to_ascii_lowercase().as_str() {
        "confirmed" | "high" => Confidence::Certain,
        "medium" => Confidence::Firm,
        "low" | "false positive" => Confidence::Tentative,
        _ => Confidence::Firm,
    }
}

fn parse_percent(raw: &str) -> Result<u8, EngineError> {
    raw.trim()
        .parse::<u16>()
        .map(|value| value.min(100) as u8)
        .map_err(|_| EngineError::Rejected(format!("invalid progress value {raw:?}")))
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl From<ZapAlert> for EngineAlert {
    fn from(alert: ZapAlert) -> Self {
        let alert_id = if alert.id.is_empty() {
            format!("{}:{}:{}", alert.plugin_id, alert.url, alert.param)
        } else {
            alert.id
        };
        let name = if alert.name.is_empty() {
            alert.alert
        } else {
            alert.name
        };
        EngineAlert {
            alert_id,
            name,
            severity: map_risk(&alert.risk),
            confidence: map_confidence(&alert.confidence),
            url: alert.url,
            description: alert.description,
            remediation: non_empty(alert.solution)
                .unwrap_or_else(|| DEFAULT_REMEDIATION.to_string()),
            parameter: non_empty(alert.param),
            evidence: non_empty(alert.evidence),
            cwe_id: alert.cweid.trim().parse::<i32>().ok().filter(|id| *id > 0),
        }
    }
}

#[async_trait]
impl ScannerEngine for ZapEngine {
    async fn submit_target(
        &self,
        submission: &TargetSubmission,
    ) -> Result<ExternalJobRef, EngineError> {
        let name = context_name(submission);
        let context_id = match self
            .get_json::<ContextCreated>(
                "context/action/newContext",
                &[("contextName", name.as_str())],
            )
            .await
        {
            Ok(created) => created.context_id,
            Err(EngineError::Rejected(msg)) if msg.starts_with("already_exists") => {
                debug!(context = %name, "engine context already exists, reusing");
                self.lookup_context_id(&name).await?
            }
            Err(err) => return Err(err),
        };

        let regex = scope_regex(&submission.target_url, submission.scope);
        self.action(
            "context/action/includeInContext",
            &[("contextName", name.as_str()), ("regex", regex.as_str())],
        )
        .await?;

        Ok(ExternalJobRef::new(name).with_context_id(context_id))
    }

    async fn alert_count(&self, target_url: &Url) -> Result<u64, EngineError> {
        let count: AlertCount = self
            .get_json("core/view/numberOfAlerts", &[("baseurl", target_url.as_str())])
            .await?;
        count.number_of_alerts.trim().parse::<u64>().map_err(|_| {
            EngineError::Rejected(format!(
                "invalid alert count {:?}",
                count.number_of_alerts
            ))
        })
    }

    async fn start_crawl(
        &self,
        job: &ExternalJobRef,
        target_url: &Url,
        depth: u32,
        scope: ScanScope,
    ) -> Result<String, EngineError> {
        let depth = depth.to_string();
        if let Err(err) = self
            .action("spider/action/setOptionMaxDepth", &[("Integer", depth.as_str())])
            .await
        {
            match err {
                EngineError::Rejected(msg) => {
                    warn!(error = %msg, "engine refused crawl depth, using its default");
                }
                unavailable => return Err(unavailable),
            }
        }

        let max_children = self.config.max_children.to_string();
        let subtree_only = if scope == ScanScope::Path { "true" } else { "false" };
        let started: ScanStarted = self
            .get_json(
                "spider/action/scan",
                &[
                    ("url", target_url.as_str()),
                    ("maxChildren", max_children.as_str()),
                    ("recurse", "true"),
                    ("contextName", job.target_ref.as_str()),
                    ("subtreeOnly", subtree_only),
                ],
            )
            .await?;
        Ok(started.scan)
    }

    /// Active scan limited to the job's context.
    async fn start_audit(
        &self,
        job: &ExternalJobRef,
        target_url: &Url,
    ) -> Result<String, EngineError> {
        let context_id = match &job.context_id {
            Some(id) => id.clone(),
            None => self.lookup_context_id(&job.target_ref).await?,
        };
        let started: ScanStarted = self
            .get_json(
                "ascan/action/scan",
                &[
                    ("url", target_url.as_str()),
                    ("recurse", "true"),
                    ("inScopeOnly", "true"),
                    ("contextId", context_id.as_str()),
                ],
            )
            .await?;
        Ok(started.scan)
    }

    async fn status(
        &self,
        job: &ExternalJobRef,
    ) -> Result<EngineStatus, EngineError> {
        let crawl_percent = match &job.crawl_ref {
            Some(scan_id) => Some(self.scan_percent("spider", scan_id).await?),
            None => None,
        };
        let audit_percent = match &job.audit_ref {
            Some(scan_id) => Some(self.scan_percent("ascan", scan_id).await?),
            None => None,
        };
        let records: RecordsToScan =
            self.get_json("pscan/view/recordsToScan", &[]).await?;
        let passive_backlog =
            records.records_to_scan.trim().parse::<u64>().ok();

        Ok(EngineStatus {
            crawl_percent,
            audit_percent,
            passive_backlog,
        })
    }

    async fn alerts(
        &self,
        _job: &ExternalJobRef,
        target_url: &Url,
        cursor: Option<u64>,
    ) -> Result<AlertBatch, EngineError> {
        let start = cursor.unwrap_or(0);
        let start_param = start.to_string();
        let count_param = self.config.alert_page_size.max(1).to_string();
        let page: AlertsPage = self
            .get_json(
                "core/view/alerts",
                &[
                    ("baseurl", target_url.as_str()),
                    ("start", start_param.as_str()),
                    ("count", count_param.as_str()),
                ],
            )
            .await?;

        let fetched = page.alerts.len() as u64;
        Ok(AlertBatch {
            has_more: fetched >= u64::from(self.config.alert_page_size.max(1)),
            next_cursor: Some(start + fetched),
            alerts: page.alerts.into_iter().map(EngineAlert::from).collect(),
        })
    }

    async fn pause(&self, job: &ExternalJobRef) -> Result<(), EngineError> {
        let (component, scan_id) = Self::current_task(job)?;
        self.action(&format!("{component}/action/pause"), &[("scanId", scan_id)])
            .await
    }

    async fn resume(&self, job: &ExternalJobRef) -> Result<(), EngineError> {
        let (component, scan_id) = Self::current_task(job)?;
        self.action(&format!("{component}/action/resume"), &[("scanId", scan_id)])
            .await
    }

    async fn stop(&self, job: &ExternalJobRef) -> Result<(), EngineError> {
        let mut first_error = None;
        let tasks = [("ascan", &job.audit_ref), ("spider", &job.crawl_ref)];
        for (component, scan_ref) in tasks {
            let Some(scan_id) = scan_ref else { continue };
            if let Err(err) = self
                .action(&format!("{component}/action/stop"), &[("scanId", scan_id)])
                .await
            {
                warn!(component, scan_id = %scan_id, error = %err, "engine stop failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
