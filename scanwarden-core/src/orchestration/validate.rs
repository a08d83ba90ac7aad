use std::collections::BTreeSet;

use scanwarden_model::api::StartScanRequest;
use scanwarden_model::{ScanConfig, ScanType};
use url::Url;

use super::config::OrchestratorConfig;
use crate::error::{Result, ScanError};

const MAX_NAME_LEN: usize = 200;

/// A start request that passed every check, with defaults filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedScan {
    pub name: String,
    pub target_url: Url,
    pub config: ScanConfig,
}

pub fn validate_request(
    request: &StartScanRequest,
    defaults: &OrchestratorConfig,
) -> Result<ValidatedScan> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(ScanError::InvalidConfig("scan name must not be empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ScanError::InvalidConfig(format!(
            "scan name is longer than {MAX_NAME_LEN} characters"
        )));
    }

    let target_url = parse_target(&request.target_url)?;

    let depth = request.depth.unwrap_or(defaults.default_depth);
    if depth == 0 {
        return Err(ScanError::InvalidConfig("depth must be at least 1".into()));
    }

    let scan_types: BTreeSet<ScanType> = match &request.scan_types {
        Some(types) => types.iter().copied().collect(),
        None => [ScanType::Crawl, ScanType::Audit].into_iter().collect(),
    };
    if scan_types.is_empty() {
        return Err(ScanError::InvalidConfig(
            "at least one scan type is required".into(),
        ));
    }

    Ok(ValidatedScan {
        name: name.to_string(),
        target_url,
        config: ScanConfig {
            depth,
            scope: request.scope.unwrap_or_default(),
            scan_types,
        },
    })
}

fn parse_target(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim()).map_err(|err| {
        ScanError::InvalidConfig(format!("target_url is not an absolute URL: {err}"))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ScanError::InvalidConfig(format!(
            "target_url must use http or https, got {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ScanError::InvalidConfig("target_url has no host".into()));
    }
    url.set_fragment(None);
    Ok(url)
}
