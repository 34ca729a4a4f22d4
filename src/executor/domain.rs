// Navigation allow-list.
use url::Url;

use crate::errors::{WebClawError, WebClawResult};

/// Returns true when `url` parses, has a host, and the host matches an entry.
///
/// Entries are exact hostnames or `*.suffix`, which matches `suffix` itself and
/// any subdomain of it. Fails closed on anything it cannot parse.
pub fn is_allowed(url: &str, allow_list: &[String]) -> bool {
    match extract_host(url) {
        Some(host) => allow_list.iter().any(|entry| host_matches(&host, entry)),
        None => false,
    }
}

fn extract_host(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw.trim()).ok()?;
    let host = parsed.host_str()?;
    if host.is_empty() {
        return None;
    }
    Some(host.trim_end_matches('.').to_ascii_lowercase())
}

fn host_matches(host: &str, entry: &str) -> bool {
    let entry = entry.trim().trim_end_matches('.').to_ascii_lowercase();
    if entry.is_empty() {
        return false;
    }
    match entry.strip_prefix("*.") {
        Some(suffix) if !suffix.is_empty() => {
            host == suffix
                || host
                    .strip_suffix(suffix)
                    .is_some_and(|head| head.ends_with('.'))
        }
        Some(_) => false,
        None => host == entry,
    }
}

/// Allow-list gate run before every navigation-class action.
#[derive(Debug, Clone, Default)]
pub struct DomainGate {
    allow_list: Vec<String>,
}

impl DomainGate {
    pub fn new(allow_list: Vec<String>) -> Self {
        let allow_list = allow_list
            .into_iter()
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        Self { allow_list }
    }

    /// An empty allow-list places no host restriction.
    pub fn is_restricted(&self) -> bool {
        !self.allow_list.is_empty()
    }

    pub fn allow_list(&self) -> &[String] {
        &self.allow_list
    }

    pub fn check(&self, url: &str) -> WebClawResult<()> {
        let parsed = Url::parse(url.trim())
            .map_err(|e| WebClawError::DomainNotAllowed(format!("unparseable URL '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(WebClawError::DomainNotAllowed(format!(
                "scheme '{}' is not navigable",
                parsed.scheme()
            )));
        }
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(WebClawError::DomainNotAllowed(format!("URL '{url}' has no host")));
        }
        if self.is_restricted() && !is_allowed(url, &self.allow_list) {
            return Err(WebClawError::DomainNotAllowed(format!(
                "host of '{url}' is not in the allow-list"
            )));
        }
        Ok(())
    }
}
