//! Domain registration and TLS certificate lookups.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("invalid domain: {0}")]
    InvalidDomain(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("no data for {0}")]
    NotFound(String),
}

#[async_trait]
pub trait DomainLookup: Send + Sync {
    /// Registration summary as markdown.
    async fn domain_info(&self, domain: &str) -> Result<String, LookupError>;

    /// Newest certificate summary as markdown.
    async fn certificate_info(&self, domain: &str) -> Result<String, LookupError>;
}

const DOMAIN_PATTERN: &str = r"^(?i)([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}$";

pub struct DomainValidator {
    pattern: Regex,
}

impl DomainValidator {
    pub fn new() -> Result<Self, LookupError> {
        let pattern = Regex::new(DOMAIN_PATTERN).map_err(|e| LookupError::Parse(e.to_string()))?;
        Ok(Self { pattern })
    }

    /// Lowercased domain, stripped of a scheme and path if pasted as a URL.
    pub fn normalize(&self, input: &str) -> Result<String, LookupError> {
        let host = input
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split(['/', ':', '?'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('.')
            .to_lowercase();
        if host.len() > 253 || !self.pattern.is_match(&host) {
            return Err(LookupError::InvalidDomain(input.trim().to_string()));
        }
        Ok(host)
    }
}

// ==================== RDAP ====================

#[derive(Deserialize)]
struct RdapDomain {
    #[serde(rename = "ldhName", default)]
    ldh_name: String,
    #[serde(default)]
    status: Vec<String>,
    #[serde(default)]
    events: Vec<RdapEvent>,
    #[serde(default)]
    nameservers: Vec<RdapNameserver>,
}

#[derive(Deserialize)]
struct RdapEvent {
    #[serde(rename = "eventAction")]
    action: String,
    #[serde(rename = "eventDate")]
    date: String,
}

#[derive(Deserialize)]
struct RdapNameserver {
    #[serde(rename = "ldhName", default)]
    ldh_name: String,
}

fn render_rdap(domain: &str, rdap: &RdapDomain) -> String {
    let event = |action: &str| {
        rdap.events
            .iter()
            .find(|e| e.action == action)
            .map(|e| e.date.as_str())
            .unwrap_or("-")
    };
    let name = if rdap.ldh_name.is_empty() { domain } else { rdap.ldh_name.as_str() };
    let nameservers: Vec<_> = rdap.nameservers.iter().map(|n| n.ldh_name.to_lowercase()).collect();

    format!(
        "**🌐 域名信息：{}**\n\n- 注册时间: {}\n- 到期时间: {}\n- 最后更新: {}\n- 状态: {}\n- DNS: {}",
        name.to_lowercase(),
        event("registration"),
        event("expiration"),
        event("last changed"),
        if rdap.status.is_empty() { "-".to_string() } else { rdap.status.join(", ") },
        if nameservers.is_empty() { "-".to_string() } else { nameservers.join(", ") },
    )
}

// ==================== crt.sh ====================

#[derive(Deserialize)]
struct CrtEntry {
    #[serde(default)]
    issuer_name: String,
    #[serde(default)]
    common_name: String,
    #[serde(default)]
    not_before: String,
    #[serde(default)]
    not_after: String,
}

fn render_certificate(domain: &str, entries: &[CrtEntry]) -> Option<String> {
    // ISO-8601 timestamps sort lexically.
    let newest = entries.iter().max_by(|a, b| a.not_after.cmp(&b.not_after))?;
    Some(format!(
        "**🔒 证书信息：{}**\n\n- 通用名称: {}\n- 颁发机构: {}\n- 生效时间: {}\n- 过期时间: {}",
        domain, newest.common_name, newest.issuer_name, newest.not_before, newest.not_after
    ))
}

/// RDAP (rdap.org) and certificate transparency (crt.sh) client.
pub struct PublicLookup {
    http: reqwest::Client,
    validator: DomainValidator,
    rdap_base: String,
    crt_base: String,
}

impl PublicLookup {
    pub fn new(timeout: Duration) -> Result<Self, LookupError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LookupError::Http(e.to_string()))?;
        Ok(Self {
            http,
            validator: DomainValidator::new()?,
            rdap_base: "https://rdap.org".to_string(),
            crt_base: "https://crt.sh".to_string(),
        })
    }

    async fn get_text(&self, url: &str) -> Result<String, LookupError> {
        let response = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| LookupError::Http(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(LookupError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(LookupError::Http(format!("{status} from {url}")));
        }
        response.text().await.map_err(|e| LookupError::Http(e.to_string()))
    }
}

#[async_trait]
impl DomainLookup for PublicLookup {
    async fn domain_info(&self, domain: &str) -> Result<String, LookupError> {
        let domain = self.validator.normalize(domain)?;
        info!("🌐 RDAP lookup: {}", domain);
        let text = self.get_text(&format!("{}/domain/{}", self.rdap_base, domain)).await?;
        let rdap: RdapDomain = serde_json::from_str(&text).map_err(|e| LookupError::Parse(e.to_string()))?;
        Ok(render_rdap(&domain, &rdap))
    }

    async fn certificate_info(&self, domain: &str) -> Result<String, LookupError> {
        let domain = self.validator.normalize(domain)?;
        info!("🔒 Certificate lookup: {}", domain);
        let url = format!("{}/?q={}&output=json", self.crt_base, urlencoding::encode(&domain));
        let text = self.get_text(&url).await?;
        let entries: Vec<CrtEntry> =
            serde_json::from_str(&text).map_err(|e| LookupError::Parse(e.to_string()))?;
        render_certificate(&domain, &entries).ok_or(LookupError::NotFound(domain))
    }
}
