use std::fs;
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};

use crate::errors::{FleetError, FleetResult};

/// Root-level tracker configuration file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(with = "humantime_serde")]
    pub scrape_interval: Duration,
    #[serde(default)]
    pub target_groups: Vec<TargetGroup>,
}

impl Config {
    pub fn load(path: &Path) -> FleetResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|err| FleetError::Config(format!("unable to parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> FleetResult<()> {
        for group in &self.target_groups {
            group.validate()?;
        }
        Ok(())
    }
}

/// Describes how to reach the sidecars of one set of nodes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetGroup {
    pub group: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub api_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_auth: Option<BearerAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_config: Option<TlsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_targets: Option<StaticTargets>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_targets: Option<FileTargets>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consul_sd_config: Option<ConsulSdConfig>,
}

fn default_scheme() -> String {
    "http".to_owned()
}

impl TargetGroup {
    fn validate(&self) -> FleetResult<()> {
        if self.group.is_empty() {
            return Err(FleetError::Config("target group missing name".to_owned()));
        }
        match self.scheme.as_str() {
            "http" | "https" => {}
            other => {
                return Err(FleetError::Config(format!(
                    "target group {}: unsupported scheme {other:?}",
                    self.group
                )))
            }
        }
        if self.basic_auth.is_some() && self.bearer_auth.is_some() {
            return Err(FleetError::Config(format!(
                "target group {}: basic_auth and bearer_auth are mutually exclusive",
                self.group
            )));
        }
        Ok(())
    }

    /// Builds the auth headers this group attaches to every probe.
    pub fn auth_headers(&self) -> FleetResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(basic) = &self.basic_auth {
            basic.apply(&mut headers)?;
        }
        if let Some(bearer) = &self.bearer_auth {
            bearer.apply(&mut headers)?;
        }
        Ok(headers)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    pub fn apply(&self, headers: &mut HeaderMap) -> FleetResult<()> {
        let credentials = format!("{}:{}", self.username, self.password);
        let value = format!("Basic {}", BASE64_ENGINE.encode(credentials));
        headers.insert(AUTHORIZATION, parse_header_value(&value)?);
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BearerAuth {
    pub token: String,
}

impl BearerAuth {
    pub fn apply(&self, headers: &mut HeaderMap) -> FleetResult<()> {
        let value = format!("Bearer {}", self.token);
        headers.insert(AUTHORIZATION, parse_header_value(&value)?);
        Ok(())
    }
}

fn parse_header_value(value: &str) -> FleetResult<HeaderValue> {
    let mut header = HeaderValue::from_str(value)
        .map_err(|err| FleetError::Config(format!("invalid auth header: {err}")))?;
    header.set_sensitive(true);
    Ok(header)
}

/// Client-side TLS material for scraping sidecars over https.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub ca_file: String,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl TlsConfig {
    /// Applies the TLS settings to a reqwest client builder.
    pub fn apply(&self, mut builder: reqwest::ClientBuilder) -> FleetResult<reqwest::ClientBuilder> {
        if self.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if !self.ca_file.is_empty() {
            let pem = fs::read(&self.ca_file)?;
            let certificate = reqwest::Certificate::from_pem(&pem)
                .map_err(|err| FleetError::Config(format!("unable to load CA cert: {err}")))?;
            builder = builder.add_root_certificate(certificate);
        }
        match (self.cert_file.is_empty(), self.key_file.is_empty()) {
            (false, true) => {
                return Err(FleetError::Config(
                    "TLS cert file given but key file missing".to_owned(),
                ))
            }
            (true, false) => {
                return Err(FleetError::Config(
                    "TLS key file given but cert file missing".to_owned(),
                ))
            }
            (false, false) => {
                let mut identity = fs::read(&self.cert_file)?;
                identity.extend_from_slice(&fs::read(&self.key_file)?);
                let identity = reqwest::Identity::from_pem(&identity).map_err(|err| {
                    FleetError::Config(format!("unable to load client cert and key: {err}"))
                })?;
                builder = builder.identity(identity);
            }
            (true, true) => {}
        }
        Ok(builder)
    }
}

/// A hardcoded list of sidecar targets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StaticTargets {
    pub targets: Vec<String>,
}

/// Targets read from a newline-separated file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileTargets {
    pub path: String,
}

/// Targets discovered through a consul catalog.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsulSdConfig {
    pub server: String,
    pub service: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub datacenter: String,
    #[serde(default)]
    pub filter: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_example_config() {
        let raw = r#"
scrape_interval: 15s
target_groups:
  - group: mainnet
    scheme: http
    static_targets:
      targets:
        - mainnet-1.example.org:13080
        - mainnet-2.example.org:13080
"#;
        let config: Config = serde_yaml::from_str(raw).expect("parse");
        assert_eq!(config.scrape_interval, Duration::from_secs(15));
        assert_eq!(config.target_groups.len(), 1);
        let group = &config.target_groups[0];
        assert_eq!(group.group, "mainnet");
        assert_eq!(group.scheme, "http");
        assert_eq!(group.api_path, "");
        assert_eq!(
            group.static_targets.as_ref().unwrap().targets,
            [
                "mainnet-1.example.org:13080",
                "mainnet-2.example.org:13080"
            ]
        );
    }

    #[test]
    fn rejects_unknown_scheme() {
        let group = TargetGroup {
            group: "test".to_owned(),
            scheme: "gopher".to_owned(),
            ..TargetGroup::default()
        };
        assert!(group.validate().is_err());
    }

    #[test]
    fn basic_auth_header_is_encoded() {
        let auth = BasicAuth {
            username: "scraper".to_owned(),
            password: "hunter2".to_owned(),
        };
        let mut headers = HeaderMap::new();
        auth.apply(&mut headers).expect("apply");
        assert_eq!(
            headers.get(AUTHORIZATION).unwrap().to_str().unwrap(),
            "Basic c2NyYXBlcjpodW50ZXIy"
        );
    }

    #[test]
    fn bearer_auth_header_is_set() {
        let auth = BearerAuth {
            token: "sesame".to_owned(),
        };
        let mut headers = HeaderMap::new();
        auth.apply(&mut headers).expect("apply");
        assert_eq!(
            headers.get(AUTHORIZATION).unwrap().to_str().unwrap(),
            "Bearer sesame"
        );
    }

    #[test]
    fn tls_requires_matching_cert_and_key() {
        let config = TlsConfig {
            cert_file: "client.pem".to_owned(),
            ..TlsConfig::default()
        };
        assert!(config.apply(reqwest::ClientBuilder::new()).is_err());
    }
}
