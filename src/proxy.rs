//! Egress proxy resolution.
//!
//! An external allocation service hands out currently valid egress
//! addresses. [`ProxyResolver`] queries it with the configured secret and
//! host headers and turns the response into a proxy URL through a
//! pluggable [`ProxyParser`]. The first address offered wins.
//!
//! Parsers are picked by name in `[proxy] parser`:
//!
//! | Name | Response body | Result |
//! |------|---------------|--------|
//! | `json-list` | `[{"ip": "10.0.0.1", "port": 3128}, ...]` | `{proto}://10.0.0.1:3128` |
//! | `plain` | `10.0.0.1:3128` or a full URL | `{proto}://10.0.0.1:3128` |

use std::sync::Arc;

use serde::Deserialize;

use crate::config::ProxyConfig;
use crate::error::FetchError;

/// Turns an allocation response body into a proxy URL.
pub trait ProxyParser: Send + Sync {
    fn parse(&self, body: &[u8]) -> Result<String, FetchError>;
}

#[derive(Debug, Deserialize)]
struct ProxyEntry {
    #[serde(alias = "Ip", alias = "IP")]
    ip: String,
    #[serde(alias = "Port")]
    port: u16,
}

/// Parses a JSON list of `{ip, port}` objects.
pub struct JsonProxyListParser {
    proto: String,
}

impl JsonProxyListParser {
    pub fn new(proto: impl Into<String>) -> Self {
        Self {
            proto: proto.into(),
        }
    }
}

impl ProxyParser for JsonProxyListParser {
    fn parse(&self, body: &[u8]) -> Result<String, FetchError> {
        let entries: Vec<ProxyEntry> =
            serde_json::from_slice(body).map_err(|e| FetchError::Proxy {
                reason: format!("invalid proxy list: {}", e),
            })?;
        let first = entries.first().ok_or_else(|| FetchError::Proxy {
            reason: "no proxies offered".to_string(),
        })?;
        Ok(format!("{}://{}:{}", self.proto, first.ip, first.port))
    }
}

/// Parses a bare `host:port` line or a complete proxy URL.
pub struct PlainProxyParser {
    proto: String,
}

impl PlainProxyParser {
    pub fn new(proto: impl Into<String>) -> Self {
        Self {
            proto: proto.into(),
        }
    }
}

impl ProxyParser for PlainProxyParser {
    fn parse(&self, body: &[u8]) -> Result<String, FetchError> {
        let text = String::from_utf8_lossy(body);
        let line = text
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| FetchError::Proxy {
                reason: "empty proxy response".to_string(),
            })?;
        if line.contains("://") {
            Ok(line.to_string())
        } else {
            Ok(format!("{}://{}", self.proto, line))
        }
    }
}

/// Build the parser named in the configuration.
pub fn parser_for(config: &ProxyConfig) -> Result<Arc<dyn ProxyParser>, FetchError> {
    match config.parser.as_str() {
        "json-list" => Ok(Arc::new(JsonProxyListParser::new(&config.proto))),
        "plain" => Ok(Arc::new(PlainProxyParser::new(&config.proto))),
        other => Err(FetchError::Proxy {
            reason: format!("unknown proxy parser '{}'", other),
        }),
    }
}

/// Whether a resolved proxy URL must be dialled as SOCKS rather than as an
/// HTTP forward proxy.
pub fn is_socks(proxy_url: &str) -> bool {
    !proxy_url.starts_with("http")
}

pub struct ProxyResolver {
    client: reqwest::Client,
    config: ProxyConfig,
    parser: Arc<dyn ProxyParser>,
}

impl ProxyResolver {
    pub fn new(config: ProxyConfig) -> Result<Self, FetchError> {
        let parser = parser_for(&config)?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|source| FetchError::ClientBuild { source })?;
        Ok(Self {
            client,
            config,
            parser,
        })
    }

    pub fn with_parser(mut self, parser: Arc<dyn ProxyParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Ask the allocation service for one proxy URL.
    pub async fn resolve(&self) -> Result<String, FetchError> {
        let mut request = self.client.get(&self.config.url);
        if let (Some(key), Some(value)) = (&self.config.secret_header, &self.config.secret) {
            request = request.header(key.as_str(), value.as_str());
        }
        if let (Some(key), Some(value)) = (&self.config.host_header, &self.config.host) {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| FetchError::Proxy {
            reason: format!("allocation request failed: {}", e),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Proxy {
                reason: format!("allocation service answered {}", status),
            });
        }
        let body = response.bytes().await.map_err(|e| FetchError::Proxy {
            reason: format!("failed to read allocation response: {}", e),
        })?;

        let proxy = self.parser.parse(&body)?;
        tracing::info!(proxy = %proxy, "Selected proxy");
        Ok(proxy)
    }
}

/// `pmirror proxy`: resolve one proxy and print it.
pub async fn run_proxy(config: &crate::config::Config) -> anyhow::Result<()> {
    let proxy_config = config
        .proxy
        .clone()
        .ok_or_else(|| anyhow::anyhow!("No [proxy] section configured"))?;
    let resolver = ProxyResolver::new(proxy_config)?;
    let proxy = resolver.resolve().await?;
    println!("{}", proxy);
    println!("  kind: {}", if is_socks(&proxy) { "socks" } else { "http" });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_list_takes_first_entry() {
        let parser = JsonProxyListParser::new("http");
        let body = br#"[{"Ip": "10.1.2.3", "Port": 3128}, {"ip": "10.9.9.9", "port": 1}]"#;
        assert_eq!(parser.parse(body).unwrap(), "http://10.1.2.3:3128");
    }

    #[test]
    fn json_list_uses_configured_scheme() {
        let parser = JsonProxyListParser::new("socks5");
        let url = parser.parse(br#"[{"ip": "h", "port": 1080}]"#).unwrap();
        assert_eq!(url, "socks5://h:1080");
        assert!(is_socks(&url));
    }

    #[test]
    fn json_list_rejects_empty_and_garbage() {
        let parser = JsonProxyListParser::new("http");
        assert!(matches!(parser.parse(b"[]"), Err(FetchError::Proxy { .. })));
        assert!(matches!(parser.parse(b"nope"), Err(FetchError::Proxy { .. })));
    }

    #[test]
    fn plain_parser_accepts_host_port_or_url() {
        let parser = PlainProxyParser::new("http");
        assert_eq!(parser.parse(b"\n 1.2.3.4:8080 \n").unwrap(), "http://1.2.3.4:8080");
        assert_eq!(
            parser.parse(b"socks5h://5.6.7.8:1080").unwrap(),
            "socks5h://5.6.7.8:1080"
        );
        assert!(parser.parse(b"   ").is_err());
    }

    #[test]
    fn http_and_https_are_not_socks() {
        assert!(!is_socks("http://a:1"));
        assert!(!is_socks("https://a:1"));
        assert!(is_socks("socks5://a:1"));
    }
}
