//! Resilient HTTP transport.
//!
//! [`Transport`] owns one lazily built `reqwest::Client` (cookie jar, fixed
//! timeout, optional proxy) together with the [`RetryState`] that tracks it,
//! and runs every GET or form POST through the [`RetryPolicy`].
//!
//! Response classification, per attempt:
//!
//! | Response | GET | POST |
//! |----------|-----|------|
//! | auth-redirect header (`X-Page: noauth.asp`) | terminal | terminal |
//! | 200 | success | success, empty body retried |
//! | 404 | logged, retried | logged, passed through |
//! | other status | retried | retried |
//! | network error | retried | retried |
//!
//! HTML bodies go through [`encoding::normalize`]; everything else is
//! returned as received. A transport is not meant to be shared between
//! concurrent fetches: give each worker its own.

use std::time::Duration;

use portal_mirror_core::models::{Download, FetchRequest, HttpMethod};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, Url};

use crate::config::{Config, HttpConfig};
use crate::encoding::{self, canonical_content_type};
use crate::error::FetchError;
use crate::proxy::{is_socks, ProxyResolver};
use crate::retry::{CancelToken, RetryPolicy, RetryState};

/// Response header and value the portal uses to send clients to its login page.
#[derive(Debug, Clone)]
pub struct AuthSentinel {
    pub header: String,
    pub value: String,
}

impl AuthSentinel {
    fn matches(&self, response: &Response) -> bool {
        response
            .headers()
            .get(self.header.as_str())
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == self.value)
    }
}

struct ClientFactory {
    timeout: Duration,
    user_agent: Option<String>,
    proxy: Option<ProxyResolver>,
}

impl ClientFactory {
    async fn build(&self) -> Result<Client, FetchError> {
        let mut builder = Client::builder().cookie_store(true).timeout(self.timeout);
        if let Some(agent) = &self.user_agent {
            builder = builder.user_agent(agent.as_str());
        }

        if let Some(resolver) = &self.proxy {
            let proxy_url = resolver.resolve().await?;
            let proxy = reqwest::Proxy::all(&proxy_url).map_err(|e| FetchError::Proxy {
                reason: format!("invalid proxy url '{}': {}", proxy_url, e),
            })?;
            if is_socks(&proxy_url) {
                tracing::debug!(proxy = %proxy_url, "Dialling through SOCKS proxy");
            } else {
                tracing::debug!(proxy = %proxy_url, "Using HTTP forward proxy");
            }
            builder = builder.proxy(proxy);
        }

        builder
            .build()
            .map_err(|source| FetchError::ClientBuild { source })
    }
}

pub struct Transport {
    factory: ClientFactory,
    policy: RetryPolicy,
    state: RetryState<Client>,
    sentinel: AuthSentinel,
    cancel: CancelToken,
}

impl Transport {
    pub fn new(http: &HttpConfig, proxy: Option<ProxyResolver>) -> Self {
        let policy = RetryPolicy::from_config(http);
        Self {
            factory: ClientFactory {
                timeout: http.timeout(),
                user_agent: http.user_agent.clone(),
                proxy,
            },
            state: policy.new_state(),
            policy,
            sentinel: AuthSentinel {
                header: http.auth_redirect_header.clone(),
                value: http.auth_redirect_value.clone(),
            },
            cancel: CancelToken::new(),
        }
    }

    /// Transport for the whole application configuration, resolving proxies
    /// when `http.use_proxy` is set.
    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        let resolver = match (&config.proxy, config.http.use_proxy) {
            (Some(proxy), true) => Some(ProxyResolver::new(proxy.clone())?),
            (None, true) => {
                return Err(FetchError::Proxy {
                    reason: "http.use_proxy is set but no [proxy] is configured".to_string(),
                })
            }
            (_, false) => None,
        };
        Ok(Self::new(&config.http, resolver))
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.state = policy.new_state();
        self.policy = policy;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn retry_state(&self) -> &RetryState<Client> {
        &self.state
    }

    /// Fetch a request with its own method and form.
    pub async fn fetch(&mut self, request: &FetchRequest) -> Result<Download, FetchError> {
        self.fetch_with(request.method, request).await
    }

    /// Fetch a request with an explicit method, overriding the request's own.
    pub async fn fetch_with(
        &mut self,
        method: HttpMethod,
        request: &FetchRequest,
    ) -> Result<Download, FetchError> {
        match method {
            HttpMethod::Get => self.get(&request.url).await,
            HttpMethod::Post => self.post(&request.url, &request.form).await,
        }
    }

    pub async fn get(&mut self, url: &str) -> Result<Download, FetchError> {
        let Transport {
            factory,
            policy,
            state,
            sentinel,
            cancel,
        } = self;
        let factory = &*factory;
        let sentinel = &*sentinel;
        policy
            .run(
                state,
                cancel,
                move || factory.build(),
                move |client| get_once(client, url, sentinel),
            )
            .await
    }

    /// Form POST; `form` is sent `application/x-www-form-urlencoded`.
    pub async fn post(
        &mut self,
        url: &str,
        form: &[(String, String)],
    ) -> Result<Download, FetchError> {
        let Transport {
            factory,
            policy,
            state,
            sentinel,
            cancel,
        } = self;
        let factory = &*factory;
        let sentinel = &*sentinel;
        policy
            .run(
                state,
                cancel,
                move || factory.build(),
                move |client| post_once(client, url, form, sentinel),
            )
            .await
    }
}

async fn get_once(client: Client, url: &str, sentinel: &AuthSentinel) -> Result<Download, FetchError> {
    tracing::debug!(url = %url, "GET");
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })?;

    let status = response.status().as_u16();
    if sentinel.matches(&response) {
        return Err(FetchError::AuthRedirect {
            url: url.to_string(),
            status,
        });
    }
    if status == 404 {
        tracing::warn!(url = %url, status, "Resource not found");
    }
    if status != 200 {
        return Err(FetchError::Status {
            url: url.to_string(),
            status,
        });
    }

    let name = file_name(response.url());
    let header_type = header_content_type(&response);
    let raw = read_body(response, url).await?;
    let (body, content_type) = decode(url, &header_type, raw)?;

    Ok(Download {
        name,
        content_type,
        body,
        status,
    })
}

async fn post_once(
    client: Client,
    url: &str,
    form: &[(String, String)],
    sentinel: &AuthSentinel,
) -> Result<Download, FetchError> {
    tracing::info!(url = %url, form = ?form, "POST");
    let response = client
        .post(url)
        .form(form)
        .send()
        .await
        .map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })?;

    let status = response.status().as_u16();
    if sentinel.matches(&response) {
        return Err(FetchError::AuthRedirect {
            url: url.to_string(),
            status,
        });
    }

    let name = file_name(response.url());
    let header_type = header_content_type(&response);

    if status == 404 {
        // Passed through: the caller decides what a missing form target means.
        tracing::warn!(url = %url, status, "Form target not found");
        return Ok(Download {
            name,
            content_type: header_type,
            body: Vec::new(),
            status,
        });
    }
    if status != 200 {
        return Err(FetchError::Status {
            url: url.to_string(),
            status,
        });
    }

    let raw = read_body(response, url).await?;
    if raw.is_empty() {
        return Err(FetchError::EmptyBody {
            url: url.to_string(),
        });
    }
    let (body, content_type) = decode(url, &header_type, raw)?;

    Ok(Download {
        name,
        content_type,
        body,
        status,
    })
}

fn header_content_type(response: &Response) -> String {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(canonical_content_type)
        .unwrap_or_default()
}

async fn read_body(response: Response, url: &str) -> Result<Vec<u8>, FetchError> {
    response
        .bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })
}

fn decode(url: &str, header_type: &str, raw: Vec<u8>) -> Result<(Vec<u8>, String), FetchError> {
    if encoding::is_html(header_type) {
        encoding::normalize(header_type, &raw).map_err(|reason| FetchError::Decode {
            url: url.to_string(),
            reason,
        })
    } else {
        Ok((raw, header_type.to_string()))
    }
}

/// Last non-empty path segment of the final (post-redirect) URL, query
/// string included.
pub fn file_name(url: &Url) -> String {
    let segment = url
        .path()
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .or_else(|| url.host_str())
        .unwrap_or_default();
    match url.query() {
        Some(query) => format!("{}?{}", segment, query),
        None => segment.to_string(),
    }
}
