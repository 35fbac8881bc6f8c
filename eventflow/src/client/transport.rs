//! Request/response seam between the apps client and the network.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::errors::EngineResult;

/// HTTP method used to call a peer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// GET with query arguments.
    Get,
    /// POST with a JSON body.
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
        }
    }
}

/// One outgoing call.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Headers to send.
    pub headers: Vec<(String, String)>,
    /// Query arguments.
    pub query: Vec<(String, String)>,
    /// JSON body for POST.
    pub body: Option<Value>,
    /// Deadline for the whole call.
    pub timeout: Duration,
}

/// A peer's answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientResponse {
    /// Status code.
    pub status: u16,
    /// Body parsed as JSON, or a JSON string when it is not JSON.
    pub body: Value,
}

impl ClientResponse {
    /// Creates a response.
    #[must_use]
    pub const fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// 2xx or 3xx.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status < 400
    }

    /// 4xx: the peer rejected the request itself.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        self.status >= 400 && self.status < 500
    }

    /// 5xx: the host failed.
    #[must_use]
    pub const fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

/// Sends requests. Network failures are returned as transport errors.
#[async_trait]
pub trait ClientTransport: Send + Sync + fmt::Debug {
    /// Performs one call.
    async fn send(&self, request: ClientRequest) -> EngineResult<ClientResponse>;
}

#[cfg(feature = "http-client")]
pub use self::http::ReqwestTransport;

#[cfg(feature = "http-client")]
mod http {
    use async_trait::async_trait;
    use serde_json::Value;

    use super::{ClientRequest, ClientResponse, ClientTransport, Method};
    use crate::errors::{EngineError, EngineResult};

    /// [`ClientTransport`] backed by a shared `reqwest::Client`.
    #[derive(Debug, Clone, Default)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        /// Creates a transport with a default client.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Creates a transport over an existing client.
        #[must_use]
        pub const fn with_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    #[async_trait]
    impl ClientTransport for ReqwestTransport {
        async fn send(&self, request: ClientRequest) -> EngineResult<ClientResponse> {
            let mut builder = match request.method {
                Method::Get => self.client.get(&request.url),
                Method::Post => self.client.post(&request.url),
            }
            .timeout(request.timeout)
            .query(&request.query);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    EngineError::timeout(format!("{} {}", request.method, request.url), request.timeout)
                } else {
                    EngineError::transport(e.to_string())
                }
            })?;
            let status = response.status().as_u16();
            let text = response
                .text()
                .await
                .map_err(|e| EngineError::transport(e.to_string()))?;
            let body = if text.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            };
            Ok(ClientResponse { status, body })
        }
    }
}
