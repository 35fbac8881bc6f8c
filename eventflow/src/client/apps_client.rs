use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::transport::{ClientRequest, ClientResponse, ClientTransport, Method};
use crate::balancer::{CircuitBreakLoadBalancer, CircuitBreakerSettings};
use crate::config::{auto_path_version, AppConfig, AppConnection, EventType};
use crate::context::{track, EventContext};
use crate::errors::{ConfigurationError, EngineError, EngineResult};
use crate::payload::Payload;
use crate::retry::{with_retry, RetryConfig};

/// Builds the route of `event` on a peer app: `/api/{app}/{version}/{event}`.
///
/// Dots in the version become `x`; dots in the event name become path segments.
#[must_use]
pub fn app_route(app_name: &str, version: &str, event: &str) -> String {
    format!(
        "/api/{}/{}/{}",
        app_name,
        auto_path_version(version),
        event.replace('.', "/")
    )
}

/// Client for the events of one peer application.
///
/// Hosts are picked round-robin; transport failures and 5xx answers feed the
/// per-host circuit breaker and are retried on the next host. 4xx answers are
/// returned as [`EngineError::Client`] without retry.
#[derive(Debug)]
pub struct AppsClient {
    key: String,
    connection: AppConnection,
    events: HashMap<String, EventType>,
    balancer: CircuitBreakLoadBalancer<String>,
    retry: RetryConfig,
    transport: Arc<dyn ClientTransport>,
}

impl AppsClient {
    /// Creates a client for `connection`, registered as `key`.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        connection: AppConnection,
        transport: Arc<dyn ClientTransport>,
    ) -> Self {
        let key = key.into();
        let balancer = CircuitBreakLoadBalancer::new(
            key.clone(),
            connection.hosts.clone(),
            CircuitBreakerSettings::from_connection(&connection),
        );
        Self {
            retry: connection.retry_config(),
            key,
            connection,
            events: HashMap::new(),
            balancer,
            transport,
        }
    }

    /// Creates a client for the connection `key` of `config`, allowing every
    /// peer event the app's events declare on it.
    pub fn from_config(
        config: &AppConfig,
        key: &str,
        transport: Arc<dyn ClientTransport>,
    ) -> EngineResult<Self> {
        let connection = config.app_connections.get(key).ok_or_else(|| {
            ConfigurationError::new(format!("app connection '{key}' is not configured"))
        })?;
        let mut client = Self::new(key, connection.clone(), transport);
        for event in config.events.values() {
            for conn in event.connections.iter().filter(|c| c.app_connection == key) {
                client.events.insert(conn.event.clone(), conn.event_type);
            }
        }
        Ok(client)
    }

    /// Allows calling `event` with the given type.
    #[must_use]
    pub fn with_event(mut self, event: impl Into<String>, event_type: EventType) -> Self {
        self.events.insert(event.into(), event_type);
        self
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Connection key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The host balancer.
    #[must_use]
    pub const fn balancer(&self) -> &CircuitBreakLoadBalancer<String> {
        &self.balancer
    }

    /// Route of `event` on the peer.
    #[must_use]
    pub fn route(&self, event: &str) -> String {
        app_route(&self.connection.name, &self.connection.version, event)
    }

    fn method(&self, event: &str) -> EngineResult<Method> {
        match self.events.get(event) {
            Some(EventType::Get) => Ok(Method::Get),
            Some(EventType::Post) => Ok(Method::Post),
            Some(other) => Err(EngineError::configuration(format!(
                "peer event '{event}' of type {other:?} cannot be called"
            ))),
            None => Err(EngineError::configuration(format!(
                "peer event '{event}' is not declared on connection '{}'",
                self.key
            ))),
        }
    }

    fn headers(context: &EventContext) -> Vec<(String, String)> {
        let mut headers = track::to_headers(context.track_ids());
        let auth = context.auth_info();
        if let Some(token) = auth
            .get("authorization")
            .or_else(|| auth.get("Authorization"))
            .and_then(Value::as_str)
        {
            headers.push(("authorization".to_string(), token.to_string()));
        }
        headers
    }

    /// Calls `event` with an optional payload body and query arguments.
    pub async fn call(
        &self,
        event: &str,
        context: &EventContext,
        payload: Option<&Payload>,
        query: &[(String, String)],
    ) -> EngineResult<Value> {
        let method = self.method(event)?;
        let route = self.route(event);
        let headers = Self::headers(context);
        let body = payload.map(|p| p.value().clone());

        let operation = format!("{}:{event}", self.key);
        with_retry(
            &self.retry,
            &operation,
            |e: &EngineError| e.is_transport() || e.is_timeout(),
            |attempt| {
                let request = (&route, &headers, &body);
                async move {
                    let (index, host) = self.balancer.next_host()?;
                    let (route, headers, body) = request;
                    let request = ClientRequest {
                        method,
                        url: format!("{}{route}", host.trim_end_matches('/')),
                        headers: headers.clone(),
                        query: query.to_vec(),
                        body: body.clone(),
                        timeout: self.connection.timeout(),
                    };
                    self.attempt(index, attempt, route, request).await
                }
            },
        )
        .await
    }

    async fn attempt(
        &self,
        index: usize,
        attempt: usize,
        route: &str,
        request: ClientRequest,
    ) -> EngineResult<Value> {
        let url = request.url.clone();
        tracing::debug!(connection = %self.key, %url, attempt, "Calling peer event");
        let result = tokio::time::timeout(request.timeout, self.transport.send(request))
            .await
            .map_err(|_| EngineError::timeout(url.clone(), self.connection.timeout()))
            .and_then(|r| r);

        match result {
            Ok(response) if response.is_server_error() => {
                self.balancer.failure(index);
                tracing::warn!(connection = %self.key, %url, status = response.status, "Peer host failed");
                Err(EngineError::transport(format!(
                    "{url} answered {}",
                    response.status
                )))
            }
            Ok(response) if response.is_client_error() => {
                self.balancer.success(index);
                Err(client_error(route, &response))
            }
            Ok(response) => {
                self.balancer.success(index);
                Ok(response.body)
            }
            Err(e) => {
                if e.is_transport() || e.is_timeout() {
                    self.balancer.failure(index);
                }
                tracing::warn!(connection = %self.key, %url, error = %e, "Peer call failed");
                Err(e)
            }
        }
    }

    /// Calls `event` and deserializes the answer into `T`.
    pub async fn call_data<T: DeserializeOwned>(
        &self,
        event: &str,
        context: &EventContext,
        payload: Option<&Payload>,
        query: &[(String, String)],
    ) -> EngineResult<T> {
        let value = self.call(event, context, payload, query).await?;
        Ok(serde_json::from_value(value)?)
    }
}

fn client_error(route: &str, response: &ClientResponse) -> EngineError {
    let message = response
        .body
        .get("msg")
        .or_else(|| response.body.get("message"))
        .and_then(Value::as_str)
        .map_or_else(|| response.body.to_string(), str::to_string);
    EngineError::Client {
        route: route.to_string(),
        status: response.status,
        message,
    }
}
