//! Seams between the core and the network.
//!
//! [`EventTransport`] delivers server-pushed events per namespace,
//! [`MutationTransport`] carries outbound commands. Both are injected so the
//! core can run against the websocket/HTTP implementations or an in-process
//! [`LocalEventBus`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::NamespaceId,
    protocol::{GenericEvent, MutationRequest, MutationResponse},
};
use tracing::{debug, warn};
use url::Url;

use crate::{error::TransportError, store::Subscription};

pub type EventHandler = Arc<dyn Fn(GenericEvent) + Send + Sync>;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MUTATE_PATH: &str = "api/v1/machine/mutate";

pub trait EventTransport: Send + Sync {
    /// Routes every event pushed for `namespace` to `handler` until the
    /// returned subscription is dropped.
    fn subscribe(&self, namespace: &NamespaceId, handler: EventHandler) -> Subscription;
}

#[async_trait]
pub trait MutationTransport: Send + Sync {
    async fn mutate(&self, request: MutationRequest) -> Result<MutationResponse, TransportError>;
}

pub(crate) type Routes = Arc<Mutex<HashMap<String, EventHandler>>>;

pub(crate) fn route_event(routes: &Routes, namespace: &str, event: GenericEvent) -> bool {
    let handler = routes
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(namespace)
        .cloned();
    match handler {
        Some(handler) => {
            handler(event);
            true
        }
        None => {
            debug!(namespace, event = %event.name, "no subscriber for namespace; dropping event");
            false
        }
    }
}

/// Removes the route for `namespace` only while it still points at
/// `handler`. A newer subscription for the same namespace keeps its route.
pub(crate) fn remove_route(routes: &Routes, namespace: &str, handler: &EventHandler) -> bool {
    let mut routes = routes.lock().unwrap_or_else(PoisonError::into_inner);
    match routes.get(namespace) {
        Some(current) if Arc::ptr_eq(current, handler) => {
            routes.remove(namespace);
            true
        }
        Some(_) => {
            debug!(namespace, "route taken over by a newer subscription");
            false
        }
        None => false,
    }
}

/// In-process event transport. Used for replay, demos and tests.
#[derive(Default, Clone)]
pub struct LocalEventBus {
    routes: Routes,
}

impl LocalEventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delivers `event` to the subscriber of `namespace`, if any.
    pub fn publish(&self, namespace: &NamespaceId, event: GenericEvent) -> bool {
        route_event(&self.routes, &namespace.path(), event)
    }

    pub fn subscriber_count(&self) -> usize {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_subscribed(&self, namespace: &NamespaceId) -> bool {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&namespace.path())
    }
}

impl EventTransport for LocalEventBus {
    fn subscribe(&self, namespace: &NamespaceId, handler: EventHandler) -> Subscription {
        let path = namespace.path();
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.clone(), Arc::clone(&handler));

        let routes: Weak<Mutex<HashMap<String, EventHandler>>> = Arc::downgrade(&self.routes);
        Subscription::new(move || {
            if let Some(routes) = routes.upgrade() {
                remove_route(&routes, &path, &handler);
            }
        })
    }
}

/// Sends commands as `POST /api/v1/machine/mutate`.
pub struct HttpMutationClient {
    http: Client,
    endpoint: Url,
}

impl HttpMutationClient {
    pub fn new(server_url: &str) -> Result<Self, TransportError> {
        Self::with_timeout(server_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(server_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let invalid = |reason: String| TransportError::InvalidUrl {
            url: server_url.to_string(),
            reason,
        };
        let mut base = Url::parse(server_url).map_err(|err| invalid(err.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(invalid("server_url must start with http:// or https://".into()));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join(MUTATE_PATH)
            .map_err(|err| invalid(err.to_string()))?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| TransportError::Http(err.to_string()))?;
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl MutationTransport for HttpMutationClient {
    async fn mutate(&self, request: MutationRequest) -> Result<MutationResponse, TransportError> {
        let res = self
            .http
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await?;
        let status = res.status();
        let body = res.bytes().await?;
        match serde_json::from_slice::<MutationResponse>(&body) {
            Ok(response) if status.is_success() => Ok(response),
            Ok(response) => {
                warn!(%status, "mutation returned non-success status");
                Ok(MutationResponse {
                    success: false,
                    error: response
                        .error
                        .or_else(|| Some(format!("server returned {status}"))),
                })
            }
            Err(_) if !status.is_success() => {
                Ok(MutationResponse::failed(format!("server returned {status}")))
            }
            Err(err) => Err(TransportError::InvalidResponse(err.to_string())),
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
