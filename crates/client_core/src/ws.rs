//! Websocket event transport with automatic reconnect.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use shared::{
    domain::NamespaceId,
    protocol::{ClientFrame, ServerFrame},
};
use tokio::{
    runtime::Handle,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::sleep,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use url::Url;

use crate::{
    error::TransportError,
    store::Subscription,
    transport::{remove_route, route_event, EventHandler, EventTransport, Routes},
};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct WsTransportOptions {
    pub reconnect_delay: Duration,
}

impl Default for WsTransportOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// One websocket at `{server}/ws` shared by every namespace subscription.
pub struct WsEventTransport {
    url: Url,
    routes: Routes,
    outbound: UnboundedSender<ClientFrame>,
    task: JoinHandle<()>,
}

impl WsEventTransport {
    /// Starts the connection loop on the current tokio runtime. The first
    /// connection attempt happens in the background; subscriptions made
    /// before it succeeds are sent once connected.
    pub fn connect(
        server_url: &str,
        options: WsTransportOptions,
    ) -> Result<Arc<Self>, TransportError> {
        let url = ws_url(server_url)?;
        let runtime = Handle::try_current()
            .map_err(|err| TransportError::Connect(format!("no tokio runtime: {err}")))?;
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = runtime.spawn(run_connection(
            url.clone(),
            Arc::clone(&routes),
            outbound_rx,
            options,
        ));
        Ok(Arc::new(Self {
            url,
            routes,
            outbound,
            task,
        }))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn subscribed_namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        namespaces.sort();
        namespaces
    }
}

impl EventTransport for WsEventTransport {
    fn subscribe(&self, namespace: &NamespaceId, handler: EventHandler) -> Subscription {
        let path = namespace.path();
        let replaced = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.clone(), Arc::clone(&handler))
            .is_some();
        if !replaced {
            info!(namespace = %path, "subscribing");
            let _ = self.outbound.send(ClientFrame::Subscribe {
                namespace: path.clone(),
            });
        }

        let routes = Arc::downgrade(&self.routes);
        let outbound = self.outbound.clone();
        Subscription::new(move || {
            let Some(routes) = routes.upgrade() else {
                return;
            };
            if remove_route(&routes, &path, &handler) {
                info!(namespace = %path, "unsubscribing");
                let _ = outbound.send(ClientFrame::Unsubscribe { namespace: path });
            }
        })
    }
}

impl Drop for WsEventTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn ws_url(server_url: &str) -> Result<Url, TransportError> {
    let invalid = |reason: String| TransportError::InvalidUrl {
        url: server_url.to_string(),
        reason,
    };
    let mut url = Url::parse(server_url).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => return Err(invalid("server_url must start with http:// or https://".into())),
    };
    url.set_scheme(scheme)
        .map_err(|()| invalid(format!("cannot switch scheme to {scheme}")))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

async fn run_connection(
    url: Url,
    routes: Routes,
    mut outbound: UnboundedReceiver<ClientFrame>,
    options: WsTransportOptions,
) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                info!(%url, "websocket connected");
                let (mut writer, mut reader) = stream.split();

                // Queued frames are superseded by the resubscribe below.
                while outbound.try_recv().is_ok() {}
                let namespaces: Vec<String> = routes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .cloned()
                    .collect();
                let mut healthy = true;
                for namespace in namespaces {
                    if let Err(err) = send_frame(&mut writer, ClientFrame::Subscribe { namespace }).await
                    {
                        warn!(%err, "websocket resubscribe failed");
                        healthy = false;
                        break;
                    }
                }

                while healthy {
                    tokio::select! {
                        frame = outbound.recv() => match frame {
                            Some(frame) => {
                                if let Err(err) = send_frame(&mut writer, frame).await {
                                    warn!(%err, "websocket send failed");
                                    healthy = false;
                                }
                            }
                            None => return,
                        },
                        msg = reader.next() => match msg {
                            Some(Ok(Message::Text(text))) => handle_text(&routes, &text),
                            Some(Ok(Message::Close(_))) | None => {
                                info!(%url, "websocket closed by server");
                                healthy = false;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!(%err, "websocket receive failed");
                                healthy = false;
                            }
                        },
                    }
                }
            }
            Err(err) => warn!(%url, %err, "websocket connect failed"),
        }

        info!(delay_ms = options.reconnect_delay.as_millis() as u64, "reconnecting");
        sleep(options.reconnect_delay).await;
    }
}

async fn send_frame<W>(writer: &mut W, frame: ClientFrame) -> Result<(), TransportError>
where
    W: futures::Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    let text =
        serde_json::to_string(&frame).map_err(|err| TransportError::InvalidResponse(err.to_string()))?;
    writer
        .send(Message::Text(text))
        .await
        .map_err(|err| TransportError::Connect(err.to_string()))
}

fn handle_text(routes: &Routes, text: &str) {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(ServerFrame::Event { namespace, event }) => {
            route_event(routes, &namespace, event);
        }
        Ok(ServerFrame::Error { namespace, error }) => {
            warn!(
                namespace = namespace.as_deref().unwrap_or("-"),
                code = ?error.code,
                message = %error.message,
                "server reported error"
            );
        }
        Err(err) => warn!(%err, "skipping malformed server frame"),
    }
}

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod tests;
