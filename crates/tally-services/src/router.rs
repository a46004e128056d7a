//! Message router: turns one reassembled request into at most one response.
//!
//! Every failure a peer can cause is answered with an `err:` message; nothing
//! here returns an error to the caller.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;

use tally_core::message::{Command, Message, MessageError, Request, Tag, MESSAGE_END};

use crate::session::SessionRegistry;
use crate::store::{SeriesStore, StoreError, StoreStatus};

pub struct MessageRouter {
    store: Arc<dyn SeriesStore>,
    registry: SessionRegistry,
}

impl MessageRouter {
    pub fn new(store: Arc<dyn SeriesStore>, registry: SessionRegistry) -> Self {
        Self { store, registry }
    }

    /// Handle one complete message from `peer`. `None` means no response
    /// (the session was closed).
    pub fn route(&self, peer: SocketAddr, raw: &[u8]) -> Option<String> {
        let message = match Message::parse(raw) {
            Ok(m) => m,
            Err(e @ MessageError::UnknownTag(_)) | Err(e @ MessageError::MissingTag) => {
                tracing::debug!(%peer, error = %e, "unknown message type");
                return Some(Message::error("Unknown message type").render());
            }
            Err(e) => {
                tracing::debug!(%peer, error = %e, "malformed message");
                return Some(Message::error(e.to_string()).render());
            }
        };

        match message.tag {
            Tag::Command => self.command(peer, &message.body),
            Tag::Text => {
                tracing::debug!(%peer, len = message.body.len(), "text message");
                Some(format!("{}{}", message.body, MESSAGE_END))
            }
            Tag::Json => Some(self.request(peer, &message.body)),
            Tag::Error => {
                tracing::debug!(%peer, body = %message.body, "peer sent an error message");
                Some(Message::error("Unexpected error message").render())
            }
        }
    }

    fn command(&self, peer: SocketAddr, keyword: &str) -> Option<String> {
        match Command::parse(keyword) {
            Command::Disconnect => {
                if self.registry.remove(&peer).is_some() {
                    tracing::info!(%peer, "session closed by peer");
                }
                None
            }
            Command::ListAll => Some(match self.store.list() {
                Ok(all) => render_json(&json!({ "currencies": all })),
                Err(e) => internal_error(peer, e),
            }),
            Command::Unknown(other) => {
                tracing::debug!(%peer, command = %other, "unknown command");
                Some(Message::error("Unknown command").render())
            }
        }
    }

    fn request(&self, peer: SocketAddr, body: &str) -> String {
        let request: Request = match serde_json::from_str(body) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "malformed request");
                return Message::error(format!("Malformed request: {e}")).render();
            }
        };
        let currency = request.currency();
        if currency.trim().is_empty() {
            return Message::error("Currency name must not be empty").render();
        }
        tracing::debug!(%peer, ?request, "request");

        let outcome = match &request {
            Request::AddCurrency { .. } => self.store.add(currency).map(|status| match status {
                StoreStatus::Ok => Message::text(format!("Currency {currency} added")),
                StoreStatus::AlreadyExists => {
                    Message::error(format!("Currency {currency} already exists"))
                }
                other => unexpected_status(peer, "add", other),
            }),
            Request::AddCurrencyValue { value, .. } => {
                self.store
                    .add_value(currency, *value)
                    .map(|status| match status {
                        StoreStatus::Ok => {
                            Message::text(format!("Value {value} added to {currency}"))
                        }
                        StoreStatus::NotFound => not_found(currency),
                        other => unexpected_status(peer, "add_value", other),
                    })
            }
            Request::DelCurrency { .. } => self.store.remove(currency).map(|status| match status {
                StoreStatus::Ok => Message::text(format!("Currency {currency} deleted")),
                StoreStatus::NotFound => not_found(currency),
                other => unexpected_status(peer, "remove", other),
            }),
            Request::GetCurrencyHistory { .. } => {
                return match self.store.history(currency) {
                    Ok(Some(history)) => {
                        render_json(&json!({ "currency": currency, "history": history }))
                    }
                    Ok(None) => not_found(currency).render(),
                    Err(e) => internal_error(peer, e),
                };
            }
        };

        match outcome {
            Ok(message) => message.render(),
            Err(e) => internal_error(peer, e),
        }
    }
}

fn not_found(currency: &str) -> Message {
    Message::error(format!("Currency {currency} not found"))
}

/// A status the operation never returns: the backend is misbehaving.
fn unexpected_status(peer: SocketAddr, operation: &str, status: StoreStatus) -> Message {
    tracing::warn!(%peer, operation, ?status, "store returned an unexpected status");
    Message::error("Internal error")
}

fn internal_error(peer: SocketAddr, e: StoreError) -> String {
    tracing::warn!(%peer, error = %e, "store operation failed");
    Message::error("Internal error").render()
}

fn render_json(value: &serde_json::Value) -> String {
    Message::new(Tag::Json, value.to_string()).render()
}
