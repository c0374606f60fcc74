use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use genserve_core::{ClientConnection, ServableError};
use salvo::{oapi::ToSchema, prelude::*};
use serde::Serialize;

pub mod oai;

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    error: String,
}

pub fn render_error(res: &mut Response, status: StatusCode, error: impl Into<String>) {
    res.status_code(status).render(Json(ErrorResponse {
        error: error.into(),
    }));
}

/// Maps a failed request onto the HTTP status and `{"error": ...}` body.
pub fn render_servable_error(res: &mut Response, err: ServableError) {
    match err {
        ServableError::InvalidArgument(message) => {
            render_error(res, StatusCode::BAD_REQUEST, message)
        }
        ServableError::Internal(message) => {
            render_error(res, StatusCode::INTERNAL_SERVER_ERROR, message)
        }
        ServableError::Cancelled => {
            res.status_code(StatusCode::NO_CONTENT);
        }
    }
}

/// Marks the client disconnected when dropped while armed.
///
/// Handler futures are dropped when the peer goes away, which is how a running generation
/// learns that nobody is listening anymore. A stream that ran to its end sets the
/// [`finished`](Self::finished) flag so the drop that follows is not mistaken for a disconnect.
#[derive(Debug)]
pub struct DisconnectGuard {
    client: Option<Arc<ClientConnection>>,
    finished: Arc<AtomicBool>,
}

impl DisconnectGuard {
    pub fn new(client: Arc<ClientConnection>) -> Self {
        Self {
            client: Some(client),
            finished: Default::default(),
        }
    }

    pub fn release(mut self) {
        self.client = None;
    }

    pub fn finished(&self) -> Arc<AtomicBool> {
        self.finished.clone()
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        if !self.finished.load(Ordering::Acquire) {
            client.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_disconnects_unless_released() {
        let client = ClientConnection::new();
        DisconnectGuard::new(client.clone()).release();
        assert!(!client.is_disconnected());

        drop(DisconnectGuard::new(client.clone()));
        assert!(client.is_disconnected());
    }

    #[test]
    fn test_finished_stream_does_not_disconnect() {
        let client = ClientConnection::new();
        let guard = DisconnectGuard::new(client.clone());
        guard.finished().store(true, Ordering::Release);
        drop(guard);
        assert!(!client.is_disconnected());
    }
}
