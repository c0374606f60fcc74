use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

type DisconnectCallback = Box<dyn FnOnce() + Send>;

/// Connection state shared between the HTTP layer and the request lifecycle.
#[derive(Default)]
pub struct ClientConnection {
    disconnected: AtomicBool,
    callbacks: Mutex<Vec<DisconnectCallback>>,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

impl ClientConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Runs `callback` once the client goes away, or right now if it already has.
    pub fn register_disconnection_callback(&self, callback: impl FnOnce() + Send + 'static) {
        let mut callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_disconnected() {
            drop(callbacks);
            callback();
            return;
        }
        callbacks.push(Box::new(callback));
    }

    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        let callbacks = std::mem::take(
            &mut *self
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        log::debug!("[client][disconnect] callbacks: {}", callbacks.len());
        for callback in callbacks {
            callback();
        }
    }
}

/// One HTTP request as seen by a servable.
#[derive(Debug)]
pub struct HttpPayload {
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    /// The body parsed as JSON, or the parse error.
    pub parsed_json: Result<serde_json::Value, String>,
    pub client: Arc<ClientConnection>,
}

impl HttpPayload {
    pub fn new(uri: impl Into<String>, body: impl Into<String>, client: Arc<ClientConnection>) -> Self {
        let body = body.into();
        let parsed_json = serde_json::from_str(&body).map_err(|err| err.to_string());
        Self {
            uri: uri.into(),
            headers: Vec::new(),
            body,
            parsed_json,
            client,
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }
}
