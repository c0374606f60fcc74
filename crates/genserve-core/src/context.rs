use std::sync::Arc;

use crate::{
    apis::{Endpoint, OpenAiHandler, TokenizeRequest},
    engine::{GenerationConfig, GenerationHandle, GenerationOutput},
    error::{Result, ServableError},
    mailbox::StreamMailbox,
    payload::{ClientConnection, HttpPayload},
    streamer::TextStreamer,
};

/// Where a request is in its lifecycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    #[default]
    Created,
    Loaded,
    Parsed,
    InputsPrepared,
    Scheduled,
    ReadingPartial,
    PartialPrepared,
    ReadingComplete,
    Done,
    Failed,
    Cancelled,
}

impl ContextState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// Result of a queued legacy generation, as reported by the worker.
pub type QueuedResult = Result<Vec<GenerationOutput>>;

/// The engine-side half of a scheduled request.
pub enum Generation {
    Batched(Arc<dyn GenerationHandle>),
    Queued {
        done: flume::Receiver<QueuedResult>,
        /// Set once `done` has delivered.
        result: Option<QueuedResult>,
    },
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Batched(handle) => f
                .debug_tuple("Batched")
                .field(&handle.status())
                .finish(),
            Self::Queued { result, .. } => f
                .debug_struct("Queued")
                .field("done", &result.is_some())
                .finish(),
        }
    }
}

/// Per-request state carried across the lifecycle steps of a servable.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    pub payload: Option<HttpPayload>,
    pub endpoint: Option<Endpoint>,
    pub api_handler: Option<OpenAiHandler>,
    pub tokenize: Option<TokenizeRequest>,
    pub generation_config: Option<GenerationConfig>,
    pub input_ids: Vec<u32>,
    pub generation: Option<Generation>,
    /// Overwritten by every read.
    pub generation_outputs: Vec<GenerationOutput>,
    /// Cleared before every iteration.
    pub response: String,
    pub send_loopback_signal: bool,
    /// Text produced by the streamer callback and not yet sent.
    pub mailbox: Arc<StreamMailbox>,
    pub text_streamer: Option<TextStreamer>,
    pub state: ContextState,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves from one of `from` to `to`, or fails with an internal error naming `step`.
    pub fn transition(&mut self, step: &str, from: &[ContextState], to: ContextState) -> Result<()> {
        if !from.contains(&self.state) {
            return Err(ServableError::internal(format!(
                "{step} called in state {:?}",
                self.state
            )));
        }
        self.state = to;
        Ok(())
    }

    /// Records how a step failed. Terminal states are kept.
    pub fn fail(&mut self, err: &ServableError) {
        if self.state.is_terminal() {
            return;
        }
        self.state = match err {
            ServableError::Cancelled => ContextState::Cancelled,
            _ => ContextState::Failed,
        };
    }

    pub fn client(&self) -> Result<&Arc<ClientConnection>> {
        self.payload
            .as_ref()
            .map(|payload| &payload.client)
            .ok_or_else(|| ServableError::internal("request is not loaded"))
    }

    pub fn is_disconnected(&self) -> bool {
        self.payload
            .as_ref()
            .is_some_and(|payload| payload.client.is_disconnected())
    }

    /// Fails with [`ServableError::Cancelled`] once the client is gone.
    pub fn ensure_connected(&self) -> Result<()> {
        match self.is_disconnected() {
            true => Err(ServableError::Cancelled),
            false => Ok(()),
        }
    }

    pub fn endpoint(&self) -> Result<Endpoint> {
        self.endpoint
            .ok_or_else(|| ServableError::internal("request is not loaded"))
    }

    pub fn api_handler(&self) -> Result<&OpenAiHandler> {
        self.api_handler
            .as_ref()
            .ok_or_else(|| ServableError::invalid("API handler is not initialized"))
    }

    pub fn api_handler_mut(&mut self) -> Result<&mut OpenAiHandler> {
        self.api_handler
            .as_mut()
            .ok_or_else(|| ServableError::invalid("API handler is not initialized"))
    }

    pub fn is_stream(&self) -> bool {
        self.api_handler
            .as_ref()
            .is_some_and(OpenAiHandler::is_stream)
    }

    pub fn is_tokenize(&self) -> bool {
        self.endpoint == Some(Endpoint::Tokenize)
    }
}
