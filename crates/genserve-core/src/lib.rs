pub mod apis;
pub mod calculator;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod generation;
pub mod mailbox;
pub mod payload;
pub mod servable;
pub mod streamer;
pub mod template;

pub use apis::{Endpoint, FinishReason, Usage};
pub use calculator::{run_stream, run_unary, Calculator};
pub use config::{DraftModel, PipelineType, SchedulerConfig, ServableConfig};
pub use context::{ContextState, ExecutionContext};
pub use error::{Result, ServableError};
pub use payload::{ClientConnection, HttpPayload};
pub use servable::{initialize, Servable};
