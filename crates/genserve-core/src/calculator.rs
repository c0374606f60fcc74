//! Drives one request through the lifecycle of a [`Servable`].
//!
//! Unary requests take one complete read. Streaming requests loop on partial reads,
//! forwarding every non-empty response until the servable drops the loopback flag.

use std::sync::Arc;

use crate::{
    context::{ContextState, ExecutionContext},
    error::Result,
    payload::HttpPayload,
    servable::Servable,
};

pub struct Calculator {
    servable: Arc<Servable>,
    ctx: ExecutionContext,
}

impl std::fmt::Debug for Calculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Calculator")
            .field("servable", &self.servable.name())
            .field("ctx", &self.ctx)
            .finish()
    }
}

impl Calculator {
    /// Loads, parses and schedules `payload`. Tokenize requests are not scheduled.
    pub fn open(servable: Arc<Servable>, payload: HttpPayload) -> Result<Self> {
        let ctx = servable.create_execution_context();
        let mut calculator = Self { servable, ctx };
        calculator.step(|servable, ctx| servable.load_request(ctx, payload))?;
        calculator.step(Servable::parse_request)?;
        if calculator.ctx.is_tokenize() {
            return Ok(calculator);
        }
        calculator.step(Servable::prepare_inputs)?;
        calculator.step(Servable::schedule_execution)?;
        Ok(calculator)
    }

    fn step(
        &mut self,
        step: impl FnOnce(&Servable, &mut ExecutionContext) -> Result<()>,
    ) -> Result<()> {
        let result = step(&self.servable, &mut self.ctx);
        if let Err(err) = &result {
            match err.is_cancelled() {
                true => log::debug!("[calculator][cancel] {:?}", self.ctx.state),
                false => log::debug!("[calculator][error] {err}"),
            }
            self.ctx.fail(err);
        }
        result
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn is_stream(&self) -> bool {
        self.ctx.is_stream()
    }

    pub fn is_done(&self) -> bool {
        self.ctx.state.is_terminal()
    }

    /// Reads the whole generation and returns the response body.
    pub fn complete(&mut self) -> Result<String> {
        if !self.ctx.is_tokenize() {
            self.step(Servable::read_complete_execution_results)?;
        }
        self.step(Servable::prepare_complete_response)?;
        Ok(std::mem::take(&mut self.ctx.response))
    }

    /// Runs streaming iterations until one produces output. `None` once the stream ended.
    pub fn next_chunk(&mut self) -> Result<Option<String>> {
        loop {
            if self.ctx.state == ContextState::Done {
                return Ok(None);
            }
            self.ctx.response.clear();
            self.ctx.send_loopback_signal = false;
            self.step(Servable::read_partial_execution_results)?;
            self.step(Servable::prepare_partial_response)?;
            if !self.ctx.response.is_empty() {
                return Ok(Some(std::mem::take(&mut self.ctx.response)));
            }
            if !self.ctx.send_loopback_signal {
                return Ok(None);
            }
        }
    }
}

/// Serves one unary request.
pub fn run_unary(servable: Arc<Servable>, payload: HttpPayload) -> Result<String> {
    Calculator::open(servable, payload)?.complete()
}

/// Serves one streaming request, handing every SSE frame batch to `emit`. Emission stops
/// early when `emit` returns `false`.
pub fn run_stream(
    servable: Arc<Servable>,
    payload: HttpPayload,
    mut emit: impl FnMut(String) -> bool,
) -> Result<()> {
    let mut calculator = Calculator::open(servable, payload)?;
    while let Some(chunk) = calculator.next_chunk()? {
        if !emit(chunk) {
            break;
        }
    }
    Ok(())
}
