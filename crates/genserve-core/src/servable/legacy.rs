use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::Result as AnyResult;

use super::{continue_stream, finish_stream, Properties};
use crate::{
    context::{ExecutionContext, Generation, QueuedResult},
    engine::{GenerationConfig, GenerationFinishReason, GenerationOutput, LlmPipeline, Tokenizer},
    error::{Result, ServableError},
    executor::{exit_on_fatal, ExecutorWrapper, FatalHandler, WorkSource},
    mailbox::StreamMailbox,
    payload::ClientConnection,
    streamer::TextStreamer,
};

pub const REQUEST_FAILED_MESSAGE: &str = "Request processing failed, check its correctness.";

/// Rejects prompts longer than `max_prompt_length` on devices with a static input shape.
pub(super) fn validate_input_length(properties: &Properties, length: usize) -> Result<()> {
    if properties.device == "NPU" && length > properties.max_prompt_length {
        log::debug!(
            "[servable][inputs] input length exceeds the maximum allowed length: {length} > {}",
            properties.max_prompt_length
        );
        return Err(ServableError::invalid(
            "Input length exceeds the maximum allowed length",
        ));
    }
    Ok(())
}

/// A request waiting for the legacy worker.
pub struct LegacyRequest {
    input_ids: Vec<u32>,
    config: GenerationConfig,
    streamer: Option<TextStreamer>,
    mailbox: Arc<StreamMailbox>,
    client: Arc<ClientConnection>,
    done: flume::Sender<QueuedResult>,
}

impl Drop for LegacyRequest {
    fn drop(&mut self) {
        // wakes a streaming reader even when the request never ran
        self.mailbox.finish();
    }
}

/// FIFO of requests generated one at a time.
pub struct LegacyQueue {
    pipeline: Arc<dyn LlmPipeline>,
    requests: Mutex<VecDeque<LegacyRequest>>,
}

impl LegacyQueue {
    pub fn new(pipeline: Arc<dyn LlmPipeline>) -> Self {
        Self {
            pipeline,
            requests: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LegacyRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, request: LegacyRequest) {
        self.lock().push_back(request);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl WorkSource for LegacyQueue {
    fn has_work(&self) -> bool {
        !self.is_empty()
    }

    /// Generation failures go back to the request. Only the queue itself can fail the worker.
    fn run_once(&self) -> AnyResult<()> {
        let Some(mut request) = self.lock().pop_front() else {
            return Ok(());
        };

        if request.client.is_disconnected() {
            log::debug!("[legacy][skip] client disconnected before generation");
            let _ = request.done.send(Err(ServableError::Cancelled));
            return Ok(());
        }

        let result = self
            .pipeline
            .generate(&request.input_ids, &request.config, request.streamer.as_mut())
            .map_err(|err| {
                log::error!("[legacy][generate] {err:#}");
                ServableError::invalid(REQUEST_FAILED_MESSAGE)
            });
        let _ = request.done.send(result);
        Ok(())
    }
}

/// Requests are queued and generated one at a time by a background worker.
pub struct LegacyBackend {
    queue: Arc<LegacyQueue>,
    executor: ExecutorWrapper,
}

impl LegacyBackend {
    pub fn spawn(name: &str, pipeline: Arc<dyn LlmPipeline>) -> AnyResult<Self> {
        Self::spawn_with_fatal_handler(name, pipeline, exit_on_fatal())
    }

    pub fn spawn_with_fatal_handler(
        name: &str,
        pipeline: Arc<dyn LlmPipeline>,
        fatal: FatalHandler,
    ) -> AnyResult<Self> {
        let queue = Arc::new(LegacyQueue::new(pipeline));
        let executor =
            ExecutorWrapper::spawn_with_fatal_handler(&format!("{name}-legacy"), queue.clone(), fatal)?;
        Ok(Self { queue, executor })
    }

    pub fn queue(&self) -> &Arc<LegacyQueue> {
        &self.queue
    }

    pub(super) fn schedule(&self, ctx: &mut ExecutionContext) -> Result<()> {
        let config = ctx
            .generation_config
            .clone()
            .ok_or_else(|| ServableError::internal("generation config is not prepared"))?;
        let (sender, receiver) = flume::bounded(1);
        self.queue.push(LegacyRequest {
            input_ids: ctx.input_ids.clone(),
            config,
            streamer: ctx.text_streamer.take(),
            mailbox: ctx.mailbox.clone(),
            client: ctx.client()?.clone(),
            done: sender,
        });
        ctx.generation = Some(Generation::Queued {
            done: receiver,
            result: None,
        });
        log::debug!("[legacy][schedule] queued: {}", self.queue.len());
        self.executor.notify();
        Ok(())
    }

    /// Blocks until the worker has processed the request.
    fn wait(ctx: &mut ExecutionContext) -> Result<&QueuedResult> {
        let Some(Generation::Queued { done, result }) = &mut ctx.generation else {
            return Err(ServableError::internal("request is not scheduled"));
        };
        if result.is_none() {
            let received = done
                .recv()
                .map_err(|_| ServableError::internal("legacy worker dropped the request"))?;
            *result = Some(received);
        }
        result
            .as_ref()
            .ok_or_else(|| ServableError::internal("request is not finished"))
    }

    pub(super) fn read_complete(&self, ctx: &mut ExecutionContext) -> Result<()> {
        let outputs = Self::wait(ctx)?.clone()?;
        ctx.generation_outputs = match outputs.is_empty() {
            true => vec![GenerationOutput::empty_stop()],
            false => outputs,
        };
        Ok(())
    }

    pub(super) fn prepare_partial(
        &self,
        ctx: &mut ExecutionContext,
        tokenizer: &dyn Tokenizer,
    ) -> Result<()> {
        ctx.ensure_connected()?;
        let (text, finished) = ctx.mailbox.wait_for_text_or_finish();
        if !text.is_empty() {
            let tokens = tokenizer
                .encode(&text, false)
                .map_err(|err| ServableError::internal(format!("{err:#}")))?;
            ctx.api_handler_mut()?.increment_processed_tokens(tokens.len());
        }

        if !finished {
            return continue_stream(ctx, &text);
        }
        if let Err(err) = Self::wait(ctx)? {
            return Err(err.clone());
        }
        finish_stream(ctx, &text, GenerationFinishReason::Stop)
    }
}
