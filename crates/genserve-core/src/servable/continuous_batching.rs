use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use super::{continue_stream, finish_stream};
use crate::{
    context::{ExecutionContext, Generation},
    engine::{
        ContinuousBatchingPipeline, GenerationFinishReason, GenerationHandle, GenerationOutput,
        GenerationStatus,
    },
    error::{Result, ServableError},
    executor::{exit_on_fatal, ExecutorWrapper, FatalHandler, PipelineWork},
};

fn engine_error(err: anyhow::Error) -> ServableError {
    ServableError::internal(format!("{err:#}"))
}

fn handle(ctx: &ExecutionContext) -> Result<Arc<dyn GenerationHandle>> {
    match &ctx.generation {
        Some(Generation::Batched(handle)) => Ok(handle.clone()),
        _ => Err(ServableError::internal("request is not scheduled")),
    }
}

/// A shared pipeline stepped by a background executor.
pub struct BatchingBackend {
    pipeline: Arc<dyn ContinuousBatchingPipeline>,
    executor: ExecutorWrapper,
    request_ids: AtomicU64,
}

impl BatchingBackend {
    pub fn spawn(
        name: &str,
        pipeline: Arc<dyn ContinuousBatchingPipeline>,
        is_dynamic_kv_cache: bool,
    ) -> anyhow::Result<Self> {
        Self::spawn_with_fatal_handler(name, pipeline, is_dynamic_kv_cache, exit_on_fatal())
    }

    pub fn spawn_with_fatal_handler(
        name: &str,
        pipeline: Arc<dyn ContinuousBatchingPipeline>,
        is_dynamic_kv_cache: bool,
        fatal: FatalHandler,
    ) -> anyhow::Result<Self> {
        let work = Arc::new(PipelineWork::new(pipeline.clone(), is_dynamic_kv_cache));
        let executor =
            ExecutorWrapper::spawn_with_fatal_handler(&format!("{name}-executor"), work, fatal)?;
        Ok(Self {
            pipeline,
            executor,
            request_ids: AtomicU64::new(0),
        })
    }

    pub fn pipeline(&self) -> &Arc<dyn ContinuousBatchingPipeline> {
        &self.pipeline
    }

    pub(super) fn schedule(&self, ctx: &mut ExecutionContext) -> Result<()> {
        let config = ctx
            .generation_config
            .clone()
            .ok_or_else(|| ServableError::internal("generation config is not prepared"))?;
        let request_id = self.request_ids.fetch_add(1, Ordering::Relaxed);
        let handle = self
            .pipeline
            .add_request(request_id, &ctx.input_ids, config)
            .map_err(engine_error)?;

        let stop = handle.clone();
        ctx.client()?
            .register_disconnection_callback(move || stop.stop());
        ctx.generation = Some(Generation::Batched(handle));

        log::debug!("[servable][schedule][request: {request_id}]");
        self.executor.notify();
        Ok(())
    }

    pub(super) fn read_complete(&self, ctx: &mut ExecutionContext) -> Result<()> {
        let handle = handle(ctx)?;
        let outputs = handle.read_all().map_err(engine_error)?;
        if handle.status() == GenerationStatus::Stop {
            return Err(ServableError::Cancelled);
        }
        ctx.generation_outputs = match outputs.is_empty() {
            true => vec![GenerationOutput::empty_stop()],
            false => outputs,
        };
        Ok(())
    }

    pub(super) fn read_partial(&self, ctx: &mut ExecutionContext) -> Result<()> {
        ctx.ensure_connected()?;
        let handle = handle(ctx)?;
        let status = handle.status();
        match status {
            GenerationStatus::Stop => return Err(ServableError::Cancelled),
            GenerationStatus::Failed => {
                return Err(ServableError::internal("generation failed in the engine"))
            }
            _ => {}
        }

        if status == GenerationStatus::Running || handle.can_read() {
            let mut outputs = handle.read().map_err(engine_error)?;
            if outputs.len() > 1 {
                return Err(ServableError::internal(
                    "For streaming we expect at most one generation output",
                ));
            }
            ctx.generation_outputs = match outputs.pop() {
                Some(output) => vec![output],
                None => vec![GenerationOutput::empty_stop()],
            };
        } else {
            // finished and fully drained
            ctx.generation_outputs = vec![GenerationOutput::empty_stop()];
        }
        Ok(())
    }

    pub(super) fn prepare_partial(&self, ctx: &mut ExecutionContext) -> Result<()> {
        if ctx.generation_outputs.len() != 1 {
            return Err(ServableError::internal(
                "For streaming we expect exactly one generation output",
            ));
        }
        let output = &ctx.generation_outputs[0];
        let finish_reason = output.finish_reason;
        let generated_ids = output.generated_ids.clone();
        ctx.api_handler_mut()?
            .increment_processed_tokens(generated_ids.len());

        let streamer = ctx
            .text_streamer
            .as_mut()
            .ok_or_else(|| ServableError::internal("text streamer is not initialized"))?;
        streamer.write_all(&generated_ids);
        let mut text = ctx.mailbox.take();

        match finish_reason {
            GenerationFinishReason::None => continue_stream(ctx, &text),
            finish_reason => {
                streamer.end();
                text.push_str(&ctx.mailbox.take());
                finish_stream(ctx, &text, finish_reason)
            }
        }
    }
}
