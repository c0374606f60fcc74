//! A deterministic in-process engine.
//!
//! Tokens are bytes (`0..=255`) plus [`BOS_TOKEN`] and [`EOS_TOKEN`]. The model echoes
//! the prompt back one byte per step and then emits EOS, so every behavior of the
//! serving layer can be driven without a native runtime.

use std::{
    cmp::Ordering,
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::{bail, Result};

use super::{
    ContinuousBatchingPipeline, GenerationConfig, GenerationFinishReason, GenerationHandle,
    GenerationOutput, GenerationStatus, LlmPipeline, PipelineMetrics, Tokenizer,
};
use crate::{
    config::SchedulerConfig,
    streamer::{StreamingStatus, TextStreamer},
};

pub const BOS_TOKEN: u32 = 256;
pub const EOS_TOKEN: u32 = 257;

/// How long a streaming `read` waits for new tokens.
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Nominal KV footprint of one token, used for cache metrics.
pub const KV_BYTES_PER_TOKEN: usize = 4096;

#[derive(Debug, Default, Clone, Copy)]
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special_tokens {
            tokens.push(BOS_TOKEN);
        }
        tokens.extend(text.bytes().map(u32::from));
        Ok(tokens)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        let bytes: Vec<u8> = tokens
            .iter()
            .filter_map(|&token| u8::try_from(token).ok())
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(EOS_TOKEN)
    }
}

/// Tokens released by one model iteration.
#[derive(Debug, Default)]
struct Advance {
    tokens: Vec<u32>,
    finish: Option<GenerationFinishReason>,
}

/// One generated sequence of the echo model.
#[derive(Debug)]
struct Sequence {
    input_ids: Vec<u32>,
    prompt: Vec<u32>,
    config: GenerationConfig,
    cursor: usize,
    produced: usize,
    echoed: bool,
    /// Bytes held back while they may still be the start of a stop string.
    buffer: Vec<u32>,
    output: Vec<u32>,
    finish: Option<GenerationFinishReason>,
}

impl Sequence {
    fn new(input_ids: &[u32], config: GenerationConfig) -> Self {
        let prompt = input_ids
            .iter()
            .copied()
            .filter(|&token| token < BOS_TOKEN)
            .collect();
        Self {
            input_ids: input_ids.to_vec(),
            prompt,
            echoed: !config.echo,
            config,
            cursor: 0,
            produced: 0,
            buffer: Vec::new(),
            output: Vec::new(),
            finish: None,
        }
    }

    fn context_len(&self) -> usize {
        self.input_ids.len() + self.produced
    }

    fn next_token(&mut self) -> u32 {
        if self.cursor >= self.prompt.len() {
            if !self.config.ignore_eos || self.prompt.is_empty() {
                return EOS_TOKEN;
            }
            self.cursor = 0;
        }
        let token = self.prompt[self.cursor];
        self.cursor += 1;
        token
    }

    /// Splits the held buffer at the earliest position that may still start a stop
    /// string, and reports whether one is fully matched.
    fn match_stop(&self) -> (usize, bool) {
        let buffer: Vec<u8> = self
            .buffer
            .iter()
            .filter_map(|&token| u8::try_from(token).ok())
            .collect();
        self.config
            .stop_strings
            .iter()
            .filter(|stop| !stop.is_empty())
            .map(|stop| {
                let stop = stop.as_bytes();
                if let Some(index) = buffer.windows(stop.len()).position(|window| window == stop) {
                    return (index, true);
                }
                let index = (0..buffer.len())
                    .find(|&index| stop.starts_with(&buffer[index..]))
                    .unwrap_or(buffer.len());
                (index, false)
            })
            .min_by(|x, y| match (x.1, y.1) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => x.0.cmp(&y.0),
            })
            .unwrap_or((buffer.len(), false))
    }

    fn release(&mut self, advance: &mut Advance, tokens: Vec<u32>) {
        self.output.extend(&tokens);
        advance.tokens.extend(tokens);
    }

    fn finish(&mut self, advance: &mut Advance, reason: GenerationFinishReason) {
        self.finish = Some(reason);
        advance.finish = Some(reason);
    }

    fn advance(&mut self) -> Advance {
        let mut advance = Advance::default();
        if self.finish.is_some() {
            return advance;
        }

        if !self.echoed {
            self.echoed = true;
            let input_ids = self.input_ids.clone();
            self.release(&mut advance, input_ids);
        }
        if self.produced >= self.config.max_new_tokens || self.context_len() >= self.config.max_length {
            let held = std::mem::take(&mut self.buffer);
            self.release(&mut advance, held);
            self.finish(&mut advance, GenerationFinishReason::Length);
            return advance;
        }

        let token = self.next_token();
        self.produced += 1;
        if token == EOS_TOKEN {
            let held = std::mem::take(&mut self.buffer);
            self.release(&mut advance, held);
            self.finish(&mut advance, GenerationFinishReason::Stop);
            return advance;
        }

        self.buffer.push(token);
        let (safe, matched) = self.match_stop();
        if matched {
            let mut held = std::mem::take(&mut self.buffer);
            if !self.config.include_stop_str_in_output {
                held.truncate(safe);
            }
            self.release(&mut advance, held);
            self.finish(&mut advance, GenerationFinishReason::Stop);
            return advance;
        }

        let tail = self.buffer.split_off(safe);
        let head = std::mem::replace(&mut self.buffer, tail);
        self.release(&mut advance, head);

        if self.produced >= self.config.max_new_tokens || self.context_len() >= self.config.max_length {
            let held = std::mem::take(&mut self.buffer);
            self.release(&mut advance, held);
            self.finish(&mut advance, GenerationFinishReason::Length);
        }
        advance
    }

    fn full_output(&self) -> GenerationOutput {
        GenerationOutput {
            generated_ids: self.output.clone(),
            generated_log_probs: vec![0.0; self.output.len()],
            score: 0.0,
            finish_reason: self.finish.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Default)]
struct StreamState {
    status: GenerationStatus,
    /// Everything generated per sequence so far.
    outputs: Vec<GenerationOutput>,
    /// How much of each output `read` has handed out.
    cursors: Vec<usize>,
    finish_delivered: bool,
    stop_requested: bool,
}

impl StreamState {
    fn has_unread(&self) -> bool {
        self.outputs
            .iter()
            .zip(&self.cursors)
            .any(|(output, &cursor)| output.generated_ids.len() > cursor)
    }

    fn readable(&self) -> bool {
        self.has_unread() || (self.status == GenerationStatus::Finished && !self.finish_delivered)
    }

    fn drain(&mut self) -> Vec<GenerationOutput> {
        let finished = self.status == GenerationStatus::Finished;
        let outputs = self
            .outputs
            .iter()
            .zip(self.cursors.iter_mut())
            .map(|(output, cursor)| {
                let ids = output.generated_ids[*cursor..].to_vec();
                let log_probs = output.generated_log_probs[*cursor..].to_vec();
                *cursor = output.generated_ids.len();
                GenerationOutput {
                    generated_ids: ids,
                    generated_log_probs: log_probs,
                    score: output.score,
                    finish_reason: match finished {
                        true => output.finish_reason,
                        false => GenerationFinishReason::None,
                    },
                }
            })
            .collect();
        if finished {
            self.finish_delivered = true;
        }
        outputs
    }
}

/// Handle side of one request in the [`ReferencePipeline`].
#[derive(Debug, Default)]
pub struct GenerationStream {
    state: Mutex<StreamState>,
    signal: Condvar,
}

impl GenerationStream {
    fn new(sequences: usize) -> Self {
        let state = StreamState {
            outputs: vec![GenerationOutput::default(); sequences],
            cursors: vec![0; sequences],
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
            signal: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, index: usize, advance: &Advance) {
        let mut state = self.lock();
        if let Some(output) = state.outputs.get_mut(index) {
            output.generated_ids.extend(&advance.tokens);
            output
                .generated_log_probs
                .extend(std::iter::repeat(0.0).take(advance.tokens.len()));
            if let Some(reason) = advance.finish {
                output.finish_reason = reason;
            }
        }
        self.signal.notify_all();
    }

    fn close(&self, status: GenerationStatus) {
        let mut state = self.lock();
        if state.status == GenerationStatus::Running {
            state.status = status;
        }
        self.signal.notify_all();
    }

    fn stop_requested(&self) -> bool {
        self.lock().stop_requested
    }
}

impl GenerationHandle for GenerationStream {
    fn status(&self) -> GenerationStatus {
        self.lock().status
    }

    fn can_read(&self) -> bool {
        self.lock().readable()
    }

    fn read(&self) -> Result<Vec<GenerationOutput>> {
        let mut state = self.lock();
        if !state.readable() && state.status == GenerationStatus::Running {
            state = self
                .signal
                .wait_timeout_while(state, READ_POLL_INTERVAL, |state| {
                    !state.readable() && state.status == GenerationStatus::Running
                })
                .map(|(state, _)| state)
                .unwrap_or_else(|err| err.into_inner().0);
        }
        if state.readable() {
            return Ok(state.drain());
        }
        match state.status {
            GenerationStatus::Running => Ok(vec![GenerationOutput::default()]),
            GenerationStatus::Failed => bail!("generation failed"),
            _ => Ok(vec![]),
        }
    }

    fn read_all(&self) -> Result<Vec<GenerationOutput>> {
        let state = self.lock();
        let mut state = self
            .signal
            .wait_while(state, |state| state.status == GenerationStatus::Running)
            .unwrap_or_else(PoisonError::into_inner);
        if state.status == GenerationStatus::Failed {
            bail!("generation failed");
        }
        state.finish_delivered = true;
        let cursors = state.outputs.iter().map(|output| output.generated_ids.len()).collect();
        state.cursors = cursors;
        Ok(state.outputs.clone())
    }

    fn stop(&self) {
        let mut state = self.lock();
        state.stop_requested = true;
        if state.status == GenerationStatus::Running {
            state.status = GenerationStatus::Stop;
        }
        self.signal.notify_all();
    }
}

#[derive(Debug)]
struct Request {
    id: u64,
    sequences: Vec<Sequence>,
    stream: Arc<GenerationStream>,
}

impl Request {
    fn context_len(&self) -> usize {
        self.sequences.iter().map(Sequence::context_len).sum()
    }
}

#[derive(Debug, Default)]
struct Queues {
    waiting: VecDeque<Request>,
    running: Vec<Request>,
    scheduled: usize,
}

/// Continuous-batching pipeline over the echo model.
#[derive(Debug)]
pub struct ReferencePipeline {
    scheduler: SchedulerConfig,
    queues: Mutex<Queues>,
}

impl ReferencePipeline {
    pub fn new(scheduler: SchedulerConfig) -> Self {
        Self {
            scheduler,
            queues: Mutex::new(Queues::default()),
        }
    }

    /// Scheduler settings as configured. Only `cache_size` affects this engine.
    pub fn scheduler(&self) -> &SchedulerConfig {
        &self.scheduler
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache_capacity_bytes(&self) -> usize {
        self.scheduler.cache_size.max(1) << 30
    }
}

impl ContinuousBatchingPipeline for ReferencePipeline {
    fn add_request(
        &self,
        request_id: u64,
        input_ids: &[u32],
        config: GenerationConfig,
    ) -> Result<Arc<dyn GenerationHandle>> {
        if input_ids.is_empty() {
            bail!("request {request_id} has no input tokens");
        }
        let count = config.num_return_sequences.max(1);
        let stream = Arc::new(GenerationStream::new(count));
        let sequences = (0..count)
            .map(|_| Sequence::new(input_ids, config.clone()))
            .collect();
        self.lock().waiting.push_back(Request {
            id: request_id,
            sequences,
            stream: stream.clone(),
        });
        log::trace!("[pipeline][add][request: {request_id}]");
        Ok(stream)
    }

    fn step(&self) -> Result<()> {
        let mut queues = self.lock();

        queues.waiting.retain(|request| {
            let stopped = request.stream.stop_requested();
            if stopped {
                log::debug!("[pipeline][drop][request: {}]", request.id);
            }
            !stopped
        });
        queues.running.retain(|request| {
            let stopped = request.stream.stop_requested();
            if stopped {
                log::debug!("[pipeline][drop][request: {}]", request.id);
            }
            !stopped
        });

        while queues.running.len() < self.scheduler.max_num_seqs.max(1) {
            let Some(request) = queues.waiting.pop_front() else {
                break;
            };
            log::trace!("[pipeline][schedule][request: {}]", request.id);
            queues.running.push(request);
        }

        queues.scheduled = queues.running.len();
        for request in queues.running.iter_mut() {
            for (index, sequence) in request.sequences.iter_mut().enumerate() {
                let advance = sequence.advance();
                if !advance.tokens.is_empty() || advance.finish.is_some() {
                    request.stream.push(index, &advance);
                }
            }
        }

        queues.running.retain(|request| {
            let done = request.sequences.iter().all(|sequence| sequence.finish.is_some());
            if done {
                request.stream.close(GenerationStatus::Finished);
                log::trace!("[pipeline][finish][request: {}]", request.id);
            }
            !done
        });
        Ok(())
    }

    fn has_non_finished_requests(&self) -> bool {
        let queues = self.lock();
        !queues.waiting.is_empty() || !queues.running.is_empty()
    }

    fn metrics(&self) -> PipelineMetrics {
        let queues = self.lock();
        let tokens: usize = queues.running.iter().map(Request::context_len).sum();
        let kv_cache_usage_bytes = tokens * KV_BYTES_PER_TOKEN;
        PipelineMetrics {
            requests: queues.waiting.len() + queues.running.len(),
            scheduled_requests: queues.scheduled,
            cache_usage: 100.0 * kv_cache_usage_bytes as f32 / self.cache_capacity_bytes() as f32,
            kv_cache_usage_bytes,
        }
    }
}

/// Blocking pipeline over the echo model.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceLlm;

impl LlmPipeline for ReferenceLlm {
    fn generate(
        &self,
        input_ids: &[u32],
        config: &GenerationConfig,
        mut streamer: Option<&mut TextStreamer>,
    ) -> Result<Vec<GenerationOutput>> {
        if input_ids.is_empty() {
            bail!("no input tokens");
        }
        let count = config.num_return_sequences.max(1);
        let mut outputs = Vec::with_capacity(count);
        for index in 0..count {
            let mut sequence = Sequence::new(input_ids, config.clone());
            while sequence.finish.is_none() {
                let advance = sequence.advance();
                if let (0, Some(streamer)) = (index, streamer.as_deref_mut()) {
                    if streamer.write_all(&advance.tokens) != StreamingStatus::Running {
                        sequence.finish = Some(GenerationFinishReason::Stop);
                    }
                }
            }
            outputs.push(sequence.full_output());
        }
        if let Some(streamer) = streamer {
            streamer.end();
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GenerationConfig {
        GenerationConfig::default()
    }

    fn run(input: &str, config: GenerationConfig) -> GenerationOutput {
        let ids = ByteTokenizer.encode(input, true).expect("test");
        ReferenceLlm
            .generate(&ids, &config, None)
            .expect("test")
            .remove(0)
    }

    fn text(output: &GenerationOutput) -> String {
        ByteTokenizer.decode(&output.generated_ids).expect("test")
    }

    #[test]
    fn test_echo_then_eos() {
        let output = run("hello", config());
        assert_eq!(text(&output), "hello");
        assert_eq!(output.finish_reason, GenerationFinishReason::Stop);
    }

    #[test]
    fn test_max_new_tokens_gives_length() {
        let output = run("hello", GenerationConfig {
            max_new_tokens: 3,
            ..config()
        });
        assert_eq!(text(&output), "hel");
        assert_eq!(output.finish_reason, GenerationFinishReason::Length);
    }

    #[test]
    fn test_stop_string_excluded_by_default() {
        let output = run("hello world", GenerationConfig {
            stop_strings: ["lo w".to_owned()].into(),
            ..config()
        });
        assert_eq!(text(&output), "hel");
        assert_eq!(output.finish_reason, GenerationFinishReason::Stop);
    }

    #[test]
    fn test_stop_string_included_on_request() {
        let output = run("hello world", GenerationConfig {
            stop_strings: ["lo w".to_owned()].into(),
            include_stop_str_in_output: true,
            ..config()
        });
        assert_eq!(text(&output), "hello w");
    }

    #[test]
    fn test_partial_stop_match_is_released() {
        let output = run("hello", GenerationConfig {
            stop_strings: ["lox".to_owned()].into(),
            ..config()
        });
        assert_eq!(text(&output), "hello");
    }

    #[test]
    fn test_echo_prepends_prompt() {
        let output = run("hi", GenerationConfig {
            echo: true,
            max_new_tokens: 0,
            ..config()
        });
        assert_eq!(text(&output), "hi");
        assert_eq!(output.finish_reason, GenerationFinishReason::Length);
    }

    #[test]
    fn test_ignore_eos_cycles_prompt() {
        let output = run("ab", GenerationConfig {
            ignore_eos: true,
            max_new_tokens: 5,
            ..config()
        });
        assert_eq!(text(&output), "ababa");
    }

    #[test]
    fn test_pipeline_read_and_stop() {
        let pipeline = ReferencePipeline::new(SchedulerConfig::default());
        let handle = pipeline
            .add_request(0, &[BOS_TOKEN, b'a'.into(), b'b'.into()], config())
            .expect("test");
        assert!(pipeline.has_non_finished_requests());
        assert_eq!(handle.read().expect("test"), vec![GenerationOutput::default()]);

        pipeline.step().expect("test");
        let outputs = handle.read().expect("test");
        assert_eq!(outputs[0].generated_ids, vec![u32::from(b'a')]);
        assert_eq!(outputs[0].finish_reason, GenerationFinishReason::None);

        handle.stop();
        assert_eq!(handle.status(), GenerationStatus::Stop);
        pipeline.step().expect("test");
        assert!(!pipeline.has_non_finished_requests());
    }

    #[test]
    fn test_pipeline_respects_max_num_seqs() {
        let pipeline = ReferencePipeline::new(SchedulerConfig {
            max_num_seqs: 1,
            ..Default::default()
        });
        let first = pipeline.add_request(0, &[u32::from(b'a')], config()).expect("test");
        let second = pipeline.add_request(1, &[u32::from(b'b')], config()).expect("test");
        pipeline.step().expect("test");
        assert_eq!(pipeline.metrics().scheduled_requests, 1);
        assert!(first.can_read());
        assert!(!second.can_read());
        while pipeline.has_non_finished_requests() {
            pipeline.step().expect("test");
        }
        assert_eq!(first.read_all().expect("test")[0].generated_ids, vec![u32::from(b'a')]);
        assert_eq!(second.read_all().expect("test")[0].generated_ids, vec![u32::from(b'b')]);
    }

    #[test]
    fn test_pipeline_keeps_scheduler_settings() {
        let scheduler = SchedulerConfig {
            cache_size: 0,
            cache_eviction_config: Some(Default::default()),
            ..Default::default()
        };
        let pipeline = ReferencePipeline::new(scheduler.clone());
        assert_eq!(pipeline.scheduler(), &scheduler);
        assert_eq!(pipeline.cache_capacity_bytes(), 1 << 30);
    }
}
