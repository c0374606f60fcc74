#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use genserve_core::{
    engine::{
        reference::{ByteTokenizer, ReferencePipeline},
        ContinuousBatchingPipeline, GenerationConfig, GenerationHandle, GenerationOutput,
        GenerationStatus, PipelineMetrics,
    },
    executor::FatalHandler,
    servable::{initialize_with_engine, Engine},
    ClientConnection, HttpPayload, Servable, ServableConfig,
};
use serde_json::Value;

pub const COMPLETIONS: &str = "/v3/completions";
pub const CHAT_COMPLETIONS: &str = "/v3/chat/completions";

pub fn config() -> ServableConfig {
    ServableConfig {
        name: "echo".into(),
        models_path: "does/not/exist".into(),
        ..Default::default()
    }
}

pub fn panic_on_fatal() -> FatalHandler {
    Arc::new(|err: &anyhow::Error| panic!("fatal engine error: {err:#}"))
}

pub fn servable_with(config: ServableConfig, engine: Engine) -> Arc<Servable> {
    let servable = initialize_with_engine(&config, Arc::new(ByteTokenizer), engine, panic_on_fatal())
        .expect("initialize servable");
    Arc::new(servable)
}

pub fn reference_servable(config: ServableConfig) -> Arc<Servable> {
    let pipeline = Arc::new(ReferencePipeline::new(config.scheduler.clone()));
    servable_with(config, Engine::ContinuousBatching(pipeline))
}

pub fn payload(uri: &str, body: Value) -> (HttpPayload, Arc<ClientConnection>) {
    let client = ClientConnection::new();
    (HttpPayload::new(uri, body.to_string(), client.clone()), client)
}

/// Splits concatenated SSE responses into the JSON (or `[DONE]`) payloads.
pub fn frames(chunks: &[String]) -> Vec<String> {
    chunks
        .iter()
        .flat_map(|chunk| chunk.split_terminator("\n\n"))
        .map(|frame| {
            frame
                .strip_prefix("data: ")
                .expect("frame starts with data: ")
                .to_owned()
        })
        .collect()
}

/// A handle that never produces anything until stopped.
#[derive(Debug, Default)]
pub struct IdleHandle {
    pub stops: AtomicUsize,
}

impl GenerationHandle for IdleHandle {
    fn status(&self) -> GenerationStatus {
        match self.stops.load(Ordering::SeqCst) {
            0 => GenerationStatus::Running,
            _ => GenerationStatus::Stop,
        }
    }

    fn can_read(&self) -> bool {
        false
    }

    fn read(&self) -> anyhow::Result<Vec<GenerationOutput>> {
        std::thread::sleep(std::time::Duration::from_millis(5));
        Ok(vec![GenerationOutput::default()])
    }

    fn read_all(&self) -> anyhow::Result<Vec<GenerationOutput>> {
        Ok(vec![])
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records admissions and hands out [`IdleHandle`]s.
#[derive(Debug, Default)]
pub struct RecordingPipeline {
    pub admitted: Mutex<Vec<u64>>,
    pub handles: Mutex<Vec<Arc<IdleHandle>>>,
}

impl ContinuousBatchingPipeline for RecordingPipeline {
    fn add_request(
        &self,
        request_id: u64,
        _input_ids: &[u32],
        _config: GenerationConfig,
    ) -> anyhow::Result<Arc<dyn GenerationHandle>> {
        self.admitted.lock().expect("test").push(request_id);
        let handle = Arc::new(IdleHandle::default());
        self.handles.lock().expect("test").push(handle.clone());
        Ok(handle)
    }

    fn step(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn has_non_finished_requests(&self) -> bool {
        false
    }

    fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics::default()
    }
}
