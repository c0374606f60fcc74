use std::{
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use genserve_core::{
    engine::GenerationHandle, run_stream, run_unary, servable::Engine, Calculator, ContextState,
    ServableError,
};
use serde_json::{json, Value};

mod common;
use common::*;

#[test]
fn test_unary_completion_stops_on_length() {
    let servable = reference_servable(config());
    let (payload, _client) = payload(
        COMPLETIONS,
        json!({"model": "echo", "prompt": "What is OpenVINO?", "max_tokens": 5, "temperature": 0, "seed": 1}),
    );
    let response: Value = serde_json::from_str(&run_unary(servable, payload).expect("test")).expect("test");

    let choices = response["choices"].as_array().expect("test");
    assert_eq!(choices.len(), 1);
    assert_eq!(choices[0]["finish_reason"], "length");
    assert_eq!(choices[0]["text"], "What ");
    assert_eq!(response["object"], "text_completion");
    assert_eq!(response["usage"]["completion_tokens"], 5);
    // BOS + 17 bytes
    assert_eq!(response["usage"]["prompt_tokens"], 18);
    assert_eq!(response["usage"]["total_tokens"], 23);
}

#[test]
fn test_streaming_completion_ends_with_done() {
    let servable = reference_servable(config());
    let (payload, _client) = payload(
        COMPLETIONS,
        json!({"model": "echo", "prompt": "What is OpenVINO?", "max_tokens": 5, "temperature": 0, "seed": 1, "stream": true}),
    );
    let mut chunks = vec![];
    run_stream(servable, payload, |chunk| {
        chunks.push(chunk);
        true
    })
    .expect("test");

    let frames = frames(&chunks);
    assert_eq!(frames.last().map(String::as_str), Some("[DONE]"));
    let last: Value = serde_json::from_str(&frames[frames.len() - 2]).expect("test");
    assert_eq!(last["choices"][0]["finish_reason"], "length");

    let text: String = frames[..frames.len() - 1]
        .iter()
        .map(|frame| serde_json::from_str::<Value>(frame).expect("test"))
        .map(|chunk| chunk["choices"][0]["text"].as_str().unwrap_or_default().to_owned())
        .collect();
    assert_eq!(text, "What ");
}

#[test]
fn test_streaming_usage_chunk() {
    let servable = reference_servable(config());
    let (payload, _client) = payload(
        CHAT_COMPLETIONS,
        json!({
            "model": "echo",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 3,
            "stream": true,
            "stream_options": {"include_usage": true}
        }),
    );
    let mut chunks = vec![];
    run_stream(servable, payload, |chunk| {
        chunks.push(chunk);
        true
    })
    .expect("test");

    let frames = frames(&chunks);
    assert_eq!(frames.last().map(String::as_str), Some("[DONE]"));
    let usage: Value = serde_json::from_str(&frames[frames.len() - 2]).expect("test");
    assert_eq!(usage["choices"], json!([]));
    assert_eq!(usage["usage"]["completion_tokens"], 3);

    let delta: Value = serde_json::from_str(&frames[0]).expect("test");
    assert_eq!(delta["object"], "chat.completion.chunk");
    assert!(delta["choices"][0]["delta"]["content"].is_string());
    assert_eq!(delta["usage"], Value::Null);
}

#[test]
fn test_unary_chat_uses_template() {
    let servable = reference_servable(config());
    let (payload, _client) = payload(
        CHAT_COMPLETIONS,
        json!({"model": "echo", "messages": [{"role": "user", "content": "hi"}]}),
    );
    let response: Value = serde_json::from_str(&run_unary(servable, payload).expect("test")).expect("test");
    assert_eq!(response["object"], "chat.completion");
    assert_eq!(response["choices"][0]["message"]["role"], "assistant");
    assert_eq!(response["choices"][0]["message"]["content"], "User: hi\n\nAssistant:");
    assert_eq!(response["choices"][0]["finish_reason"], "stop");
}

#[test]
fn test_echo_counts_only_generated_tokens() {
    let servable = reference_servable(config());
    let (payload, _client) = payload(
        COMPLETIONS,
        json!({"model": "echo", "prompt": "abc", "max_tokens": 2, "echo": true}),
    );
    let response: Value = serde_json::from_str(&run_unary(servable, payload).expect("test")).expect("test");
    assert_eq!(response["choices"][0]["text"], "abcab");
    assert_eq!(response["usage"]["prompt_tokens"], 4);
    assert_eq!(response["usage"]["completion_tokens"], 2);
}

#[test]
fn test_multiple_return_sequences() {
    let servable = reference_servable(config());
    let (payload, _client) = payload(
        COMPLETIONS,
        json!({"model": "echo", "prompt": "ab", "best_of": 3, "n": 2}),
    );
    let response: Value = serde_json::from_str(&run_unary(servable, payload).expect("test")).expect("test");
    let choices = response["choices"].as_array().expect("test");
    assert_eq!(choices.len(), 2);
    assert_eq!(choices[1]["index"], 1);
    assert_eq!(response["usage"]["completion_tokens"], 4);
}

#[test]
fn test_prompt_at_model_length_is_rejected() {
    let mut config = config();
    config.max_model_length = Some(4);
    let servable = reference_servable(config);
    let (payload, _client) = payload(
        COMPLETIONS,
        json!({"model": "echo", "prompt": "abc", "max_tokens": 1}),
    );
    let err = run_unary(servable.clone(), payload).expect_err("test");
    assert_eq!(
        err,
        ServableError::invalid("Number of prompt tokens: 4 + max tokens value: 1 exceeds model max length: 4")
    );

    let (payload, _client) = common::payload(COMPLETIONS, json!({"model": "echo", "prompt": "abcd"}));
    let err = run_unary(servable, payload).expect_err("test");
    assert_eq!(
        err,
        ServableError::invalid("Number of prompt tokens: 5 exceeds model max length: 4")
    );
}

#[test]
fn test_model_length_read_from_model_config() {
    let dir = tempfile::tempdir().expect("test");
    std::fs::write(dir.path().join("config.json"), r#"{"max_position_embeddings": 8}"#)
        .expect("test");
    let mut config = config();
    config.models_path = dir.path().to_path_buf();
    let servable = reference_servable(config);

    let (payload, _client) = payload(COMPLETIONS, json!({"model": "echo", "prompt": "abcdefghij"}));
    let err = run_unary(servable.clone(), payload).expect_err("test");
    assert_eq!(
        err,
        ServableError::invalid("Number of prompt tokens: 11 exceeds model max length: 8")
    );

    let (payload, _client) = common::payload(
        COMPLETIONS,
        json!({"model": "echo", "prompt": "abc", "max_tokens": 2}),
    );
    assert!(run_unary(servable, payload).is_ok());
}

#[test]
fn test_wrong_endpoint_and_bad_json() {
    let servable = reference_servable(config());
    let (payload, _client) = payload("/v3/embeddings", json!({"model": "echo"}));
    let err = run_unary(servable.clone(), payload).expect_err("test");
    assert_eq!(
        err,
        ServableError::invalid("Wrong endpoint. Allowed endpoints: /v3/chat/completions, /v3/completions")
    );

    let client = genserve_core::ClientConnection::new();
    let payload = genserve_core::HttpPayload::new(COMPLETIONS, "{not json", client);
    assert!(matches!(
        run_unary(servable, payload),
        Err(ServableError::InvalidArgument(_))
    ));
}

#[test]
fn test_assisted_decoding_knobs_are_exclusive() {
    let mut config = config();
    config.prompt_lookup = true;
    let servable = reference_servable(config);
    let (payload, _client) = payload(
        COMPLETIONS,
        json!({"model": "echo", "prompt": "hi", "num_assistant_tokens": 3, "assistant_confidence_threshold": 0.3}),
    );
    match run_unary(servable, payload) {
        Err(ServableError::InvalidArgument(message)) => assert!(message.contains("mutually exclusive")),
        other => panic!("expected invalid argument, got {other:?}"),
    }
}

#[test]
fn test_tokenize_endpoint() {
    let servable = reference_servable(config());
    let (payload, _client) = payload("/v3/tokenize", json!({"model": "echo", "text": "hi", "add_special_tokens": false}));
    let mut calculator = Calculator::open(servable, payload).expect("test");
    assert!(!calculator.is_stream());
    assert_eq!(calculator.complete().expect("test"), r#"{"tokens":[104,105]}"#);
    assert_eq!(calculator.context().state, ContextState::Done);
}

#[test]
fn test_disconnected_client_is_not_admitted() {
    let pipeline = Arc::new(RecordingPipeline::default());
    let servable = servable_with(config(), Engine::ContinuousBatching(pipeline.clone()));
    let (payload, client) = payload(COMPLETIONS, json!({"model": "echo", "prompt": "hi"}));
    client.disconnect();

    let err = Calculator::open(servable, payload).expect_err("test");
    assert_eq!(err, ServableError::Cancelled);
    assert!(pipeline.admitted.lock().expect("test").is_empty());
}

#[test]
fn test_one_handle_per_context_and_no_second_schedule() {
    let pipeline = Arc::new(RecordingPipeline::default());
    let servable = servable_with(config(), Engine::ContinuousBatching(pipeline.clone()));
    let (payload, _client) = payload(COMPLETIONS, json!({"model": "echo", "prompt": "hi"}));

    let mut ctx = servable.create_execution_context();
    servable.load_request(&mut ctx, payload).expect("test");
    servable.parse_request(&mut ctx).expect("test");
    servable.prepare_inputs(&mut ctx).expect("test");
    servable.schedule_execution(&mut ctx).expect("test");
    assert!(matches!(
        servable.schedule_execution(&mut ctx),
        Err(ServableError::Internal(_))
    ));
    assert_eq!(pipeline.admitted.lock().expect("test").len(), 1);
}

#[test]
fn test_request_ids_increase() {
    let pipeline = Arc::new(RecordingPipeline::default());
    let servable = servable_with(config(), Engine::ContinuousBatching(pipeline.clone()));
    for _ in 0..3 {
        let (payload, _client) = payload(COMPLETIONS, json!({"model": "echo", "prompt": "hi"}));
        Calculator::open(servable.clone(), payload).expect("test");
    }
    assert_eq!(*pipeline.admitted.lock().expect("test"), vec![0, 1, 2]);
}

#[test]
fn test_partial_read_is_bounded_and_empty_chunks_are_not_sent() {
    let pipeline = Arc::new(RecordingPipeline::default());
    let servable = servable_with(config(), Engine::ContinuousBatching(pipeline.clone()));
    let (payload, _client) = payload(COMPLETIONS, json!({"model": "echo", "prompt": "hi", "stream": true}));

    let mut ctx = servable.create_execution_context();
    servable.load_request(&mut ctx, payload).expect("test");
    servable.parse_request(&mut ctx).expect("test");
    servable.prepare_inputs(&mut ctx).expect("test");
    servable.schedule_execution(&mut ctx).expect("test");

    for _ in 0..3 {
        let start = Instant::now();
        servable.read_partial_execution_results(&mut ctx).expect("test");
        servable.prepare_partial_response(&mut ctx).expect("test");
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(ctx.response.is_empty());
        assert!(ctx.send_loopback_signal);
    }
}

#[test]
fn test_disconnect_stops_handle_once_and_cancels() {
    let pipeline = Arc::new(RecordingPipeline::default());
    let servable = servable_with(config(), Engine::ContinuousBatching(pipeline.clone()));
    let (payload, client) = payload(COMPLETIONS, json!({"model": "echo", "prompt": "hi", "stream": true}));

    let mut calculator = Calculator::open(servable, payload).expect("test");
    client.disconnect();
    client.disconnect();

    assert_eq!(calculator.next_chunk(), Err(ServableError::Cancelled));
    assert_eq!(calculator.context().state, ContextState::Cancelled);
    assert!(calculator.context().response.is_empty());

    let handles = pipeline.handles.lock().expect("test");
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].stops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_stopped_unary_generation_is_cancelled() {
    let pipeline = Arc::new(RecordingPipeline::default());
    let servable = servable_with(config(), Engine::ContinuousBatching(pipeline.clone()));
    let (payload, _client) = payload(COMPLETIONS, json!({"model": "echo", "prompt": "hi"}));

    let mut calculator = Calculator::open(servable, payload).expect("test");
    pipeline.handles.lock().expect("test")[0].stop();
    assert_eq!(calculator.complete(), Err(ServableError::Cancelled));
}
