use std::{convert::Infallible, sync::atomic::Ordering};

use futures_util::StreamExt;
use genserve_core::{
    servable::wrap_sse, Calculator, ClientConnection, HttpPayload, ServableError,
};
use salvo::{prelude::*, sse::SseEvent};
use serde_json::Value;

use super::{render_error, render_servable_error, DisconnectGuard};
use crate::types::AppState;

mod chat;
mod completion;
mod info;
#[path = "tokenize.rs"]
mod tokenize_handler;

pub use chat::chat_completions;
pub use completion::completions;
pub use info::models;
pub use tokenize_handler::tokenize;

const MODEL_NOT_FOUND: &str = "Model with requested name is not found";

/// Splits the servable's `data: ...\n\n` frames into SSE events.
fn events(chunk: &str) -> Vec<Result<SseEvent, Infallible>> {
    chunk
        .split_terminator("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(|data| Ok(SseEvent::default().text(data)))
        .collect()
}

fn error_frame(err: &ServableError) -> String {
    let body = serde_json::json!({ "error": err.to_string() });
    wrap_sse(&body.to_string())
}

/// Runs the streaming loop on a blocking thread, forwarding every chunk until the stream
/// ends or the receiver goes away.
fn respond_stream(mut calculator: Calculator, guard: DisconnectGuard, res: &mut Response) {
    let (sender, receiver) = flume::unbounded::<String>();
    let finished = guard.finished();
    tokio::task::spawn_blocking(move || loop {
        match calculator.next_chunk() {
            Ok(Some(chunk)) => {
                if sender.send(chunk).is_err() {
                    break;
                }
            }
            Ok(None) => {
                finished.store(true, Ordering::Release);
                break;
            }
            Err(ServableError::Cancelled) => break,
            Err(err) => {
                log::error!("[oai][stream] {err}");
                finished.store(true, Ordering::Release);
                let _ = sender.send(error_frame(&err));
                break;
            }
        }
    });

    let stream = receiver.into_stream().flat_map(move |chunk| {
        let _alive = &guard;
        futures_util::stream::iter(events(&chunk))
    });
    salvo::sse::stream(res, stream);
}

/// Serves one request of any generation endpoint. The URI path picks the endpoint and the
/// `model` field picks the servable.
async fn respond(depot: &mut Depot, req: &mut Request, res: &mut Response) {
    let state = match depot.obtain::<AppState>() {
        Ok(state) => state.clone(),
        Err(_) => {
            render_error(res, StatusCode::INTERNAL_SERVER_ERROR, "servables are not loaded");
            return;
        }
    };

    let uri = req.uri().path().to_owned();
    let headers = req
        .headers()
        .iter()
        .filter_map(|(key, value)| {
            let value = value.to_str().ok()?;
            Some((key.as_str().to_owned(), value.to_owned()))
        })
        .collect();
    let body = match req.payload().await {
        Ok(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Err(err) => {
            render_error(res, StatusCode::BAD_REQUEST, err.to_string());
            return;
        }
    };

    let model = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|json| json.get("model")?.as_str().map(str::to_owned));
    let Some(servable) = state.find(model.as_deref()) else {
        render_error(res, StatusCode::NOT_FOUND, MODEL_NOT_FOUND);
        return;
    };
    log::debug!("[oai][{}] {uri}", servable.name());

    let client = ClientConnection::new();
    let guard = DisconnectGuard::new(client.clone());
    let payload = HttpPayload::new(uri, body, client).with_headers(headers);

    let calculator = match tokio::task::spawn_blocking(move || Calculator::open(servable, payload)).await {
        Ok(Ok(calculator)) => calculator,
        Ok(Err(err)) => {
            guard.release();
            render_servable_error(res, err);
            return;
        }
        Err(err) => {
            render_error(res, StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
            return;
        }
    };

    if calculator.is_stream() {
        respond_stream(calculator, guard, res);
        return;
    }

    let mut calculator = calculator;
    match tokio::task::spawn_blocking(move || calculator.complete()).await {
        Ok(Ok(body)) => {
            guard.release();
            res.render(Text::Json(body));
        }
        Ok(Err(err)) => {
            guard.release();
            render_servable_error(res, err);
        }
        Err(err) => render_error(res, StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}
