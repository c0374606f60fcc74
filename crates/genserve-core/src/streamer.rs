use std::sync::Arc;

use crate::engine::Tokenizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingStatus {
    Running,
    Stop,
    Cancel,
}

pub type StreamerCallback = Box<dyn FnMut(&str) -> StreamingStatus + Send>;

/// Incremental detokenizer.
///
/// Tokens are buffered until they decode to text that does not end in a partial
/// character. Decoded text is passed to the callback as soon as it is stable, and the
/// buffer is reset on every newline.
pub struct TextStreamer {
    tokenizer: Arc<dyn Tokenizer>,
    callback: StreamerCallback,
    tokens: Vec<u32>,
    printed: usize,
}

impl std::fmt::Debug for TextStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextStreamer")
            .field("tokens", &self.tokens)
            .field("printed", &self.printed)
            .finish()
    }
}

impl TextStreamer {
    pub fn new(
        tokenizer: Arc<dyn Tokenizer>,
        callback: impl FnMut(&str) -> StreamingStatus + Send + 'static,
    ) -> Self {
        Self {
            tokenizer,
            callback: Box::new(callback),
            tokens: Vec::new(),
            printed: 0,
        }
    }

    pub fn write(&mut self, token: u32) -> StreamingStatus {
        self.tokens.push(token);
        let text = match self.tokenizer.decode(&self.tokens) {
            Ok(text) => text,
            Err(err) => {
                log::warn!("[streamer][decode] {err:#}");
                return StreamingStatus::Running;
            }
        };

        if text.ends_with('\n') {
            let chunk = text.get(self.printed..).unwrap_or_default().to_owned();
            self.tokens.clear();
            self.printed = 0;
            return (self.callback)(&chunk);
        }
        if text.ends_with(char::REPLACEMENT_CHARACTER) {
            return StreamingStatus::Running;
        }
        match text.get(self.printed..) {
            Some(chunk) if !chunk.is_empty() => {
                let chunk = chunk.to_owned();
                self.printed = text.len();
                (self.callback)(&chunk)
            }
            _ => StreamingStatus::Running,
        }
    }

    pub fn write_all(&mut self, tokens: &[u32]) -> StreamingStatus {
        for &token in tokens {
            let status = self.write(token);
            if status != StreamingStatus::Running {
                return status;
            }
        }
        StreamingStatus::Running
    }

    /// Flushes whatever is still buffered, including a trailing partial character.
    pub fn end(&mut self) {
        if self.tokens.is_empty() {
            return;
        }
        let text = match self.tokenizer.decode(&self.tokens) {
            Ok(text) => text,
            Err(err) => {
                log::warn!("[streamer][decode] {err:#}");
                String::new()
            }
        };
        let chunk = text.get(self.printed..).unwrap_or_default().to_owned();
        self.tokens.clear();
        self.printed = 0;
        if !chunk.is_empty() {
            (self.callback)(&chunk);
        }
    }
}
