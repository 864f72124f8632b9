//! Line-oriented decoding of streamed chat completions.
//!
//! Network chunks do not respect line boundaries, so bytes are buffered until a newline
//! arrives. Both the OpenAI-style `data:` framing and Ollama's NDJSON are handled.

use serde_json::json;

use super::{Fragment, GenerationError};
use crate::config::ChatApi;
use crate::models::{OllamaChunk, StreamChunk};

pub struct LineDecoder {
    api: ChatApi,
    buf: Vec<u8>,
    usage: Option<serde_json::Value>,
    done: bool,
}

impl LineDecoder {
    pub fn new(api: ChatApi) -> Self {
        Self {
            api,
            buf: Vec::new(),
            usage: None,
            done: false,
        }
    }

    /// True once the completion marker has been decoded.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Fragment>, GenerationError> {
        self.buf.extend_from_slice(chunk);
        let mut fragments = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.decode_line(&line, &mut fragments)?;
        }
        Ok(fragments)
    }

    /// Flushes a trailing line that arrived without a newline.
    pub fn finish(&mut self) -> Result<Vec<Fragment>, GenerationError> {
        let rest = std::mem::take(&mut self.buf);
        let mut fragments = Vec::new();
        self.decode_line(&rest, &mut fragments)?;
        Ok(fragments)
    }

    fn decode_line(&mut self, raw: &[u8], out: &mut Vec<Fragment>) -> Result<(), GenerationError> {
        if self.done {
            return Ok(());
        }
        let line = std::str::from_utf8(raw)
            .map_err(|e| GenerationError::Malformed(format!("invalid utf-8: {}", e)))?
            .trim();
        if line.is_empty() {
            return Ok(());
        }
        match self.api {
            ChatApi::OpenAi => self.decode_openai(line, out),
            ChatApi::Ollama => self.decode_ollama(line, out),
        }
    }

    fn decode_openai(&mut self, line: &str, out: &mut Vec<Fragment>) -> Result<(), GenerationError> {
        // comments, `event:` and `id:` lines carry nothing we need
        let Some(payload) = line.strip_prefix("data:") else {
            return Ok(());
        };
        let payload = payload.trim();

        if payload == "[DONE]" {
            self.done = true;
            out.push(Fragment::Done(self.usage.take()));
            return Ok(());
        }

        let chunk: StreamChunk = serde_json::from_str(payload).map_err(|e| {
            GenerationError::Malformed(format!("{}: {}", e, truncate(payload)))
        })?;
        if let Some(usage) = chunk.usage.filter(|u| !u.is_null()) {
            self.usage = Some(json!({ "usage": usage }));
        }
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                out.push(Fragment::Delta(content));
            }
        }
        Ok(())
    }

    fn decode_ollama(&mut self, line: &str, out: &mut Vec<Fragment>) -> Result<(), GenerationError> {
        let chunk: OllamaChunk = serde_json::from_str(line)
            .map_err(|e| GenerationError::Malformed(format!("{}: {}", e, truncate(line))))?;

        if let Some(error) = chunk.error {
            return Err(GenerationError::Upstream {
                status: 200,
                body: error,
            });
        }
        if let Some(message) = chunk.message.filter(|m| !m.content.is_empty()) {
            out.push(Fragment::Delta(message.content));
        }
        if chunk.done {
            self.done = true;
            let meta = json!({
                "total_duration": chunk.total_duration,
                "load_duration": chunk.load_duration,
                "prompt_eval_count": chunk.prompt_eval_count,
                "eval_count": chunk.eval_count,
                "eval_duration": chunk.eval_duration,
                "elapsed_ms": chunk.total_duration.map(|ns| ns / 1_000_000),
            });
            out.push(Fragment::Done(Some(meta)));
        }
        Ok(())
    }
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(120) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
