//! Server-sent events decoding

use super::RemoteClient;
use crate::client::{EventSource, ServerEvent};
use crate::core::error::{ReplicaError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt, TryStreamExt};

/// One dispatched `event:` / `data:` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawEvent {
    pub name: String,
    pub data: String,
}

/// Incremental line parser for `text/event-stream` bodies.
/// Chunks may split lines, and lines may split UTF-8 sequences.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    name: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RawEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<RawEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.name = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<RawEvent> {
        let name = self.name.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(RawEvent {
            name: name.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

/// Turn a raw body into decoded server events. Undecodable payloads are
/// logged and skipped; transport errors end up in the stream.
pub(crate) fn decode_stream<S>(body: S) -> BoxStream<'static, Result<ServerEvent>>
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    let mut decoder = SseDecoder::default();
    body.map(move |chunk| -> Vec<Result<ServerEvent>> {
        match chunk {
            Ok(bytes) => decoder
                .feed(&bytes)
                .into_iter()
                .filter_map(|raw| match ServerEvent::parse(&raw.name, &raw.data) {
                    Ok(event) => Some(Ok(event)),
                    Err(e) => {
                        tracing::warn!(event = %raw.name, error = %e, "Skipping undecodable server event");
                        None
                    }
                })
                .collect(),
            Err(e) => vec![Err(e)],
        }
    })
    .flat_map(stream::iter)
    .boxed()
}

#[async_trait]
impl EventSource for RemoteClient {
    async fn connect(&self) -> Result<BoxStream<'static, Result<ServerEvent>>> {
        let response = self.open_stream(&["sse", "v1", "events"], "text/event-stream").await?;
        tracing::info!(url = %response.url(), "Connected to server event stream");
        let body = response.bytes_stream().map_err(ReplicaError::from);
        Ok(decode_stream(body))
    }
}
