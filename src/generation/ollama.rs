//! Streaming text generation through an Ollama server.
//!
//! `POST {url}/api/chat` with `stream: true` answers with one JSON object
//! per line; each carries a `message.content` token until `done` is true.
//! Earlier exchanges travel as chat messages ahead of the new prompt.

use crate::error::{Result, VoxError};
use crate::generation::generator::{GenerationRequest, Role, TextGenerator, TokenStream};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Lines};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Server base URL, e.g. `http://localhost:11434`.
    pub url: String,
    pub model: String,
    pub connect_timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: crate::defaults::GENERATOR_URL.to_string(),
            model: crate::defaults::GENERATOR_MODEL.to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

impl<'a> ChatBody<'a> {
    /// System prompt, then history oldest first, then the new prompt.
    fn new(model: &'a str, request: &'a GenerationRequest) -> Self {
        let system = request.system.as_deref().map(|content| ChatMessage {
            role: "system",
            content,
        });
        let history = request.history.iter().map(|entry| ChatMessage {
            role: entry.role.as_str(),
            content: &entry.text,
        });
        let prompt = ChatMessage {
            role: Role::User.as_str(),
            content: &request.prompt,
        };
        Self {
            model,
            messages: system.into_iter().chain(history).chain([prompt]).collect(),
            stream: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ChatDelta {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(default)]
    message: Option<ChatDelta>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// One decoded line of the response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Token(String),
    Done,
}

/// Decode one NDJSON line. Blank lines decode to an empty token.
pub fn parse_stream_line(line: &str) -> Result<StreamItem> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(StreamItem::Token(String::new()));
    }
    let parsed: StreamLine = serde_json::from_str(line).map_err(|e| VoxError::Generation {
        message: format!("Invalid stream line from generator: {}", e),
    })?;
    if let Some(error) = parsed.error {
        return Err(VoxError::Generation { message: error });
    }
    if parsed.done {
        return Ok(StreamItem::Done);
    }
    Ok(StreamItem::Token(parsed.message.unwrap_or_default().content))
}

pub struct OllamaGenerator {
    config: OllamaConfig,
    client: reqwest::blocking::Client,
}

impl OllamaGenerator {
    pub fn new(config: OllamaConfig) -> Result<Self> {
        // No overall timeout: a reply streams for as long as it takes.
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(None)
            .build()
            .map_err(|e| VoxError::Generation {
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self { config, client })
    }
}

impl TextGenerator for OllamaGenerator {
    fn stream_generate(&self, request: &GenerationRequest) -> Result<TokenStream> {
        let url = format!("{}/api/chat", self.config.url.trim_end_matches('/'));
        let body = ChatBody::new(&self.config.model, request);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| VoxError::Generation {
                message: format!("Failed to reach generator at {}: {}", url, e),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(VoxError::Generation {
                message: format!("Generator returned status {}", status),
            });
        }

        tracing::debug!(model = %self.config.model, "generation stream opened");
        Ok(Box::new(OllamaStream {
            lines: BufReader::new(response).lines(),
            done: false,
        }))
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

/// Dropping this drops the response body, which closes the connection.
struct OllamaStream {
    lines: Lines<BufReader<reqwest::blocking::Response>>,
    done: bool,
}

impl Iterator for OllamaStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let line = match self.lines.next()? {
            Ok(line) => line,
            Err(e) => {
                self.done = true;
                return Some(Err(VoxError::Generation {
                    message: format!("Generator stream read failed: {}", e),
                }));
            }
        };
        match parse_stream_line(&line) {
            Ok(StreamItem::Token(token)) => Some(Ok(token)),
            Ok(StreamItem::Done) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::generator::HistoryEntry;

    #[test]
    fn test_parse_token_line() {
        let item = parse_stream_line(
            r#"{"model":"m","message":{"role":"assistant","content":"{\"te"},"done":false}"#,
        )
        .unwrap();
        assert_eq!(item, StreamItem::Token("{\"te".to_string()));
    }

    #[test]
    fn test_parse_done_line() {
        let line = r#"{"model":"m","message":{"role":"assistant","content":""},"done":true}"#;
        let item = parse_stream_line(line).unwrap();
        assert_eq!(item, StreamItem::Done);
    }

    #[test]
    fn test_parse_error_line() {
        match parse_stream_line(r#"{"error":"model not found"}"#) {
            Err(VoxError::Generation { message }) => assert_eq!(message, "model not found"),
            other => panic!("Expected Generation error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_garbage_line() {
        assert!(parse_stream_line("not json").is_err());
        assert_eq!(
            parse_stream_line("   ").unwrap(),
            StreamItem::Token(String::new())
        );
    }

    #[test]
    fn test_body_without_system_or_history() {
        let request = GenerationRequest::new("hola");
        let json = serde_json::to_string(&ChatBody::new("m", &request)).unwrap();
        assert_eq!(
            json,
            r#"{"model":"m","messages":[{"role":"user","content":"hola"}],"stream":true}"#
        );
    }

    #[test]
    fn test_body_orders_system_history_prompt() {
        let request = GenerationRequest::new("y mañana?")
            .with_system(Some("Sé breve.".into()))
            .with_history(vec![
                HistoryEntry::user("qué tiempo hace"),
                HistoryEntry::assistant("Soleado."),
            ]);
        let body = ChatBody::new("m", &request);

        let roles: Vec<&str> = body.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(body.messages[2].content, "Soleado.");
        assert_eq!(body.messages[3].content, "y mañana?");
    }

    #[test]
    fn test_unreachable_server_fails_to_open() {
        let generator = OllamaGenerator::new(OllamaConfig {
            url: "http://127.0.0.1:1".to_string(),
            model: "m".to_string(),
            connect_timeout: Duration::from_millis(200),
        })
        .unwrap();
        assert!(matches!(
            generator.stream_generate(&GenerationRequest::new("hi")),
            Err(VoxError::Generation { .. })
        ));
    }
}
