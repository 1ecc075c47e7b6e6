use crate::error::{Result, VoxError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Streamed tokens. Dropping the stream closes it on the engine side.
pub type TokenStream = Box<dyn Iterator<Item = Result<String>> + Send>;

/// Speaker of one line of conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
}

impl HistoryEntry {
    pub fn user(text: &str) -> Self {
        Self {
            role: Role::User,
            text: text.to_string(),
        }
    }

    pub fn assistant(text: &str) -> Self {
        Self {
            role: Role::Assistant,
            text: text.to_string(),
        }
    }
}

/// Input for one generation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GenerationRequest {
    /// The user's final transcript.
    pub prompt: String,
    /// Instructions prepended by the engine, if it supports them.
    pub system: Option<String>,
    /// Earlier completed exchanges, oldest first.
    pub history: Vec<HistoryEntry>,
}

impl GenerationRequest {
    pub fn new(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            system: None,
            history: Vec::new(),
        }
    }

    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system = system;
        self
    }

    pub fn with_history(mut self, history: Vec<HistoryEntry>) -> Self {
        self.history = history;
        self
    }
}

/// Trait for streaming text-generation engines.
pub trait TextGenerator: Send + Sync {
    /// Open a token stream for `request`.
    ///
    /// An error here means nothing was generated; errors yielded by the
    /// stream mean generation broke off midway.
    fn stream_generate(&self, request: &GenerationRequest) -> Result<TokenStream>;

    /// Engine name for logging.
    fn name(&self) -> &str;
}

impl<T: TextGenerator> TextGenerator for Arc<T> {
    fn stream_generate(&self, request: &GenerationRequest) -> Result<TokenStream> {
        (**self).stream_generate(request)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Counters shared by a [`ScriptedGenerator`] and the streams it opened.
#[derive(Debug, Default)]
pub struct GeneratorStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
    tokens: AtomicUsize,
    open_now: AtomicUsize,
    max_open: AtomicUsize,
}

impl GeneratorStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Streams that were dropped by their consumer.
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tokens handed out across all streams.
    pub fn tokens(&self) -> usize {
        self.tokens.load(Ordering::SeqCst)
    }

    /// Highest number of streams open at the same time.
    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }
}

/// Generator that replays a fixed token script, for tests and demos.
#[derive(Debug, Clone)]
pub struct ScriptedGenerator {
    tokens: Vec<String>,
    token_delay: Duration,
    fail_open: bool,
    fail_after: Option<usize>,
    stats: Arc<GeneratorStats>,
    requests: Arc<Mutex<Vec<GenerationRequest>>>,
}

impl ScriptedGenerator {
    pub fn new<S: AsRef<str>>(tokens: &[S]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.as_ref().to_string()).collect(),
            token_delay: Duration::ZERO,
            fail_open: false,
            fail_after: None,
            stats: Arc::new(GeneratorStats::default()),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Split `text` into single-character tokens.
    pub fn from_text(text: &str) -> Self {
        let tokens: Vec<String> = text.chars().map(String::from).collect();
        Self::new(&tokens)
    }

    /// Sleep before yielding each token.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Fail when the stream is opened.
    pub fn with_open_failure(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Yield an error after `count` tokens.
    pub fn with_failure_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    pub fn stats(&self) -> Arc<GeneratorStats> {
        Arc::clone(&self.stats)
    }

    /// Every request received so far, including ones that failed to open.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl TextGenerator for ScriptedGenerator {
    fn stream_generate(&self, request: &GenerationRequest) -> Result<TokenStream> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if self.fail_open {
            return Err(VoxError::Generation {
                message: "scripted open failure".to_string(),
            });
        }

        let stats = &self.stats;
        stats.opened.fetch_add(1, Ordering::SeqCst);
        let now = stats.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_open.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(ScriptedStream {
            tokens: self.tokens.clone().into_iter(),
            position: 0,
            token_delay: self.token_delay,
            fail_after: self.fail_after,
            failed: false,
            stats: Arc::clone(&self.stats),
        }))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct ScriptedStream {
    tokens: std::vec::IntoIter<String>,
    position: usize,
    token_delay: Duration,
    fail_after: Option<usize>,
    failed: bool,
    stats: Arc<GeneratorStats>,
}

impl Iterator for ScriptedStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.fail_after == Some(self.position) {
            self.failed = true;
            return Some(Err(VoxError::Generation {
                message: "scripted stream failure".to_string(),
            }));
        }
        if !self.token_delay.is_zero() {
            thread::sleep(self.token_delay);
        }
        let token = self.tokens.next()?;
        self.position += 1;
        self.stats.tokens.fetch_add(1, Ordering::SeqCst);
        Some(Ok(token))
    }
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        self.stats.open_now.fetch_sub(1, Ordering::SeqCst);
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
    }
}
