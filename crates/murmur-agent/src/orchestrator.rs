//! The continuation loop driving one assistant turn
//!
//! A turn is a sequence of segments. Each segment opens one backend stream,
//! drains it through normalizer, phase classifier and tool-call interpreter,
//! and executes the detected tool calls. When tools ran, their results are
//! appended to the history and the next segment starts; otherwise the turn is
//! finalized.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use murmur_ai::{
    Backend, Content, Context, Delta, Message, Model, Normalizer, RawStream, ReasoningBoundary,
    Role, StreamOptions, Usage,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    chunk::{Chunk, ChunkSink, FinishStatus, ToolOutcome},
    classifier::{PhaseClassifier, PhaseEvent},
    control::{PauseSwitch, TurnHandle},
    error::{Error, Result},
    interpreter::{Scan, ToolCall, ToolCallInterpreter, tool_instructions},
    metrics::{Metrics, MetricsCollector, millis},
    tool::{ToolError, ToolExecutor, ToolResponse, ToolSpec},
};

/// Default cap on tool-call rounds per turn
pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 8;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No retries at all
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Read-only settings of one turn
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub model: Model,
    pub system_prompt: Option<String>,
    pub options: StreamOptions,
    /// Tool rounds allowed before tool syntax is treated as plain text
    pub max_tool_rounds: u32,
    pub retry: RetryConfig,
    /// Open markers added to the backend's declared reasoning boundary
    pub extra_open_markers: Vec<String>,
    /// Close markers added to the backend's declared reasoning boundary
    pub extra_close_markers: Vec<String>,
    /// Treat content before the first close marker as reasoning even when no
    /// open marker came
    pub reasoning_before_close: bool,
}

impl TurnConfig {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            system_prompt: None,
            options: StreamOptions::default(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            retry: RetryConfig::default(),
            extra_open_markers: Vec::new(),
            extra_close_markers: Vec::new(),
            reasoning_before_close: false,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: u32) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_open_marker(mut self, marker: impl Into<String>) -> Self {
        self.extra_open_markers.push(marker.into());
        self
    }

    pub fn with_close_marker(mut self, marker: impl Into<String>) -> Self {
        self.extra_close_markers.push(marker.into());
        self
    }

    pub fn with_reasoning_before_close(mut self, enabled: bool) -> Self {
        self.reasoning_before_close = enabled;
        self
    }

    /// The backend's declared boundary extended with this turn's markers
    pub fn reasoning_boundary(&self, declared: ReasoningBoundary) -> ReasoningBoundary {
        let enabled = declared.reasoning_before_close || self.reasoning_before_close;
        let boundary = self
            .extra_open_markers
            .iter()
            .fold(declared, |b, m| b.with_open_marker(m.clone()));
        self.extra_close_markers
            .iter()
            .fold(boundary, |b, m| b.with_close_marker(m.clone()))
            .with_reasoning_before_close(enabled)
    }
}

/// What a resolved turn hands back
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// The input history extended with this turn's messages
    pub history: Vec<Message>,
    pub status: FinishStatus,
    pub usage: Usage,
    pub metrics: Metrics,
    /// Concatenation of every `TextDelta`
    pub text: String,
    /// Reasoning of every segment
    pub reasoning: String,
    /// Number of backend streams the turn used
    pub segments: u32,
}

/// Drives turns against one backend
#[derive(Clone)]
pub struct Orchestrator {
    backend: Arc<dyn Backend>,
    tools: Option<Arc<dyn ToolExecutor>>,
    pause: PauseSwitch,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            tools: None,
            pause: PauseSwitch::new(),
        }
    }

    /// Tool capability used for calls found in answers
    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Share an existing pause switch
    pub fn with_pause_switch(mut self, pause: PauseSwitch) -> Self {
        self.pause = pause;
        self
    }

    pub fn pause_switch(&self) -> PauseSwitch {
        self.pause.clone()
    }

    /// Ask running turns to stop at the next chunk boundary
    pub fn pause(&self) {
        self.pause.pause();
    }

    pub fn resume(&self) {
        self.pause.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    /// Spawn a turn on the tokio runtime
    pub fn start(
        &self,
        history: Vec<Message>,
        config: TurnConfig,
        sink: impl ChunkSink + 'static,
    ) -> TurnHandle {
        let cancel = CancellationToken::new();
        let orchestrator = self.clone();
        let token = cancel.clone();
        let task =
            tokio::spawn(async move { orchestrator.run(history, &config, &sink, token).await });
        TurnHandle { cancel, task }
    }

    /// Run a turn in place. Every turn ends with exactly one terminal chunk;
    /// a transport error is reported both as `Chunk::Error` and as `Err`.
    pub async fn run(
        &self,
        history: Vec<Message>,
        config: &TurnConfig,
        sink: &dyn ChunkSink,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let mut turn = Turn {
            orchestrator: self,
            config,
            sink,
            cancel,
            metrics: MetricsCollector::start(),
            text: String::new(),
            reasoning: String::new(),
            answer_started: false,
            thinking_closed: false,
            calls: 0,
        };
        turn.drive(history).await
    }
}

/// How a segment stopped
enum SegmentEnd {
    Drained,
    Paused,
    Cancelled,
}

/// Mutable state of one segment
struct StreamSession {
    normalizer: Box<dyn Normalizer>,
    classifier: PhaseClassifier,
    interpreter: ToolCallInterpreter,
    /// Answer text including tool-call syntax
    raw_text: String,
    thinking_started: Option<Instant>,
    cancel: CancellationToken,
    responses: Vec<ToolResponse>,
    /// Whether the backend produced any delta yet
    received: bool,
}

impl StreamSession {
    fn new(
        normalizer: Box<dyn Normalizer>,
        config: &TurnConfig,
        tools_allowed: bool,
        first_call_index: usize,
        cancel: CancellationToken,
    ) -> Self {
        let boundary = config.reasoning_boundary(normalizer.reasoning_boundary());
        Self {
            normalizer,
            classifier: PhaseClassifier::new(boundary),
            interpreter: ToolCallInterpreter::new(tools_allowed, first_call_index),
            raw_text: String::new(),
            thinking_started: None,
            cancel,
            responses: Vec::new(),
            received: false,
        }
    }

    fn assistant_message(&self) -> Message {
        let mut content = Vec::new();
        if !self.classifier.reasoning().is_empty() {
            content.push(Content::thinking(self.classifier.reasoning()));
        }
        if !self.raw_text.is_empty() {
            content.push(Content::text(self.raw_text.clone()));
        }
        Message::new(Role::Assistant, content)
    }
}

struct Turn<'a> {
    orchestrator: &'a Orchestrator,
    config: &'a TurnConfig,
    sink: &'a dyn ChunkSink,
    cancel: CancellationToken,
    metrics: MetricsCollector,
    text: String,
    reasoning: String,
    answer_started: bool,
    thinking_closed: bool,
    /// Tool calls detected so far in the turn
    calls: usize,
}

impl Turn<'_> {
    async fn drive(&mut self, mut history: Vec<Message>) -> Result<TurnOutcome> {
        let specs = self
            .orchestrator
            .tools
            .as_ref()
            .map(|t| t.specs())
            .unwrap_or_default();
        let mut depth = 0u32;
        let mut segments = 0u32;

        let status = loop {
            if self.cancel.is_cancelled() {
                break FinishStatus::Cancelled;
            }
            if self.orchestrator.pause.is_paused() {
                tracing::debug!("Turn paused before segment {}", segments + 1);
                break FinishStatus::Paused;
            }

            let tools_allowed = !specs.is_empty() && depth < self.config.max_tool_rounds;
            let context = self.build_context(&history, tools_allowed.then_some(specs.as_slice()));
            segments += 1;
            tracing::debug!(
                "Opening segment {} (depth {}, tools {})",
                segments,
                depth,
                if tools_allowed { "on" } else { "off" }
            );

            let (session, end) = match self.run_segment(&context, tools_allowed).await {
                Ok(done) => done,
                Err(e) => return Err(self.fail(e)),
            };

            let message = session.assistant_message();
            if message.has_meaningful_content() || !session.responses.is_empty() {
                history.push(message);
            }
            if !session.responses.is_empty() {
                history.push(Message::new(
                    Role::User,
                    session
                        .responses
                        .iter()
                        .map(ToolResponse::to_content)
                        .collect(),
                ));
            }

            match end {
                SegmentEnd::Drained if !session.responses.is_empty() => {
                    depth += 1;
                }
                SegmentEnd::Drained => break FinishStatus::Completed,
                SegmentEnd::Paused => break FinishStatus::Paused,
                SegmentEnd::Cancelled => break FinishStatus::Cancelled,
            }
        };

        Ok(self.finalize(history, status, segments))
    }

    /// System prompt plus tool instructions, and the history so far
    fn build_context(&self, history: &[Message], tools: Option<&[ToolSpec]>) -> Context {
        let base = self
            .config
            .system_prompt
            .clone()
            .filter(|p| !p.trim().is_empty());
        let system_prompt = match (base, tools) {
            (Some(base), Some(specs)) => Some(format!("{}\n\n{}", base, tool_instructions(specs))),
            (None, Some(specs)) => Some(tool_instructions(specs)),
            (base, None) => base,
        };
        Context {
            system_prompt,
            messages: history.to_vec(),
        }
    }

    /// Open and drain one segment, retrying failures that happen before any
    /// delta arrived
    async fn run_segment(
        &mut self,
        context: &Context,
        tools_allowed: bool,
    ) -> murmur_ai::Result<(StreamSession, SegmentEnd)> {
        let mut attempt = 0u32;
        loop {
            let segment_cancel = self.cancel.child_token();
            let mut session = StreamSession::new(
                self.orchestrator.backend.normalizer(),
                &self.config,
                tools_allowed,
                self.calls,
                segment_cancel.clone(),
            );
            self.metrics.begin_segment();

            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok((session, SegmentEnd::Cancelled)),
                opened = self.orchestrator.backend.open(
                    &self.config.model,
                    context,
                    &self.config.options,
                    segment_cancel,
                ) => opened,
            };

            let result = match opened {
                Ok(stream) => self.drain(&mut session, stream).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(end) => return Ok((session, end)),
                Err(e)
                    if !session.received
                        && e.is_retryable()
                        && attempt < self.config.retry.max_retries =>
                {
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        "Request failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempt + 1,
                        self.config.retry.max_retries + 1,
                        e,
                        delay
                    );
                    attempt += 1;
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Ok((session, SegmentEnd::Cancelled)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn drain(
        &mut self,
        session: &mut StreamSession,
        mut stream: RawStream,
    ) -> murmur_ai::Result<SegmentEnd> {
        loop {
            if self.orchestrator.pause.is_paused() {
                tracing::debug!("Pause requested, stopping segment");
                session.interpreter.disable();
                self.flush(session).await;
                return Ok(SegmentEnd::Paused);
            }

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(SegmentEnd::Cancelled),
                next = stream.next() => next,
            };
            let Some(item) = next else {
                break;
            };

            let deltas = session.normalizer.normalize(&item?)?;
            if !deltas.is_empty() {
                session.received = true;
            }
            for delta in deltas {
                if let Some(end) = self.apply(session, delta).await {
                    return Ok(end);
                }
            }
        }

        match self.flush(session).await {
            Some(end) => Ok(end),
            None => Ok(SegmentEnd::Drained),
        }
    }

    async fn apply(&mut self, session: &mut StreamSession, delta: Delta) -> Option<SegmentEnd> {
        match delta {
            Delta::Reasoning(text) => {
                if !text.is_empty() {
                    self.metrics.mark_token();
                }
                let events = session.classifier.push_reasoning(&text);
                self.route(session, events).await
            }
            Delta::Text(text) => {
                if !text.is_empty() {
                    self.metrics.mark_token();
                }
                let events = session.classifier.push_content(&text);
                self.route(session, events).await
            }
            Delta::Usage(report) => {
                self.metrics.record_usage(&report);
                None
            }
            Delta::Finish(reason) => {
                tracing::debug!("Backend finished segment: {:?}", reason);
                let events = session.classifier.finish();
                self.route(session, events).await
            }
            Delta::SearchResults { results, source } => {
                self.sink.emit(Chunk::WebSearchComplete { results, source });
                None
            }
        }
    }

    /// End of segment: close the phase and release held-back text
    async fn flush(&mut self, session: &mut StreamSession) -> Option<SegmentEnd> {
        let events = session.classifier.finish();
        if let Some(end) = self.route(session, events).await {
            return Some(end);
        }
        if let Some(rest) = session.interpreter.finish() {
            self.emit_text(session, rest);
        }
        None
    }

    async fn route(
        &mut self,
        session: &mut StreamSession,
        events: Vec<PhaseEvent>,
    ) -> Option<SegmentEnd> {
        for event in events {
            match event {
                PhaseEvent::Reasoning(text) => {
                    let started = *session.thinking_started.get_or_insert_with(Instant::now);
                    self.reasoning.push_str(&text);
                    if self.answer_started || self.thinking_closed {
                        tracing::debug!("Suppressing reasoning received after the thinking phase");
                        continue;
                    }
                    self.sink.emit(Chunk::ThinkingDelta {
                        text,
                        elapsed_ms: millis(started.elapsed()),
                    });
                }
                PhaseEvent::ReasoningComplete(full_text) => {
                    if full_text.is_empty() || self.answer_started || self.thinking_closed {
                        continue;
                    }
                    self.thinking_closed = true;
                    let elapsed_ms = session
                        .thinking_started
                        .map(|s| millis(s.elapsed()))
                        .unwrap_or(0);
                    self.sink.emit(Chunk::ThinkingComplete {
                        full_text,
                        elapsed_ms,
                    });
                }
                PhaseEvent::Content(text) => {
                    for scan in session.interpreter.push(&text) {
                        match scan {
                            Scan::Text(text) => self.emit_text(session, text),
                            Scan::Call(call) => {
                                if let Some(end) = self.run_tool(session, call).await {
                                    return Some(end);
                                }
                            }
                        }
                    }
                }
            }
        }
        None
    }

    fn emit_text(&mut self, session: &mut StreamSession, text: String) {
        if text.is_empty() {
            return;
        }
        self.metrics.mark_content();
        self.answer_started = true;
        session.raw_text.push_str(&text);
        self.text.push_str(&text);
        self.sink.emit(Chunk::TextDelta { text });
    }

    /// Execute one detected call; `Some` when the turn was cancelled meanwhile
    async fn run_tool(&mut self, session: &mut StreamSession, call: ToolCall) -> Option<SegmentEnd> {
        session.raw_text.push_str(&call.raw_text);
        self.calls = call.index + 1;
        self.sink.emit(Chunk::ToolCallRequested {
            raw_text: call.raw_text.clone(),
            index: call.index,
            tool_name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
        });

        let call_id = uuid::Uuid::new_v4().to_string();
        let result = match &self.orchestrator.tools {
            Some(tools) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Some(SegmentEnd::Cancelled),
                result = tools.execute(
                    &call_id,
                    &call.tool_name,
                    call.arguments.clone(),
                    session.cancel.clone(),
                ) => result,
            },
            None => Err(ToolError::UnknownTool(call.tool_name.clone())),
        };

        let outcome = match result {
            Ok(value) => ToolOutcome::Result(value),
            Err(e) => {
                tracing::warn!("Tool '{}' failed: {}", call.tool_name, e);
                ToolOutcome::Error(e.to_string())
            }
        };
        self.sink.emit(Chunk::ToolCallResult {
            tool_name: call.tool_name.clone(),
            index: call.index,
            outcome: outcome.clone(),
        });
        session.responses.push(ToolResponse {
            call_id,
            tool_name: call.tool_name,
            arguments: call.arguments,
            outcome,
            source_index: call.index,
        });
        None
    }

    fn finalize(&mut self, history: Vec<Message>, status: FinishStatus, segments: u32) -> TurnOutcome {
        let (usage, metrics) = self.metrics.finish();
        tracing::debug!(
            "Turn finished ({:?}) after {} segment(s), {} tokens, {} ms",
            status,
            segments,
            usage.total_tokens,
            metrics.time_to_completion_ms
        );
        self.sink.emit(Chunk::TextComplete {
            full_text: self.text.clone(),
        });
        self.sink.emit(Chunk::BlockComplete {
            usage,
            metrics,
            status,
        });
        TurnOutcome {
            history,
            status,
            usage,
            metrics,
            text: self.text.clone(),
            reasoning: self.reasoning.clone(),
            segments,
        }
    }

    fn fail(&mut self, error: murmur_ai::Error) -> Error {
        let (usage, metrics) = self.metrics.finish();
        tracing::warn!("Turn failed after {} ms: {}", metrics.time_to_completion_ms, error);
        self.sink.emit(Chunk::Error {
            message: error.to_string(),
            usage,
            metrics,
        });
        Error::Ai(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        EchoTool, ScriptedBackend, StallTool, Step, collector, content, finish, reasoning,
        test_model, text_of, usage, wait_ms,
    };
    use crate::tool::ToolRegistry;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn config() -> TurnConfig {
        TurnConfig::new(test_model())
    }

    fn orchestrator(backend: ScriptedBackend) -> (Orchestrator, Arc<ScriptedBackend>) {
        let backend = Arc::new(backend);
        (Orchestrator::new(backend.clone()), backend)
    }

    fn with_tools(orchestrator: Orchestrator) -> Orchestrator {
        let registry = ToolRegistry::new()
            .with(Arc::new(EchoTool))
            .with(Arc::new(StallTool));
        orchestrator.with_tools(Arc::new(registry))
    }

    fn question() -> Vec<Message> {
        vec![Message::user("question")]
    }

    fn terminal_count(chunks: &[Chunk]) -> usize {
        chunks.iter().filter(|c| c.is_terminal()).count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reasoning_then_answer_order() {
        let (orch, _) = orchestrator(ScriptedBackend::new(vec![vec![
            reasoning("a"),
            reasoning("b"),
            content("c"),
            finish(),
        ]]));
        let (chunks, sink) = collector();

        let outcome = orch
            .run(question(), &config(), &sink, CancellationToken::new())
            .await
            .unwrap();

        let chunks = chunks.lock().clone();
        assert_eq!(
            chunks[..5],
            [
                Chunk::ThinkingDelta { text: "a".into(), elapsed_ms: 0 },
                Chunk::ThinkingDelta { text: "b".into(), elapsed_ms: 0 },
                Chunk::ThinkingComplete { full_text: "ab".into(), elapsed_ms: 0 },
                Chunk::TextDelta { text: "c".into() },
                Chunk::TextComplete { full_text: "c".into() },
            ]
        );
        assert!(matches!(
            chunks[5],
            Chunk::BlockComplete { status: FinishStatus::Completed, .. }
        ));
        assert_eq!(chunks.len(), 6);
        assert_eq!(outcome.reasoning, "ab");

        let last = outcome.history.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, vec![Content::thinking("ab"), Content::text("c")]);
    }

    #[tokio::test]
    async fn test_tool_loop_spans_two_segments() {
        let (orch, backend) = orchestrator(ScriptedBackend::new(vec![
            vec![content("partial answer "), content("[[tool:echo(x=1)]]"), finish()],
            vec![content(" continued"), finish()],
        ]));
        let orch = with_tools(orch);
        let (chunks, sink) = collector();

        let outcome = orch
            .run(question(), &config(), &sink, CancellationToken::new())
            .await
            .unwrap();

        let chunks = chunks.lock().clone();
        assert_eq!(
            chunks[..5],
            [
                Chunk::TextDelta { text: "partial answer ".into() },
                Chunk::ToolCallRequested {
                    raw_text: "[[tool:echo(x=1)]]".into(),
                    index: 0,
                    tool_name: "echo".into(),
                    arguments: json!({"x": 1}),
                },
                Chunk::ToolCallResult {
                    tool_name: "echo".into(),
                    index: 0,
                    outcome: ToolOutcome::Result(json!({"x": 1})),
                },
                Chunk::TextDelta { text: " continued".into() },
                Chunk::TextComplete { full_text: "partial answer  continued".into() },
            ]
        );
        assert!(matches!(chunks[5], Chunk::BlockComplete { .. }));
        assert_eq!(outcome.segments, 2);
        assert_eq!(outcome.status, FinishStatus::Completed);

        // user, assistant (with call syntax), tool results, assistant
        assert_eq!(outcome.history.len(), 4);
        assert_eq!(outcome.history[1].text(), "partial answer [[tool:echo(x=1)]]");
        assert!(matches!(
            &outcome.history[2].content[0],
            Content::ToolResult { tool_name, is_error: false, .. } if tool_name == "echo"
        ));
        assert_eq!(outcome.history[3].text(), " continued");

        let contexts = backend.contexts();
        assert_eq!(contexts.len(), 2);
        assert!(
            contexts[0]
                .system_prompt
                .as_deref()
                .unwrap_or_default()
                .contains("- echo:")
        );
        assert_eq!(contexts[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn test_unterminated_tool_syntax_is_literal() {
        let (orch, _) = orchestrator(ScriptedBackend::new(vec![vec![
            content("before [[tool:unterminated"),
            finish(),
        ]]));
        let orch = with_tools(orch);
        let (chunks, sink) = collector();

        let outcome = orch
            .run(question(), &config(), &sink, CancellationToken::new())
            .await
            .unwrap();

        let chunks = chunks.lock().clone();
        assert_eq!(text_of(&chunks), "before [[tool:unterminated");
        assert_eq!(outcome.text, "before [[tool:unterminated");
        assert!(
            !chunks
                .iter()
                .any(|c| matches!(c, Chunk::ToolCallRequested { .. }))
        );
        assert_eq!(outcome.segments, 1);
    }

    #[tokio::test]
    async fn test_no_thinking_after_thinking_phase_closed() {
        let (orch, _) = orchestrator(ScriptedBackend::new(vec![
            vec![reasoning("a"), content("[[tool:echo()]]"), reasoning("late")],
            vec![reasoning("again"), content("done"), reasoning("later still")],
        ]));
        let orch = with_tools(orch);
        let (chunks, sink) = collector();

        let outcome = orch
            .run(question(), &config(), &sink, CancellationToken::new())
            .await
            .unwrap();

        let chunks = chunks.lock().clone();
        let thinking: Vec<_> = chunks
            .iter()
            .filter_map(|c| match c {
                Chunk::ThinkingDelta { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(thinking, vec!["a"]);
        assert_eq!(
            chunks
                .iter()
                .filter(|c| matches!(c, Chunk::ThinkingComplete { .. }))
                .count(),
            1
        );

        let first_text = chunks
            .iter()
            .position(|c| matches!(c, Chunk::TextDelta { .. }))
            .unwrap();
        assert!(
            !chunks[first_text..]
                .iter()
                .any(|c| matches!(c, Chunk::ThinkingDelta { .. } | Chunk::ThinkingComplete { .. }))
        );
        assert_eq!(outcome.reasoning, "aagain");
    }

    #[tokio::test(start_paused = true)]
    async fn test_text_deltas_concatenate_to_text_complete() {
        let backend = ScriptedBackend::new(vec![vec![
            content("<thi"),
            content("nk>hmm</th"),
            content("ink>\n\nHel"),
            content("lo [[to"),
            content("ol wor"),
            content("ld"),
        ]])
        .with_boundary(ReasoningBoundary::think_tags());
        let (orch, _) = orchestrator(backend);
        let (chunks, sink) = collector();

        orch.run(question(), &config(), &sink, CancellationToken::new())
            .await
            .unwrap();

        let chunks = chunks.lock().clone();
        let full_text = chunks
            .iter()
            .find_map(|c| match c {
                Chunk::TextComplete { full_text } => Some(full_text.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(text_of(&chunks), full_text);
        assert_eq!(full_text, "Hello [[tool world");
        assert!(chunks.contains(&Chunk::ThinkingComplete {
            full_text: "hmm".into(),
            elapsed_ms: 0
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_metrics_are_ordered() {
        let (orch, _) = orchestrator(ScriptedBackend::new(vec![vec![
            wait_ms(100),
            reasoning("r"),
            wait_ms(50),
            content("x"),
            wait_ms(25),
            finish(),
        ]]));
        let (_, sink) = collector();

        let outcome = orch
            .run(question(), &config(), &sink, CancellationToken::new())
            .await
            .unwrap();

        let m = outcome.metrics;
        assert!(m.time_to_first_token_ms >= 100, "{:?}", m);
        assert!(m.time_to_first_content_ms >= 150, "{:?}", m);
        assert!(m.time_to_completion_ms >= 175, "{:?}", m);
        assert!(m.time_to_first_token_ms <= m.time_to_first_content_ms);
        assert!(m.time_to_first_content_ms <= m.time_to_completion_ms);
        assert!(m.time_to_completion_ms < 200, "{:?}", m);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_emits_one_terminal() {
        let (orch, _) = orchestrator(ScriptedBackend::new(vec![vec![
            content("partial"),
            Step::Hang,
        ]]));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = orch.start(question(), config(), tx);
        let first = rx.recv().await.unwrap();
        assert_eq!(first, Chunk::TextDelta { text: "partial".into() });
        handle.cancel();
        handle.cancel();

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.status, FinishStatus::Cancelled);
        assert_eq!(outcome.history.last().unwrap().text(), "partial");

        let mut rest = Vec::new();
        while let Some(chunk) = rx.recv().await {
            rest.push(chunk);
        }
        assert_eq!(rest[0], Chunk::TextComplete { full_text: "partial".into() });
        assert!(matches!(
            rest[1],
            Chunk::BlockComplete { status: FinishStatus::Cancelled, .. }
        ));
        assert_eq!(terminal_count(&rest), 1);
        assert_eq!(rest.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_during_tool_execution() {
        let (orch, _) = orchestrator(ScriptedBackend::new(vec![vec![
            content("[[tool:stall()]]"),
            finish(),
        ]]));
        let orch = with_tools(orch);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = orch.start(question(), config(), tx);
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Chunk::ToolCallRequested { .. }));
        handle.cancel();

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.status, FinishStatus::Cancelled);

        let mut rest = Vec::new();
        while let Some(chunk) = rx.recv().await {
            rest.push(chunk);
        }
        assert_eq!(terminal_count(&rest), 1);
        assert!(!rest.iter().any(|c| matches!(c, Chunk::ToolCallResult { .. })));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let (orch, backend) = orchestrator(ScriptedBackend::new(vec![vec![content("x")]]));
        let (chunks, sink) = collector();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = orch.run(question(), &config(), &sink, cancel).await.unwrap();

        assert_eq!(outcome.status, FinishStatus::Cancelled);
        assert_eq!(outcome.history.len(), 1);
        assert!(backend.contexts().is_empty());
        let chunks = chunks.lock().clone();
        assert_eq!(chunks[0], Chunk::TextComplete { full_text: String::new() });
        assert_eq!(terminal_count(&chunks), 1);
    }

    #[tokio::test]
    async fn test_pause_mid_drain_and_resume() {
        let (orch, _) = orchestrator(ScriptedBackend::new(vec![
            vec![content("one"), content(" two"), finish()],
            vec![content("fresh"), finish()],
        ]));
        let pause = orch.pause_switch();
        let (chunks, record) = collector();
        let sink = move |chunk: Chunk| {
            if matches!(chunk, Chunk::TextDelta { .. }) {
                pause.pause();
            }
            record(chunk);
        };

        let outcome = orch
            .run(question(), &config(), &sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, FinishStatus::Paused);
        assert_eq!(outcome.text, "one");
        let seen = chunks.lock().clone();
        assert!(matches!(
            seen.last(),
            Some(Chunk::BlockComplete { status: FinishStatus::Paused, .. })
        ));
        assert_eq!(terminal_count(&seen), 1);

        orch.resume();
        let (_, quiet) = collector();
        let next = orch
            .run(outcome.history, &config(), &quiet, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(next.status, FinishStatus::Completed);
        assert_eq!(next.text, "fresh");
    }

    #[tokio::test]
    async fn test_paused_before_start_does_not_open() {
        let (orch, backend) = orchestrator(ScriptedBackend::new(vec![vec![content("x")]]));
        orch.pause();
        let (chunks, sink) = collector();

        let outcome = orch
            .run(question(), &config(), &sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, FinishStatus::Paused);
        assert_eq!(outcome.segments, 0);
        assert!(backend.contexts().is_empty());
        assert_eq!(terminal_count(&chunks.lock()), 1);
    }

    #[tokio::test]
    async fn test_transport_error_is_terminal() {
        let (orch, _) = orchestrator(ScriptedBackend::new(vec![vec![
            content("partial"),
            Step::Fail(murmur_ai::Error::api("invalid_request_error", "bad request")),
        ]]));
        let (chunks, sink) = collector();

        let err = orch
            .run(question(), &config(), &sink, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Ai(murmur_ai::Error::Api { .. })));
        let chunks = chunks.lock().clone();
        assert!(matches!(chunks.last(), Some(Chunk::Error { message, .. }) if message.contains("bad request")));
        assert_eq!(terminal_count(&chunks), 1);
        assert!(!chunks.iter().any(|c| matches!(c, Chunk::TextComplete { .. })));
    }

    #[tokio::test]
    async fn test_unrecognized_payload_is_ignored() {
        let (orch, _) = orchestrator(ScriptedBackend::new(vec![vec![Step::Item(json!(
            "not an object"
        ))]]));
        let (chunks, sink) = collector();

        let config = config().with_retry(RetryConfig::disabled());
        let result = orch
            .run(question(), &config, &sink, CancellationToken::new())
            .await;

        assert!(result.is_ok());
        assert_eq!(terminal_count(&chunks.lock()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_open_failure() {
        let backend = ScriptedBackend::new(vec![vec![content("ok"), finish()]])
            .with_open_failure(murmur_ai::Error::RateLimited { retry_after: None });
        let (orch, backend) = orchestrator(backend);
        let (_, sink) = collector();

        let outcome = orch
            .run(question(), &config(), &sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.text, "ok");
        assert_eq!(outcome.segments, 1);
        assert_eq!(backend.contexts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_when_stream_fails_before_any_delta() {
        let (orch, backend) = orchestrator(ScriptedBackend::new(vec![
            vec![Step::Fail(murmur_ai::Error::from_status(503, "unavailable"))],
            vec![content("ok"), finish()],
        ]));
        let (chunks, sink) = collector();

        let outcome = orch
            .run(question(), &config(), &sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.text, "ok");
        assert_eq!(backend.contexts().len(), 2);
        assert!(!chunks.lock().iter().any(|c| matches!(c, Chunk::Error { .. })));
    }

    #[tokio::test]
    async fn test_non_retryable_open_failure() {
        let backend = ScriptedBackend::new(vec![])
            .with_open_failure(murmur_ai::Error::InvalidApiKey);
        let (orch, backend) = orchestrator(backend);
        let (chunks, sink) = collector();

        let result = orch
            .run(question(), &config(), &sink, CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::Ai(murmur_ai::Error::InvalidApiKey))));
        assert_eq!(backend.contexts().len(), 1);
        assert!(matches!(chunks.lock().last(), Some(Chunk::Error { .. })));
    }

    #[tokio::test]
    async fn test_depth_cap_makes_tool_syntax_literal() {
        let (orch, backend) = orchestrator(ScriptedBackend::new(vec![
            vec![content("[[tool:echo(n=1)]]")],
            vec![content("[[tool:echo(n=2)]]")],
        ]));
        let orch = with_tools(orch);
        let (chunks, sink) = collector();

        let outcome = orch
            .run(
                question(),
                &config().with_max_tool_rounds(1),
                &sink,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let chunks = chunks.lock().clone();
        assert_eq!(
            chunks
                .iter()
                .filter(|c| matches!(c, Chunk::ToolCallRequested { .. }))
                .count(),
            1
        );
        assert_eq!(outcome.text, "[[tool:echo(n=2)]]");
        assert_eq!(outcome.status, FinishStatus::Completed);
        assert!(backend.contexts()[1].system_prompt.is_none());
    }

    #[tokio::test]
    async fn test_tool_error_continues_turn() {
        let (orch, _) = orchestrator(ScriptedBackend::new(vec![
            vec![content("[[tool:missing()]]"), finish()],
            vec![content("recovered"), finish()],
        ]));
        let orch = with_tools(orch);
        let (chunks, sink) = collector();

        let outcome = orch
            .run(question(), &config(), &sink, CancellationToken::new())
            .await
            .unwrap();

        assert!(chunks.lock().contains(&Chunk::ToolCallResult {
            tool_name: "missing".into(),
            index: 0,
            outcome: ToolOutcome::Error("Tool not found: missing".into()),
        }));
        assert!(matches!(
            &outcome.history[2].content[0],
            Content::ToolResult { is_error: true, .. }
        ));
        assert_eq!(outcome.text, "recovered");
        assert_eq!(outcome.status, FinishStatus::Completed);
    }

    #[tokio::test]
    async fn test_calls_are_numbered_across_segments() {
        let (orch, _) = orchestrator(ScriptedBackend::new(vec![
            vec![content("[[tool:echo(a=1)]] [[tool:echo(b=2)]]")],
            vec![content("[[tool:echo(c=3)]]")],
            vec![content("end")],
        ]));
        let orch = with_tools(orch);
        let (chunks, sink) = collector();

        orch.run(question(), &config(), &sink, CancellationToken::new())
            .await
            .unwrap();

        let indices: Vec<_> = chunks
            .lock()
            .iter()
            .filter_map(|c| match c {
                Chunk::ToolCallResult { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_usage_summed_across_segments() {
        let (orch, _) = orchestrator(ScriptedBackend::new(vec![
            vec![content("[[tool:echo()]]"), usage(10, 2)],
            vec![content("ok"), usage(20, 3)],
        ]));
        let orch = with_tools(orch);
        let (_, sink) = collector();

        let outcome = orch
            .run(question(), &config(), &sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.usage.prompt_tokens, 30);
        assert_eq!(outcome.usage.completion_tokens, 5);
        assert_eq!(outcome.usage.total_tokens, 35);
    }

    #[tokio::test]
    async fn test_search_results_are_forwarded() {
        let (orch, _) = orchestrator(ScriptedBackend::new(vec![vec![
            Step::Item(json!({"search": ["https://example.com"]})),
            content("x"),
        ]]));
        let (chunks, sink) = collector();

        orch.run(question(), &config(), &sink, CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            chunks.lock().first(),
            Some(Chunk::WebSearchComplete { source: murmur_ai::SearchSource::Perplexity, .. })
        ));
    }

    #[tokio::test]
    async fn test_configured_close_marker() {
        let (orch, _) = orchestrator(ScriptedBackend::new(vec![vec![
            reasoning("r"),
            content("<|end_of_thought|>answer"),
        ]]));
        let (chunks, sink) = collector();

        orch.run(
            question(),
            &config().with_close_marker("<|end_of_thought|>"),
            &sink,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let chunks = chunks.lock().clone();
        assert_eq!(text_of(&chunks), "answer");
        assert!(
            chunks
                .iter()
                .any(|c| matches!(c, Chunk::ThinkingComplete { full_text, .. } if full_text == "r"))
        );
    }

    #[tokio::test]
    async fn test_reasoning_before_close_marker_without_open_marker() {
        let (orch, _) = orchestrator(
            ScriptedBackend::new(vec![vec![
                content("deliberating quietly"),
                content("</think>"),
                content("answer"),
                finish(),
            ]])
            .with_boundary(ReasoningBoundary::think_tags()),
        );
        let (chunks, sink) = collector();

        let outcome = orch
            .run(
                question(),
                &config().with_reasoning_before_close(true),
                &sink,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let chunks = chunks.lock().clone();
        assert_eq!(text_of(&chunks), "answer");
        assert!(chunks.iter().any(|c| matches!(
            c,
            Chunk::ThinkingComplete { full_text, .. } if full_text == "deliberating quietly"
        )));
        assert_eq!(outcome.reasoning, "deliberating quietly");
        assert_eq!(outcome.text, "answer");
    }

    #[tokio::test]
    async fn test_configured_heading_markers() {
        let (orch, _) = orchestrator(ScriptedBackend::new(vec![vec![
            content("###Thinking\nplan"),
            content("###Response\nanswer"),
            finish(),
        ]]));
        let (chunks, sink) = collector();

        let outcome = orch
            .run(
                question(),
                &config()
                    .with_open_marker("###Thinking")
                    .with_close_marker("###Response"),
                &sink,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let chunks = chunks.lock().clone();
        assert_eq!(text_of(&chunks), "answer");
        assert!(
            chunks
                .iter()
                .any(|c| matches!(c, Chunk::ThinkingComplete { full_text, .. } if full_text == "plan"))
        );
        assert_eq!(outcome.reasoning, "plan");
    }

    #[test]
    fn test_turn_markers_extend_declared_boundary() {
        let boundary = config()
            .with_open_marker("###Thinking")
            .with_close_marker("</think>")
            .with_close_marker("###Response")
            .reasoning_boundary(ReasoningBoundary::think_tags());
        assert!(boundary.open_markers.contains(&"###Thinking".to_string()));
        assert_eq!(
            boundary.close_markers.iter().filter(|m| *m == "</think>").count(),
            1
        );
        assert!(boundary.close_markers.contains(&"###Response".to_string()));
        assert!(!boundary.reasoning_before_close);

        let declared = ReasoningBoundary::think_tags().with_reasoning_before_close(true);
        assert!(config().reasoning_boundary(declared).reasoning_before_close);
    }

    #[tokio::test]
    async fn test_text_after_call_in_same_segment() {
        let (orch, backend) = orchestrator(ScriptedBackend::new(vec![vec![
            content("partial answer "),
            content("[[tool:echo(x=1)]]"),
            content(" continued"),
            finish(),
        ]]));
        let orch = with_tools(orch);
        let (chunks, sink) = collector();

        let outcome = orch
            .run(question(), &config(), &sink, CancellationToken::new())
            .await
            .unwrap();

        let chunks = chunks.lock().clone();
        assert_eq!(
            chunks[..5],
            [
                Chunk::TextDelta { text: "partial answer ".into() },
                Chunk::ToolCallRequested {
                    raw_text: "[[tool:echo(x=1)]]".into(),
                    index: 0,
                    tool_name: "echo".into(),
                    arguments: json!({"x": 1}),
                },
                Chunk::ToolCallResult {
                    tool_name: "echo".into(),
                    index: 0,
                    outcome: ToolOutcome::Result(json!({"x": 1})),
                },
                Chunk::TextDelta { text: " continued".into() },
                Chunk::TextComplete { full_text: "partial answer  continued".into() },
            ]
        );
        assert!(matches!(
            chunks[5],
            Chunk::BlockComplete { status: FinishStatus::Completed, .. }
        ));
        assert_eq!(chunks.len(), 6);

        // The follow-up segment still opens with the tool result, and adds
        // nothing to the history when it comes back empty.
        assert_eq!(outcome.segments, 2);
        assert_eq!(backend.contexts().len(), 2);
        assert_eq!(outcome.history.len(), 3);
        assert_eq!(
            outcome.history[1].text(),
            "partial answer [[tool:echo(x=1)]] continued"
        );
        assert!(matches!(
            &outcome.history[2].content[0],
            Content::ToolResult { tool_name, is_error: false, .. } if tool_name == "echo"
        ));
    }

    #[test]
    fn test_retry_delay_backoff() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(retry.delay_for_attempt(10), Duration::from_secs(60));
    }
}
