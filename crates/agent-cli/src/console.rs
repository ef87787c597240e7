//! Console Operator
//!
//! Line-oriented terminal front end: reads utterances from stdin, renders
//! turn progress and reply fragments on stdout, and turns Ctrl+C into a
//! reply interruption.

use std::io::Write;

use async_trait::async_trait;
use dm_agent_core::{
    AgentError, Operator, Result, ToolCallRequest, ToolCallResult, TurnObserver, TurnState,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const RULE_WIDTH: usize = 80;

/// Fixed console texts
#[derive(Clone, Debug)]
pub struct ConsolePrompts {
    pub query_title: String,
    pub thinking: String,
    pub interrupt_hint: String,
}

impl Default for ConsolePrompts {
    fn default() -> Self {
        Self {
            query_title: "✋ Query".into(),
            thinking: "⏳".into(),
            interrupt_hint: "(Press Ctrl+C to interrupt)".into(),
        }
    }
}

/// Terminal operator
pub struct ConsoleOperator<R, W> {
    reader: R,
    out: W,
    prompts: ConsolePrompts,
    tools_detected: usize,
    detection_failed: bool,
    mid_line: bool,
    watch_ctrl_c: bool,
}

impl ConsoleOperator<BufReader<Stdin>, std::io::Stdout> {
    /// Operator on the process stdin/stdout
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), std::io::stdout()).with_ctrl_c(true)
    }
}

impl<R, W> ConsoleOperator<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: Write + Send,
{
    pub fn new(reader: R, out: W) -> Self {
        Self {
            reader,
            out,
            prompts: ConsolePrompts::default(),
            tools_detected: 0,
            detection_failed: false,
            mid_line: false,
            watch_ctrl_c: false,
        }
    }

    /// Listen for Ctrl+C while reading input and streaming replies
    pub fn with_ctrl_c(mut self, enabled: bool) -> Self {
        self.watch_ctrl_c = enabled;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, text: &str) {
        if self.mid_line {
            let _ = writeln!(self.out);
            self.mid_line = false;
        }
        let _ = writeln!(self.out, "{text}");
    }

    fn rule(&mut self) {
        self.line(&"=".repeat(RULE_WIDTH));
    }

    fn announce_detection(&mut self) {
        if self.tools_detected == 0 {
            self.line("🛠️ Tools completion received");
        }
    }
}

impl<R, W> TurnObserver for ConsoleOperator<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: Write + Send,
{
    fn on_state(&mut self, state: TurnState) {
        match state {
            TurnState::DetectingIntent => {
                self.tools_detected = 0;
                self.detection_failed = false;
                self.line("🚀 Starting tools detection...");
                self.line("⏳ Running tools completion...");
            }
            TurnState::ExecutingTools => {}
            TurnState::StreamingReply => {
                if self.tools_detected > 0 {
                    self.line("🎉 Tools calls executed!");
                } else if !self.detection_failed {
                    self.announce_detection();
                    self.line("✋ No function call");
                    self.line("");
                }
                self.line("🤖 Starting chat completion...");
                self.rule();
            }
            TurnState::Idle => {
                self.line("");
                self.rule();
                self.line("");
            }
        }
    }

    fn on_tool_detected(&mut self, request: &ToolCallRequest) {
        self.announce_detection();
        self.tools_detected += 1;
        let arguments = serde_json::Value::Object(request.arguments.clone());
        self.line(&format!("💡 tool detection: {} {arguments}", request.tool_name));
    }

    fn on_tool_result(&mut self, result: &ToolCallResult) {
        if result.succeeded {
            self.line(&format!(
                "✅ Tool {} executed successfully, result: {}",
                result.tool_name,
                result.text_output.as_deref().unwrap_or_default()
            ));
        } else {
            self.line(&format!(
                "🔴 Error calling tool: {}",
                result.error.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    fn on_fragment(&mut self, fragment: &str) {
        let _ = write!(self.out, "{fragment}");
        let _ = self.out.flush();
        self.mid_line = !fragment.ends_with('\n');
    }

    fn on_detection_failed(&mut self, _error: &AgentError) {
        self.detection_failed = true;
    }

    fn on_diagnostic(&mut self, message: &str) {
        self.line(&format!("😡 {message}"));
    }

    fn on_interrupted(&mut self) {
        self.line("⏹️ Response interrupted");
    }
}

/// Next input line without its terminator. Bytes that are not UTF-8 are
/// replaced rather than rejected; `None` at end of input.
async fn next_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf).await? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(&buf);
    Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
}

#[async_trait]
impl<R, W> Operator for ConsoleOperator<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: Write + Send,
{
    async fn read_line(&mut self) -> Result<Option<String>> {
        let hint = format!("{}{}", self.prompts.thinking, self.prompts.interrupt_hint);
        self.line(&hint);
        let _ = write!(self.out, "{}: ", self.prompts.query_title);
        let _ = self.out.flush();

        if !self.watch_ctrl_c {
            return next_line(&mut self.reader).await;
        }

        tokio::select! {
            line = next_line(&mut self.reader) => line,
            _ = tokio::signal::ctrl_c() => {
                debug!("Ctrl+C at prompt");
                let _ = writeln!(self.out);
                Ok(None)
            }
        }
    }

    fn say(&mut self, line: &str) {
        self.line(line);
    }

    fn turn_cancellation(&mut self) -> CancellationToken {
        let token = CancellationToken::new();
        if self.watch_ctrl_c {
            let watched = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = watched.cancelled() => {}
                    result = tokio::signal::ctrl_c() => {
                        if result.is_ok() {
                            debug!("Ctrl+C during turn");
                            watched.cancel();
                        }
                    }
                }
            });
        }
        token
    }
}
