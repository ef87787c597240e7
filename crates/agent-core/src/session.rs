//! Session Management
//!
//! A single interactive session: the chat buffer that lives as long as the
//! process, and the loop that reads utterances and runs turns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::message::{Conversation, Message};
use crate::reasoning::Agent;
use crate::turn::TurnObserver;

/// Exact-match command that ends the session
pub const EXIT_COMMAND: &str = "/bye";

/// Unique session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A complete agent session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier
    pub id: SessionId,

    /// Chat buffer: persona first, then every turn's context
    chat: Conversation,

    /// Number of turns started
    turns: usize,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last activity timestamp
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a session with an empty chat buffer
    pub fn new() -> Self {
        Self::with_chat(Conversation::new())
    }

    /// Create a session seeded with the character sheet and instructions
    pub fn with_persona(character_sheet: &str, instructions: &str) -> Self {
        let chat: Conversation = [
            Message::system(format!("CONTEXT:\n{character_sheet}")),
            Message::system(instructions),
        ]
        .into_iter()
        .collect();

        Self::with_chat(chat)
    }

    fn with_chat(chat: Conversation) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            chat,
            turns: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn chat(&self) -> &Conversation {
        &self.chat
    }

    pub fn chat_mut(&mut self) -> &mut Conversation {
        &mut self.chat
    }

    /// Count a new turn and return its number
    pub fn begin_turn(&mut self) -> usize {
        self.turns += 1;
        self.touch();
        self.turns
    }

    pub fn turns(&self) -> usize {
        self.turns
    }

    /// Update the activity timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Duration since creation
    pub fn duration(&self) -> chrono::Duration {
        self.updated_at - self.created_at
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// What the operator typed, once trimmed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperatorInput {
    /// Nothing but whitespace
    Empty,
    /// The exit command
    Exit,
    /// A turn's utterance
    Utterance(String),
}

pub fn classify_input(line: &str) -> OperatorInput {
    match line.trim() {
        "" => OperatorInput::Empty,
        EXIT_COMMAND => OperatorInput::Exit,
        text => OperatorInput::Utterance(text.to_string()),
    }
}

/// Fixed lines shown by the session loop
#[derive(Clone, Debug)]
pub struct SessionPrompts {
    pub greeting: String,
    pub explanation: String,
    pub goodbye: String,
}

impl Default for SessionPrompts {
    fn default() -> Self {
        Self {
            greeting: "😄 I'm the Dungeon Master".into(),
            explanation: "Ask me anything about me. Type '/bye' to quit or Ctrl+C to interrupt responses.".into(),
            goodbye: "🐺 Bye!".into(),
        }
    }
}

/// The human side of the session
#[async_trait]
pub trait Operator: TurnObserver {
    /// Next line of input, `None` once input is exhausted
    async fn read_line(&mut self) -> Result<Option<String>>;

    /// Show a line of text
    fn say(&mut self, line: &str);

    /// Token that interrupts the upcoming turn's reply
    fn turn_cancellation(&mut self) -> CancellationToken {
        CancellationToken::new()
    }
}

/// Read utterances and run turns until the operator leaves.
///
/// Turn failures never end the loop; only exhausted or failing input does.
pub async fn run_session<O: Operator>(
    agent: &Agent,
    session: &mut Session,
    operator: &mut O,
    prompts: &SessionPrompts,
) -> Result<()> {
    operator.say(&prompts.greeting);
    operator.say(&prompts.explanation);

    loop {
        let Some(line) = operator.read_line().await? else {
            debug!("Input closed");
            operator.say(&prompts.goodbye);
            break;
        };

        match classify_input(&line) {
            OperatorInput::Empty => continue,
            OperatorInput::Exit => {
                operator.say(&prompts.goodbye);
                break;
            }
            OperatorInput::Utterance(utterance) => {
                let cancel = operator.turn_cancellation();
                agent.run_turn(session, &utterance, operator, &cancel).await;
                // the watcher behind the token is tied to this turn
                cancel.cancel();
            }
        }
    }

    info!(
        session = %session.id,
        turns = session.turns(),
        secs = session.duration().num_seconds(),
        "Session ended"
    );
    Ok(())
}
