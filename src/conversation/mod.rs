// Conversation module
// Per-session history and the history-aware query rewrite


use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::pipeline::{QueryOptions, RagPipeline, RagResponse};
use crate::{RagError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Assistant => f.write_str("assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    #[inline]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[inline]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Turns kept per session; older turns are dropped
    pub max_turns: usize,
    /// Most recent turns folded into the rewritten query
    pub rewrite_turns: usize,
}

impl Default for ConversationConfig {
    #[inline]
    fn default() -> Self {
        Self {
            max_turns: 8,
            rewrite_turns: 4,
        }
    }
}

/// Append-only list of turns capped at `max_turns`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationHistory {
    turns: VecDeque<ConversationTurn>,
    max_turns: usize,
}

impl ConversationHistory {
    #[inline]
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(max_turns),
            max_turns: max_turns.max(1),
        }
    }

    /// Append a turn, dropping the oldest ones over the cap
    #[inline]
    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    #[inline]
    pub fn to_vec(&self) -> Vec<ConversationTurn> {
        self.turns.iter().cloned().collect()
    }
}

/// Fold the last `k` turns into the question so retrieval sees the conversation.
///
/// Each turn becomes a `role: content` line and the question goes on the
/// final line. With no history (or `k == 0`) the question is returned as is.
#[inline]
pub fn rewrite_query(question: &str, history: &[ConversationTurn], k: usize) -> String {
    if history.is_empty() || k == 0 {
        return question.to_string();
    }

    let start = history.len().saturating_sub(k);
    let turns = history[start..]
        .iter()
        .map(|turn| format!("{}: {}", turn.role, turn.content))
        .join("\n");
    format!("{}\n{}", turns, question)
}

type SessionHandle = Arc<tokio::sync::Mutex<ConversationHistory>>;

/// Owns conversation sessions keyed by id.
///
/// Each session's history is behind its own async mutex, held for a whole
/// turn: turns of one session run one at a time while different sessions
/// proceed independently.
#[derive(Debug, Default)]
pub struct ConversationManager {
    config: ConversationConfig,
    sessions: Mutex<HashMap<Uuid, SessionHandle>>,
}

impl ConversationManager {
    #[inline]
    pub fn new(config: ConversationConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn create_session(&self) -> Uuid {
        let id = Uuid::new_v4();
        let history = Arc::new(tokio::sync::Mutex::new(ConversationHistory::new(
            self.config.max_turns,
        )));
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, history);
        debug!("Created conversation session {}", id);
        id
    }

    /// Drop a session and its history; returns whether it existed
    #[inline]
    pub fn end_session(&self, session_id: Uuid) -> bool {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id)
            .is_some();
        if removed {
            debug!("Ended conversation session {}", session_id);
        }
        removed
    }

    #[inline]
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Snapshot of a session's turns, oldest first
    #[inline]
    pub async fn history(&self, session_id: Uuid) -> Result<Vec<ConversationTurn>> {
        let session = self.session(session_id)?;
        let history = session.lock().await;
        Ok(history.to_vec())
    }

    /// Answer `question` in the context of a session and record the turn.
    ///
    /// The user turn and the assistant answer are appended only when the
    /// pipeline returns a response; a failed turn leaves history untouched.
    #[inline]
    pub async fn chat(
        &self,
        pipeline: &RagPipeline,
        session_id: Uuid,
        question: &str,
        options: Option<QueryOptions>,
    ) -> Result<RagResponse> {
        let session = self.session(session_id)?;
        let mut history = session.lock().await;

        let response = pipeline
            .chat_with_history(question, &history.to_vec(), options)
            .await?;

        history.push(ConversationTurn::user(question));
        history.push(ConversationTurn::assistant(response.answer.clone()));
        info!(
            "Session {} now holds {} turns",
            session_id,
            history.len()
        );
        Ok(response)
    }

    fn session(&self, session_id: Uuid) -> Result<SessionHandle> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
            .cloned()
            .ok_or(RagError::UnknownSession(session_id))
    }
}
