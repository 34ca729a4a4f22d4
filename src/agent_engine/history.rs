use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::agent_engine::state::{
    ActionResult, ActionStatus, AgentOutcome, AgentState, Session, Snapshot, Termination,
};
use crate::config::AgentSettings;
use crate::errors::WebClawResult;
use crate::llm::types::{ChatMessage, ContentPart, ImageUrl, LlmResponse, MessageContent, ToolCall};

/// One item of the task conversation. Snapshots keep their PNG in memory for
/// rendering but serialize without it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationEntry {
    System {
        text: String,
    },
    User {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot: Option<Snapshot>,
    },
    Assistant {
        text: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        reasoning: String,
        #[serde(default)]
        tool_calls: Vec<ToolCall>,
    },
    Observation {
        results: Vec<ActionResult>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot: Option<Snapshot>,
    },
}

impl ConversationEntry {
    fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            ConversationEntry::User { snapshot, .. }
            | ConversationEntry::Observation { snapshot, .. } => snapshot.as_ref(),
            _ => None,
        }
    }
}

/// Ordered conversation of one session. Append-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    entries: Vec<ConversationEntry>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ConversationEntry) {
        self.entries.push(entry);
    }

    pub fn push_system(&mut self, text: impl Into<String>) {
        self.push(ConversationEntry::System { text: text.into() });
    }

    pub fn push_user(&mut self, text: impl Into<String>, snapshot: Option<Snapshot>) {
        self.push(ConversationEntry::User {
            text: text.into(),
            snapshot,
        });
    }

    pub fn push_assistant(&mut self, reply: &LlmResponse) {
        self.push(ConversationEntry::Assistant {
            text: reply.content.clone(),
            reasoning: reply.reasoning.clone(),
            tool_calls: reply.tool_calls.clone(),
        });
    }

    pub fn push_observation(&mut self, results: Vec<ActionResult>, snapshot: Option<Snapshot>) {
        self.push(ConversationEntry::Observation { results, snapshot });
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&ConversationEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the conversation as chat messages. Only the most recent
    /// snapshot is sent as an image; older ones become a one-line note so
    /// the request size stays flat as the task runs.
    pub fn render(&self) -> Vec<ChatMessage> {
        let latest_image = self
            .entries
            .iter()
            .rposition(|e| e.snapshot().is_some_and(|s| !s.image_png.is_empty()));

        let mut messages = Vec::with_capacity(self.entries.len() * 2);
        for (idx, entry) in self.entries.iter().enumerate() {
            let with_image = latest_image == Some(idx);
            match entry {
                ConversationEntry::System { text } => {
                    messages.push(ChatMessage::text("system", text.clone()));
                }
                ConversationEntry::User { text, snapshot } => {
                    messages.push(user_message(text.clone(), snapshot.as_ref(), with_image));
                }
                ConversationEntry::Assistant {
                    text, tool_calls, ..
                } => {
                    let mut msg = ChatMessage::text("assistant", text.clone());
                    if !tool_calls.is_empty() {
                        msg.tool_calls = Some(tool_calls.clone());
                    }
                    messages.push(msg);
                }
                ConversationEntry::Observation { results, snapshot } => {
                    let url = snapshot.as_ref().map(|s| s.url.as_str()).unwrap_or("");
                    for result in results {
                        messages.push(ChatMessage::tool_result(
                            &result.call_id,
                            render_result(result, url),
                        ));
                    }
                    if let Some(snap) = snapshot {
                        messages.push(user_message(
                            "Observation after the actions above.".to_string(),
                            Some(snap),
                            with_image,
                        ));
                    }
                }
            }
        }
        messages
    }
}

fn render_result(result: &ActionResult, url: &str) -> String {
    let body = serde_json::json!({
        "name": result.name,
        "status": result.status,
        "payload": result.payload,
        "error": result.error,
        "url": url,
        "timestamp": result.timestamp.to_rfc3339(),
    });
    body.to_string()
}

fn user_message(text: String, snapshot: Option<&Snapshot>, with_image: bool) -> ChatMessage {
    let Some(snap) = snapshot else {
        return ChatMessage::text("user", text);
    };
    let page = format!("{text}\nCurrent URL: {}\nPage title: {}", snap.url, snap.title);
    if !with_image {
        return ChatMessage::text("user", format!("{page}\n[earlier screenshot omitted]"));
    }
    let encoded = base64::engine::general_purpose::STANDARD.encode(&snap.image_png);
    ChatMessage {
        role: "user".into(),
        content: MessageContent::Parts(vec![
            ContentPart::Text { text: page },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:image/png;base64,{encoded}"),
                },
            },
        ]),
        tool_call_id: None,
        tool_calls: None,
    }
}

/// Per-turn tally kept in the session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnSummary {
    pub turn: u32,
    pub actions: Vec<String>,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub url: String,
}

impl TurnSummary {
    pub fn from_results(turn: u32, results: &[ActionResult], url: &str) -> Self {
        let count = |status: ActionStatus| results.iter().filter(|r| r.status == status).count();
        Self {
            turn,
            actions: results.iter().map(|r| r.name.clone()).collect(),
            succeeded: count(ActionStatus::Success),
            failed: count(ActionStatus::Error),
            cancelled: count(ActionStatus::Cancelled),
            url: url.to_string(),
        }
    }
}

/// Persisted view of a session: header, per-turn tallies, full conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub instruction: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub turns: u32,
    pub status: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<Termination>,
    pub final_url: String,
    pub final_title: String,
    pub turn_summaries: Vec<TurnSummary>,
    pub conversation: Conversation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<AgentOutcome>,
}

impl SessionRecord {
    pub fn new(session: &Session, instruction: &str) -> Self {
        Self {
            session_id: session.id.clone(),
            instruction: instruction.to_string(),
            created_at: session.created_at,
            updated_at: session.created_at,
            turns: session.turn,
            status: session.status,
            termination: None,
            final_url: session.current_url.clone(),
            final_title: session.current_title.clone(),
            turn_summaries: Vec::new(),
            conversation: Conversation::new(),
            outcome: None,
        }
    }

    /// Copies the live session header into the record.
    pub fn sync(&mut self, session: &Session) {
        self.turns = session.turn;
        self.status = session.status;
        self.final_url = session.current_url.clone();
        self.final_title = session.current_title.clone();
        self.updated_at = chrono::Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalLine {
    pub ts: i64,
    pub turn: u32,
    pub entry: ConversationEntry,
}

/// Writes `session_<id>.jsonl` as entries arrive and `session_<id>.json` at the end.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_settings(agent: &AgentSettings) -> Self {
        Self::new(
            agent
                .sessions_dir
                .clone()
                .unwrap_or_else(default_sessions_dir),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn journal_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("session_{session_id}.jsonl"))
    }

    pub fn record_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("session_{session_id}.json"))
    }

    /// Appends one conversation entry to the JSONL journal.
    pub fn append(&self, session_id: &str, turn: u32, entry: &ConversationEntry) -> WebClawResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let line = serde_json::to_string(&JournalLine {
            ts: chrono::Utc::now().timestamp_millis(),
            turn,
            entry: entry.clone(),
        })?;
        let path = self.journal_path(session_id);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(file, "{line}")?;
        tracing::debug!(path = %path.display(), "journal entry flushed");
        Ok(())
    }

    pub fn save(&self, record: &SessionRecord) -> WebClawResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.record_path(&record.session_id);
        std::fs::write(&path, serde_json::to_string_pretty(record)?)?;
        tracing::info!(path = %path.display(), "session record saved");
        Ok(path)
    }

    pub fn load(&self, session_id: &str) -> WebClawResult<SessionRecord> {
        let content = std::fs::read_to_string(self.record_path(session_id))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn read_journal(&self, session_id: &str) -> WebClawResult<Vec<JournalLine>> {
        let content = std::fs::read_to_string(self.journal_path(session_id))?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(Into::into))
            .collect()
    }
}

/// `<data_local_dir>/webclaw/sessions`, falling back to `./sessions`.
pub fn default_sessions_dir() -> PathBuf {
    match dirs::data_local_dir() {
        Some(base) => base.join("webclaw").join("sessions"),
        None => PathBuf::from("sessions"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_engine::state::ActionRequest;
    use crate::llm::types::FunctionCall;

    fn snapshot(url: &str) -> Snapshot {
        Snapshot::new(url.into(), "Title".into(), vec![1, 2, 3, 4])
    }

    fn request(call_id: &str) -> ActionRequest {
        ActionRequest {
            call_id: call_id.into(),
            name: "click_at".into(),
            args: Default::default(),
            declared_risk: None,
        }
    }

    fn sample() -> Conversation {
        let mut conv = Conversation::new();
        conv.push_system("be careful");
        conv.push_user("find docs", Some(snapshot("https://a.test/")));
        conv.push_assistant(&LlmResponse {
            content: String::new(),
            reasoning: String::new(),
            tool_calls: vec![ToolCall {
                id: "call_1".into(),
                call_type: "function".into(),
                function: FunctionCall {
                    name: "click_at".into(),
                    arguments: "{}".into(),
                },
            }],
        });
        conv.push_observation(
            vec![ActionResult::success(&request("call_1"), Default::default())],
            Some(snapshot("https://a.test/docs")),
        );
        conv
    }

    #[test]
    fn renders_tool_messages_and_latest_image_only() {
        let messages = sample().render();
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool", "user"]);

        // First user entry lost its image once a newer snapshot arrived.
        assert!(matches!(messages[1].content, MessageContent::Text(_)));
        assert!(messages[1].text_content().contains("omitted"));

        assert_eq!(messages[2].tool_calls.as_ref().map(Vec::len), Some(1));
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("call_1"));
        let tool_body: serde_json::Value =
            serde_json::from_str(&messages[3].text_content()).unwrap();
        assert_eq!(tool_body["status"], "success");
        assert_eq!(tool_body["url"], "https://a.test/docs");

        let MessageContent::Parts(parts) = &messages[4].content else {
            panic!("latest observation should carry an image");
        };
        assert!(matches!(
            &parts[1],
            ContentPart::ImageUrl { image_url } if image_url.url.starts_with("data:image/png;base64,")
        ));
    }

    #[test]
    fn serialized_conversation_has_no_image_bytes() {
        let json = serde_json::to_value(sample()).unwrap();
        let snap = &json["entries"][1]["snapshot"];
        assert_eq!(snap["image_len"], 4);
        assert!(snap.get("image_png").is_none());
    }

    #[test]
    fn store_writes_journal_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let session = Session::new();

        let conv = sample();
        for entry in conv.entries() {
            store.append(&session.id, 0, entry).unwrap();
        }
        assert_eq!(store.read_journal(&session.id).unwrap().len(), conv.len());

        let mut record = SessionRecord::new(&session, "find docs");
        record.conversation = conv;
        record.turn_summaries.push(TurnSummary::from_results(
            1,
            &[ActionResult::error(&request("call_2"), "nope")],
            "https://a.test/docs",
        ));
        let path = store.save(&record).unwrap();
        assert!(path.ends_with(format!("session_{}.json", session.id)));

        let loaded = store.load(&session.id).unwrap();
        assert_eq!(loaded.instruction, "find docs");
        assert_eq!(loaded.conversation.len(), 4);
        assert_eq!(loaded.turn_summaries[0].failed, 1);
    }
}
