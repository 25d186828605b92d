//! Session persistence seam. The orchestrator only needs a narrow view of
//! whatever stores conversations: create a record, append turns, rebuild a
//! textual context for providers without native resume, and remember the
//! provider's own thread id for providers with it.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use relay_protocol::Role;
use relay_protocol::Turn;

use crate::error::Result;

pub trait SessionStore: Send + Sync {
    fn create_session(&self, session_id: &str, provider: &str, cwd: &Path) -> Result<()>;

    fn add_message(&self, session_id: &str, role: Role, text: &str) -> Result<()>;

    /// Render prior turns as a prompt preamble. `None` when the session is
    /// unknown or has no history.
    fn build_conversation_context(&self, session_id: &str) -> Result<Option<String>>;

    fn external_session_id(&self, session_id: &str) -> Result<Option<String>>;

    fn set_external_session_id(&self, session_id: &str, external_id: &str) -> Result<()>;
}

#[derive(Default)]
struct SessionRecord {
    provider: String,
    cwd: PathBuf,
    external_id: Option<String>,
    turns: Vec<Turn>,
}

/// HashMap-backed store for the CLI and tests.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionRecord>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn cwd(&self, session_id: &str) -> Option<PathBuf> {
        self.lock().get(session_id).map(|record| record.cwd.clone())
    }

    pub fn provider(&self, session_id: &str) -> Option<String> {
        self.lock()
            .get(session_id)
            .map(|record| record.provider.clone())
    }

    pub fn turns(&self, session_id: &str) -> Vec<Turn> {
        self.lock()
            .get(session_id)
            .map(|record| record.turns.clone())
            .unwrap_or_default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn create_session(&self, session_id: &str, provider: &str, cwd: &Path) -> Result<()> {
        self.lock()
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRecord {
                provider: provider.to_string(),
                cwd: cwd.to_path_buf(),
                ..SessionRecord::default()
            });
        Ok(())
    }

    fn add_message(&self, session_id: &str, role: Role, text: &str) -> Result<()> {
        let mut sessions = self.lock();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| crate::error::RelayErr::store(format!("unknown session {session_id}")))?;
        record.turns.push(Turn {
            role,
            text: text.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn build_conversation_context(&self, session_id: &str) -> Result<Option<String>> {
        let sessions = self.lock();
        let Some(record) = sessions.get(session_id) else {
            return Ok(None);
        };
        if record.turns.is_empty() {
            return Ok(None);
        }
        let mut context = String::from("Previous conversation:\n");
        for turn in &record.turns {
            let speaker = match turn.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            context.push_str(speaker);
            context.push_str(": ");
            context.push_str(&turn.text);
            context.push('\n');
        }
        Ok(Some(context))
    }

    fn external_session_id(&self, session_id: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .get(session_id)
            .and_then(|record| record.external_id.clone()))
    }

    fn set_external_session_id(&self, session_id: &str, external_id: &str) -> Result<()> {
        let mut sessions = self.lock();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| crate::error::RelayErr::store(format!("unknown session {session_id}")))?;
        record.external_id = Some(external_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn context_interleaves_roles_in_order() {
        let store = InMemorySessionStore::new();
        store.create_session("s1", "claude", Path::new("/tmp")).expect("create");
        store.add_message("s1", Role::User, "hi").expect("add");
        store.add_message("s1", Role::Assistant, "hello").expect("add");
        let context = store
            .build_conversation_context("s1")
            .expect("context")
            .expect("present");
        assert_eq!(context, "Previous conversation:\nUser: hi\nAssistant: hello\n");
    }

    #[test]
    fn empty_or_unknown_session_has_no_context() {
        let store = InMemorySessionStore::new();
        assert!(store.build_conversation_context("nope").expect("ok").is_none());
        store.create_session("s1", "claude", Path::new("/tmp")).expect("create");
        assert!(store.build_conversation_context("s1").expect("ok").is_none());
    }

    #[test]
    fn add_message_to_unknown_session_errors() {
        let store = InMemorySessionStore::new();
        assert!(store.add_message("ghost", Role::User, "x").is_err());
    }

    #[test]
    fn external_id_round_trips() {
        let store = InMemorySessionStore::new();
        store.create_session("s1", "claude", Path::new("/tmp")).expect("create");
        assert_eq!(store.external_session_id("s1").expect("ok"), None);
        store
            .set_external_session_id("s1", "thread-9")
            .expect("set");
        assert_eq!(
            store.external_session_id("s1").expect("ok"),
            Some("thread-9".to_string())
        );
    }

    #[test]
    fn create_session_is_idempotent() {
        let store = InMemorySessionStore::new();
        store.create_session("s1", "claude", Path::new("/tmp")).expect("create");
        store.add_message("s1", Role::User, "hi").expect("add");
        store.create_session("s1", "claude", Path::new("/tmp")).expect("recreate");
        assert_eq!(store.turns("s1").len(), 1);
        assert_eq!(store.provider("s1").as_deref(), Some("claude"));
        assert_eq!(store.cwd("s1").as_deref(), Some(Path::new("/tmp")));
    }
}
