//! Per-conversation turn history.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use instruct_engine::{Role, Turn};

/// Process-wide store of conversations keyed by conversation id.
///
/// Each session only touches its own id; a conversation lives until the
/// session that created it calls [`ConversationStore::forget`].
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: Mutex<HashMap<String, Vec<Turn>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn conversations(&self) -> MutexGuard<'_, HashMap<String, Vec<Turn>>> {
        self.conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn append(&self, conversation_id: &str, turn: Turn) {
        self.conversations()
            .entry(conversation_id.to_string())
            .or_default()
            .push(turn);
    }

    /// Append a system turn unless it repeats the most recent one.
    /// Returns whether a turn was added.
    pub fn append_system(&self, conversation_id: &str, prompt: &str) -> bool {
        let mut conversations = self.conversations();
        let turns = conversations.entry(conversation_id.to_string()).or_default();
        let repeated = turns
            .iter()
            .rev()
            .find(|t| t.role == Role::System)
            .is_some_and(|t| t.content == prompt);
        if !repeated {
            turns.push(Turn::system(prompt));
        }
        !repeated
    }

    /// Snapshot of the turns so far.
    pub fn history(&self, conversation_id: &str) -> Vec<Turn> {
        self.conversations()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop the whole conversation. Returns whether it existed.
    pub fn forget(&self, conversation_id: &str) -> bool {
        self.conversations().remove(conversation_id).is_some()
    }

    /// Number of live conversations.
    pub fn len(&self) -> usize {
        self.conversations().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversations_are_isolated() {
        let store = ConversationStore::new();
        store.append("a", Turn::user("one"));
        store.append("b", Turn::user("two"));
        assert_eq!(store.history("a"), vec![Turn::user("one")]);
        assert_eq!(store.history("b"), vec![Turn::user("two")]);
        assert!(store.history("c").is_empty());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn repeated_system_prompt_is_not_duplicated() {
        let store = ConversationStore::new();
        assert!(store.append_system("a", "be brief"));
        store.append("a", Turn::user("hi"));
        store.append("a", Turn::assistant("hello"));
        assert!(!store.append_system("a", "be brief"));
        assert!(store.append_system("a", "be verbose"));

        let roles: Vec<Role> = store.history("a").iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::System]
        );
    }

    #[test]
    fn forget_drops_everything() {
        let store = ConversationStore::new();
        store.append("a", Turn::user("x"));
        assert!(store.forget("a"));
        assert!(!store.forget("a"));
        assert!(store.is_empty());
    }
}
