use async_trait::async_trait;
use chrono::Utc;
use code_helper_chat::attachment::decode_data_url;
use code_helper_chat::content::{MessageContent, Role};
use code_helper_chat::db::models::{Conversation, Message};
use code_helper_chat::db::{ChatStore, Database, StoreError};
use code_helper_chat::llm::{ChatMessage, CompletionClient, LlmError};
use code_helper_chat::session::state::{DEFAULT_GREETING, DEFAULT_SYSTEM_PROMPT};
use code_helper_chat::session::{
    spawn_session, SendOutcome, SessionConfig, SessionContext, SessionEvent, SessionHandle, User,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x10, 0x08, 0x06,
];

#[derive(Default)]
struct FakeStore {
    conversations: Mutex<Vec<Conversation>>,
    messages: Mutex<Vec<Message>>,
    fail_create: bool,
    fail_append: bool,
    fail_list: bool,
    load_gate: Option<Arc<Notify>>,
    list_calls: AtomicUsize,
    write_calls: AtomicUsize,
}

impl FakeStore {
    fn seed(&self, conversation_id: &str, turns: &[ChatMessage]) {
        self.conversations.lock().unwrap().push(Conversation {
            id: conversation_id.to_string(),
            user_id: "alice".to_string(),
            title: "seeded...".to_string(),
            created_at: Utc::now(),
        });
        let mut messages = self.messages.lock().unwrap();
        for turn in turns {
            let id = format!("m{}", messages.len());
            messages.push(Message {
                id,
                conversation_id: conversation_id.to_string(),
                role: turn.role,
                content: turn.content.clone(),
                created_at: Utc::now(),
            });
        }
    }

    fn stored(&self, conversation_id: &str) -> Vec<ChatMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .map(ChatMessage::from)
            .collect()
    }

    fn calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
            + self.write_calls.load(Ordering::SeqCst)
            + self.conversations.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatStore for FakeStore {
    async fn create_conversation(
        &self,
        owner_id: &str,
        title: &str,
    ) -> Result<Conversation, StoreError> {
        if self.fail_create {
            return Err(StoreError::Corrupt("create refused".to_string()));
        }
        let mut conversations = self.conversations.lock().unwrap();
        let conversation = Conversation {
            id: format!("chat-{}", conversations.len() + 1),
            user_id: owner_id.to_string(),
            title: title.to_string(),
            created_at: Utc::now(),
        };
        conversations.push(conversation.clone());
        Ok(conversation)
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &MessageContent,
    ) -> Result<Message, StoreError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_append {
            return Err(StoreError::Corrupt("write refused".to_string()));
        }
        let mut messages = self.messages.lock().unwrap();
        let message = Message {
            id: format!("m{}", messages.len()),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.clone(),
            created_at: Utc::now(),
        };
        messages.push(message.clone());
        Ok(message)
    }

    async fn list_messages(
        &self,
        owner_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<Message>, StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.load_gate {
            gate.notified().await;
        }
        if self.fail_list {
            return Err(StoreError::Corrupt("read refused".to_string()));
        }
        let owned = self
            .conversations
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.id == conversation_id && c.user_id == owner_id);
        if !owned {
            return Err(StoreError::ConversationNotFound(conversation_id.to_string()));
        }
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn list_conversations(&self, owner_id: &str) -> Result<Vec<Conversation>, StoreError> {
        Ok(self
            .conversations
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.user_id == owner_id)
            .cloned()
            .collect())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.conversations
            .lock()
            .unwrap()
            .retain(|c| c.id != conversation_id);
        Ok(())
    }
}

struct ScriptedCompletion {
    reply: Result<String, u16>,
    gate: Option<Arc<Notify>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedCompletion {
    fn replying(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            gate: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn failing(status: u16) -> Self {
        Self {
            reply: Err(status),
            gate: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletion {
    async fn complete(&self, turns: &[ChatMessage]) -> Result<ChatMessage, LlmError> {
        self.requests.lock().unwrap().push(turns.to_vec());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        match &self.reply {
            Ok(text) => Ok(ChatMessage::assistant(text.as_str())),
            Err(status) => Err(LlmError::Api {
                status: *status,
                message: "upstream unavailable".to_string(),
            }),
        }
    }
}

fn alice() -> Arc<SessionContext> {
    Arc::new(SessionContext::authenticated(User {
        id: "alice".to_string(),
        email: Some("alice@example.com".to_string()),
    }))
}

fn start(store: Arc<FakeStore>, completion: Arc<ScriptedCompletion>) -> SessionHandle {
    spawn_session(alice(), SessionConfig::default(), store, completion)
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn first_send_from_new_chat_creates_and_persists() {
    let store = Arc::new(FakeStore::default());
    let completion = Arc::new(ScriptedCompletion::replying("try a for-loop"));
    let session = start(store.clone(), completion.clone());
    let mut events = session.subscribe();

    let outcome = session.send_text("fix my loop").await.unwrap();
    assert_eq!(outcome, SendOutcome::Completed);

    let greeting = ChatMessage::assistant(DEFAULT_GREETING);
    let user = ChatMessage::user("fix my loop");
    let reply = ChatMessage::assistant("try a for-loop");

    let snapshot = session.snapshot();
    assert_eq!(snapshot.messages, vec![greeting.clone(), user.clone(), reply.clone()]);
    assert!(!snapshot.busy);
    assert_eq!(snapshot.input, "");

    let conversations = store.conversations.lock().unwrap().clone();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].title, "fix my loop...");
    assert_eq!(conversations[0].user_id, "alice");
    assert_eq!(snapshot.conversation_id.as_deref(), Some(conversations[0].id.as_str()));

    assert_eq!(
        completion.requests(),
        vec![vec![ChatMessage::system(DEFAULT_SYSTEM_PROMPT), greeting, user.clone()]]
    );
    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::ConversationCreated(conversations[0].id.clone())
    );

    let id = conversations[0].id.clone();
    eventually(|| store.stored(&id).len() == 2).await;
    assert_eq!(store.stored(&id), vec![user, reply]);

    // The host routes to the new id; that must not reload or reset the view.
    session.navigate(Some(id)).await.unwrap();
    assert_eq!(session.snapshot().messages.len(), 3);
    assert_eq!(store.list_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn completion_failure_shows_error_message() {
    let store = Arc::new(FakeStore::default());
    let completion = Arc::new(ScriptedCompletion::failing(502));
    let session = start(store.clone(), completion);

    let outcome = session.send_text("why is this slow?").await.unwrap();
    assert_eq!(outcome, SendOutcome::Completed);

    let snapshot = session.snapshot();
    assert_eq!(snapshot.messages.len(), 3);
    let last = snapshot.messages.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert!(last.content.text().contains("502"));
    assert!(last.content.text().contains("upstream unavailable"));
    assert!(!snapshot.busy);

    // The user message was kept and saved; the error message was not.
    let id = snapshot.conversation_id.unwrap();
    eventually(|| store.stored(&id).len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.stored(&id), vec![ChatMessage::user("why is this slow?")]);
}

#[tokio::test]
async fn empty_send_touches_nothing() {
    let store = Arc::new(FakeStore::default());
    let completion = Arc::new(ScriptedCompletion::replying("unused"));
    let session = start(store.clone(), completion.clone());

    assert_eq!(session.send().await.unwrap(), SendOutcome::Ignored);
    assert_eq!(session.send_text("  \n ").await.unwrap(), SendOutcome::Ignored);

    assert_eq!(session.snapshot().messages, vec![ChatMessage::assistant(DEFAULT_GREETING)]);
    assert_eq!(store.calls(), 0);
    assert!(completion.requests().is_empty());
}

#[tokio::test]
async fn navigation_loads_once_and_new_chat_is_offline() {
    let store = Arc::new(FakeStore::default());
    let history = vec![ChatMessage::user("old question"), ChatMessage::assistant("old answer")];
    store.seed("chat-9", &history);
    let session = start(store.clone(), Arc::new(ScriptedCompletion::replying("unused")));

    session.navigate(Some("chat-9".to_string())).await.unwrap();
    assert_eq!(session.snapshot().messages, history);

    session.navigate(Some("chat-9".to_string())).await.unwrap();
    assert_eq!(store.list_calls.load(Ordering::SeqCst), 1);

    session.navigate(None).await.unwrap();
    let snapshot = session.snapshot();
    assert_eq!(snapshot.messages, vec![ChatMessage::assistant(DEFAULT_GREETING)]);
    assert!(snapshot.conversation_id.is_none());
    assert_eq!(store.list_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn repeated_navigation_waits_for_the_pending_load() {
    let gate = Arc::new(Notify::new());
    let store = Arc::new(FakeStore {
        load_gate: Some(gate.clone()),
        ..FakeStore::default()
    });
    let history = vec![ChatMessage::user("old question"), ChatMessage::assistant("old answer")];
    store.seed("chat-9", &history);
    let session = start(store.clone(), Arc::new(ScriptedCompletion::replying("unused")));

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.navigate(Some("chat-9".to_string())).await })
    };
    let mut watch = session.watch();
    tokio::time::timeout(Duration::from_secs(2), watch.wait_for(|s| s.busy))
        .await
        .unwrap()
        .unwrap();

    let second = {
        let session = session.clone();
        tokio::spawn(async move { session.navigate(Some("chat-9".to_string())).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished());

    gate.notify_one();
    second.await.unwrap().unwrap();
    let snapshot = session.snapshot();
    assert_eq!(snapshot.messages, history);
    assert!(!snapshot.busy);

    first.await.unwrap().unwrap();
    assert_eq!(store.list_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn another_users_conversation_does_not_load() {
    let store = Arc::new(FakeStore::default());
    store.seed("chat-9", &[ChatMessage::user("alice only")]);
    let bob = Arc::new(SessionContext::authenticated(User {
        id: "bob".to_string(),
        email: None,
    }));
    let session = spawn_session(
        bob,
        SessionConfig::default(),
        store,
        Arc::new(ScriptedCompletion::replying("unused")),
    );

    session.navigate(Some("chat-9".to_string())).await.unwrap();
    let snapshot = session.snapshot();
    assert_eq!(snapshot.conversation_id.as_deref(), Some("chat-9"));
    assert!(snapshot.messages.is_empty());
    assert!(!snapshot.busy);
}

#[tokio::test]
async fn load_failure_is_silent() {
    let store = Arc::new(FakeStore {
        fail_list: true,
        ..FakeStore::default()
    });
    let session = start(store, Arc::new(ScriptedCompletion::replying("unused")));

    session.navigate(Some("chat-1".to_string())).await.unwrap();
    let snapshot = session.snapshot();
    assert!(snapshot.messages.is_empty());
    assert!(!snapshot.busy);
}

#[tokio::test]
async fn store_write_failure_does_not_block_reply() {
    let store = Arc::new(FakeStore {
        fail_append: true,
        ..FakeStore::default()
    });
    let session = start(store.clone(), Arc::new(ScriptedCompletion::replying("done")));

    assert_eq!(session.send_text("hi").await.unwrap(), SendOutcome::Completed);
    assert_eq!(session.snapshot().messages.len(), 3);
    eventually(|| store.write_calls.load(Ordering::SeqCst) == 2).await;
}

#[tokio::test]
async fn create_failure_continues_unsaved() {
    let store = Arc::new(FakeStore {
        fail_create: true,
        ..FakeStore::default()
    });
    let completion = Arc::new(ScriptedCompletion::replying("still here"));
    let session = start(store.clone(), completion.clone());
    let mut events = session.subscribe();

    assert_eq!(session.send_text("hello").await.unwrap(), SendOutcome::Completed);

    let snapshot = session.snapshot();
    assert!(snapshot.conversation_id.is_none());
    assert_eq!(snapshot.messages.len(), 3);
    assert_eq!(completion.requests().len(), 1);
    assert_eq!(store.write_calls.load(Ordering::SeqCst), 0);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn switching_chats_while_sending_discards_the_reply() {
    let store = Arc::new(FakeStore::default());
    store.seed("chat-a", &[ChatMessage::user("a1"), ChatMessage::assistant("a2")]);
    store.seed("chat-b", &[ChatMessage::user("b1"), ChatMessage::assistant("b2")]);
    let gate = Arc::new(Notify::new());
    let completion = Arc::new(ScriptedCompletion {
        reply: Ok("late reply".to_string()),
        gate: Some(gate.clone()),
        requests: Mutex::new(Vec::new()),
    });
    let session = start(store.clone(), completion.clone());
    session.navigate(Some("chat-a".to_string())).await.unwrap();

    let sender = session.clone();
    let pending = tokio::spawn(async move { sender.send_text("a3").await });
    let mut watch = session.watch();
    tokio::time::timeout(Duration::from_secs(2), watch.wait_for(|s| s.busy))
        .await
        .unwrap()
        .unwrap();

    session.navigate(Some("chat-b".to_string())).await.unwrap();
    gate.notify_one();

    assert_eq!(pending.await.unwrap().unwrap(), SendOutcome::Superseded);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = session.snapshot();
    assert_eq!(snapshot.conversation_id.as_deref(), Some("chat-b"));
    assert_eq!(
        snapshot.messages,
        vec![ChatMessage::user("b1"), ChatMessage::assistant("b2")]
    );
    assert!(!snapshot.busy);

    // The user message was already committed to chat-a before the switch.
    eventually(|| store.stored("chat-a").len() == 3).await;
    assert!(store.stored("chat-b").len() == 2);
}

#[tokio::test]
async fn image_message_round_trips_through_database() {
    let db = Arc::new(Database::in_memory().unwrap());
    let session = spawn_session(
        alice(),
        SessionConfig::default(),
        db.clone(),
        Arc::new(ScriptedCompletion::replying("a tiny png")),
    );

    session.attach_image(PNG).unwrap();
    session.set_input("what is this?").unwrap();
    assert_eq!(session.send().await.unwrap(), SendOutcome::Completed);

    let sent = session.snapshot().messages[1].clone();
    assert!(session.snapshot().pending_image.is_none());
    let id = session.snapshot().conversation_id.unwrap();
    eventually(|| db.get_messages(&id).map(|m| m.len() == 2).unwrap_or(false)).await;

    let reopened = spawn_session(
        alice(),
        SessionConfig::default(),
        db.clone(),
        Arc::new(ScriptedCompletion::replying("unused")),
    );
    reopened.navigate(Some(id)).await.unwrap();

    let loaded = reopened.snapshot().messages;
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0], sent);
    assert_eq!(loaded[0].content.text(), "what is this?");
    let url = loaded[0].content.images().next().unwrap().url().to_string();
    assert_eq!(decode_data_url(&url).unwrap(), PNG);
}

#[tokio::test]
async fn oversized_image_is_rejected_before_staging() {
    let config = SessionConfig {
        max_image_bytes: 8,
        ..SessionConfig::default()
    };
    let session = spawn_session(
        alice(),
        config,
        Arc::new(FakeStore::default()),
        Arc::new(ScriptedCompletion::replying("unused")),
    );

    assert!(session.attach_image(PNG).is_err());
    assert!(session.snapshot().pending_image.is_none());
}
