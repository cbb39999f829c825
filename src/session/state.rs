//! Session state machine.
//!
//! `SessionState::apply` is a pure reducer: it takes one tagged action,
//! updates in-memory state and returns the effects the worker must run.
//! Results of effects come back as actions tagged with the generation they
//! were started under; anything from an older generation is dropped.

use super::context::{Capability, SessionContext};
use super::SessionEvent;
use crate::attachment::{ImageAttachment, DEFAULT_MAX_IMAGE_BYTES};
use crate::content::MessageContent;
use crate::llm::ChatMessage;
use serde::Serialize;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful code debugging assistant.";
pub const DEFAULT_GREETING: &str =
    "Hello! I am your Code Helper. Paste your code here, and I will help you debug it!";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub system_prompt: String,
    pub greeting: String,
    /// Text part used when an image is sent without any text.
    pub image_prompt: String,
    /// Title base for conversations started with an image only.
    pub image_title: String,
    pub title_chars: usize,
    pub title_suffix: String,
    pub max_image_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            greeting: DEFAULT_GREETING.to_string(),
            image_prompt: "Describe this image".to_string(),
            image_title: "New Image Chat".to_string(),
            title_chars: 30,
            title_suffix: "...".to_string(),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

impl SessionConfig {
    /// Title for a conversation whose first message has `text`.
    pub fn derive_title(&self, text: &str) -> String {
        let base: String = if text.trim().is_empty() {
            self.image_title.clone()
        } else {
            text.chars().take(self.title_chars).collect()
        };
        format!("{}{}", base, self.title_suffix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Loading,
    Sending,
}

#[derive(Debug, Clone)]
pub enum Action {
    Navigate { conversation_id: Option<String> },
    InputChanged(String),
    ImageAttached(ImageAttachment),
    ImageRemoved,
    SendRequested,
    ConversationCreated { generation: u64, conversation_id: String },
    ConversationCreateFailed { generation: u64 },
    ConversationLoaded { generation: u64, messages: Vec<ChatMessage> },
    LoadFailed { generation: u64 },
    CompletionReceived { generation: u64, message: ChatMessage },
    CompletionFailed { generation: u64, error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    LoadMessages { generation: u64, conversation_id: String },
    CreateConversation { generation: u64, title: String },
    /// Fire-and-forget; never reported back.
    PersistMessage { conversation_id: String, message: ChatMessage },
    RequestCompletion { generation: u64, turns: Vec<ChatMessage> },
    Emit(SessionEvent),
    LoadSettled { generation: u64 },
    SendSettled { generation: u64 },
}

/// Read-only view handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub conversation_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub phase: Phase,
    pub busy: bool,
    pub input: String,
    pub pending_image: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    config: SessionConfig,
    conversation_id: Option<String>,
    messages: Vec<ChatMessage>,
    phase: Phase,
    input: String,
    pending_image: Option<ImageAttachment>,
    generation: u64,
}

impl SessionState {
    /// Fresh unsaved draft seeded with the greeting.
    pub fn new(config: SessionConfig) -> Self {
        let greeting = ChatMessage::assistant(config.greeting.as_str());
        Self {
            config,
            conversation_id: None,
            messages: vec![greeting],
            phase: Phase::Idle,
            input: String::new(),
            pending_image: None,
            generation: 0,
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_busy(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn pending_image(&self) -> Option<&ImageAttachment> {
        self.pending_image.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            conversation_id: self.conversation_id.clone(),
            messages: self.messages.clone(),
            phase: self.phase,
            busy: self.is_busy(),
            input: self.input.clone(),
            pending_image: self
                .pending_image
                .as_ref()
                .map(|image| image.data_url().to_string()),
        }
    }

    pub fn apply(&mut self, action: Action, ctx: &SessionContext) -> Vec<Effect> {
        match action {
            Action::Navigate { conversation_id } => self.navigate(conversation_id),
            Action::InputChanged(text) => {
                self.input = text;
                Vec::new()
            }
            Action::ImageAttached(image) => {
                if ctx.can(Capability::AttachImages) {
                    self.pending_image = Some(image);
                }
                Vec::new()
            }
            Action::ImageRemoved => {
                self.pending_image = None;
                Vec::new()
            }
            Action::SendRequested => self.begin_send(ctx),
            Action::ConversationCreated {
                generation,
                conversation_id,
            } => {
                if !self.is_current(generation, Phase::Sending) {
                    return Vec::new();
                }
                self.conversation_id = Some(conversation_id.clone());
                let mut effects = vec![Effect::Emit(SessionEvent::ConversationCreated(
                    conversation_id,
                ))];
                effects.extend(self.dispatch_send(ctx));
                effects
            }
            Action::ConversationCreateFailed { generation } => {
                if !self.is_current(generation, Phase::Sending) {
                    return Vec::new();
                }
                self.dispatch_send(ctx)
            }
            Action::ConversationLoaded {
                generation,
                messages,
            } => {
                if !self.is_current(generation, Phase::Loading) {
                    return Vec::new();
                }
                // An empty fetch keeps whatever is already on screen.
                if !messages.is_empty() {
                    self.messages = messages;
                }
                self.phase = Phase::Idle;
                vec![Effect::LoadSettled { generation }]
            }
            Action::LoadFailed { generation } => {
                if !self.is_current(generation, Phase::Loading) {
                    return Vec::new();
                }
                self.phase = Phase::Idle;
                vec![Effect::LoadSettled { generation }]
            }
            Action::CompletionReceived {
                generation,
                message,
            } => {
                if !self.is_current(generation, Phase::Sending) {
                    return Vec::new();
                }
                self.messages.push(message.clone());
                self.phase = Phase::Idle;
                let mut effects = self.persist(message, ctx);
                effects.push(Effect::SendSettled { generation });
                effects
            }
            Action::CompletionFailed { generation, error } => {
                if !self.is_current(generation, Phase::Sending) {
                    return Vec::new();
                }
                self.messages
                    .push(ChatMessage::assistant(format!("Error: {}", error)));
                self.phase = Phase::Idle;
                vec![Effect::SendSettled { generation }]
            }
        }
    }

    fn is_current(&self, generation: u64, phase: Phase) -> bool {
        generation == self.generation && self.phase == phase
    }

    fn navigate(&mut self, conversation_id: Option<String>) -> Vec<Effect> {
        if conversation_id.is_some() && conversation_id == self.conversation_id {
            return Vec::new();
        }

        self.generation += 1;
        self.input.clear();
        self.pending_image = None;
        self.conversation_id = conversation_id.clone();

        match conversation_id {
            Some(conversation_id) => {
                self.messages.clear();
                self.phase = Phase::Loading;
                vec![Effect::LoadMessages {
                    generation: self.generation,
                    conversation_id,
                }]
            }
            None => {
                self.messages = vec![ChatMessage::assistant(self.config.greeting.as_str())];
                self.phase = Phase::Idle;
                Vec::new()
            }
        }
    }

    fn begin_send(&mut self, ctx: &SessionContext) -> Vec<Effect> {
        if self.is_busy() {
            return Vec::new();
        }
        let has_text = !self.input.trim().is_empty();
        if !has_text && self.pending_image.is_none() {
            return Vec::new();
        }

        let text = std::mem::take(&mut self.input);
        let content = match self.pending_image.take() {
            None => MessageContent::Text(text.clone()),
            Some(image) => {
                let prompt = if has_text {
                    text.clone()
                } else {
                    self.config.image_prompt.clone()
                };
                MessageContent::text_with_image(prompt, image.to_image_url())
            }
        };
        self.messages.push(ChatMessage::user(content));
        self.phase = Phase::Sending;

        if self.conversation_id.is_none() && ctx.can(Capability::PersistHistory) {
            return vec![Effect::CreateConversation {
                generation: self.generation,
                title: self.config.derive_title(&text),
            }];
        }
        self.dispatch_send(ctx)
    }

    /// Persists the just-sent user message (when saved) and asks for a reply.
    fn dispatch_send(&self, ctx: &SessionContext) -> Vec<Effect> {
        let mut effects = match self.messages.last() {
            Some(user) => self.persist(user.clone(), ctx),
            None => Vec::new(),
        };
        effects.push(Effect::RequestCompletion {
            generation: self.generation,
            turns: self.turns(),
        });
        effects
    }

    fn persist(&self, message: ChatMessage, ctx: &SessionContext) -> Vec<Effect> {
        match &self.conversation_id {
            Some(conversation_id) if ctx.can(Capability::PersistHistory) => {
                vec![Effect::PersistMessage {
                    conversation_id: conversation_id.clone(),
                    message,
                }]
            }
            _ => Vec::new(),
        }
    }

    /// System preamble followed by every message in view.
    fn turns(&self) -> Vec<ChatMessage> {
        std::iter::once(ChatMessage::system(self.config.system_prompt.as_str()))
            .chain(self.messages.iter().cloned())
            .collect()
    }
}
