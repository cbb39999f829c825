use serde::{Deserialize, Serialize};

/// Authenticated user as reported by the auth provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Create conversations and persist messages. Needs a signed-in user.
    PersistHistory,
    AttachImages,
}

/// Who is using the session and what they may do.
///
/// Built by the host once per view and handed to the core; the core never
/// looks up auth state on its own.
#[derive(Debug, Clone)]
pub struct SessionContext {
    user: Option<User>,
    persist_history: bool,
    attach_images: bool,
}

impl SessionContext {
    pub fn authenticated(user: User) -> Self {
        Self {
            user: Some(user),
            persist_history: true,
            attach_images: true,
        }
    }

    /// No user: chatting works, nothing is saved.
    pub fn anonymous() -> Self {
        Self {
            user: None,
            persist_history: false,
            attach_images: true,
        }
    }

    pub fn without(mut self, capability: Capability) -> Self {
        match capability {
            Capability::PersistHistory => self.persist_history = false,
            Capability::AttachImages => self.attach_images = false,
        }
        self
    }

    pub fn current_user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn can(&self, capability: Capability) -> bool {
        match capability {
            Capability::PersistHistory => self.persist_history && self.user.is_some(),
            Capability::AttachImages => self.attach_images,
        }
    }
}
