use crate::db::models::{Conversation, Message};
use crate::db::ChatStore;
use crate::session::{SessionContext, SessionHandle};
use crate::App;
use std::sync::Arc;

fn owner_id(ctx: &SessionContext) -> Result<&str, String> {
    ctx.current_user()
        .map(|user| user.id.as_str())
        .ok_or_else(|| "Not signed in".to_string())
}

/// Opens a chat view, loading `conversation_id` when given.
pub async fn open_session(
    app: &App,
    ctx: Arc<SessionContext>,
    conversation_id: Option<String>,
) -> Result<SessionHandle, String> {
    let session = app.spawn_session(ctx);
    if conversation_id.is_some() {
        session
            .navigate(conversation_id)
            .await
            .map_err(|e| e.to_string())?;
    }
    Ok(session)
}

pub async fn list_conversations(
    app: &App,
    ctx: &SessionContext,
) -> Result<Vec<Conversation>, String> {
    let owner = owner_id(ctx)?;
    app.store()
        .list_conversations(owner)
        .await
        .map_err(|e| e.to_string())
}

pub async fn delete_conversation(
    app: &App,
    ctx: &SessionContext,
    id: String,
) -> Result<(), String> {
    let owner = owner_id(ctx)?;
    let store = app.store();
    let owned = store
        .list_conversations(owner)
        .await
        .map_err(|e| e.to_string())?
        .iter()
        .any(|conversation| conversation.id == id);
    if !owned {
        return Err(format!("Conversation not found: {}", id));
    }
    store
        .delete_conversation(&id)
        .await
        .map_err(|e| e.to_string())
}

/// Messages of a conversation the signed-in user owns.
pub async fn get_messages(
    app: &App,
    ctx: &SessionContext,
    conversation_id: String,
) -> Result<Vec<Message>, String> {
    let owner = owner_id(ctx)?;
    app.store()
        .list_messages(owner, &conversation_id)
        .await
        .map_err(|e| e.to_string())
}
