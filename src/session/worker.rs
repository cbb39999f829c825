use super::context::{Capability, SessionContext};
use super::state::{Action, Effect, SessionConfig, SessionSnapshot, SessionState};
use super::SessionEvent;
use crate::attachment::{AttachmentError, ImageAttachment};
use crate::db::ChatStore;
use crate::llm::{ChatMessage, CompletionClient};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// A reply, or an error message standing in for one, was appended.
    Completed,
    /// Nothing to send, or another send was still in flight.
    Ignored,
    /// The view moved to another conversation before the reply arrived.
    Superseded,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session worker has stopped")]
    Closed,
    #[error("Attachment rejected: {0}")]
    Attachment(#[from] AttachmentError),
    #[error("Not permitted: {0}")]
    NotPermitted(&'static str),
}

enum Command {
    Navigate {
        conversation_id: Option<String>,
        done: oneshot::Sender<()>,
    },
    Send {
        done: oneshot::Sender<SendOutcome>,
    },
    Apply(Action),
}

struct PendingWrite {
    conversation_id: String,
    message: ChatMessage,
}

/// Cloneable front door to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    ctx: Arc<SessionContext>,
    max_image_bytes: usize,
}

/// Starts a session on an unsaved draft. Must be called inside a tokio runtime.
///
/// The worker stops once every handle is dropped.
pub fn spawn_session(
    ctx: Arc<SessionContext>,
    config: SessionConfig,
    store: Arc<dyn ChatStore>,
    completion: Arc<dyn CompletionClient>,
) -> SessionHandle {
    let max_image_bytes = config.max_image_bytes;
    let state = SessionState::new(config);
    let (snapshot_tx, snapshot_rx) = watch::channel(state.snapshot());
    let (events, _) = broadcast::channel(16);
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (results_tx, results_rx) = mpsc::unbounded_channel();
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();

    tokio::spawn(write_messages(store.clone(), writes_rx));

    let worker = Worker {
        state,
        ctx: ctx.clone(),
        store,
        completion,
        results: results_tx,
        writes: writes_tx,
        snapshot: snapshot_tx,
        events: events.clone(),
        cancel: CancellationToken::new(),
        pending_load: None,
        pending_send: None,
    };
    tokio::spawn(worker.run(commands_rx, results_rx));

    SessionHandle {
        commands: commands_tx,
        snapshot: snapshot_rx,
        events,
        ctx,
        max_image_bytes,
    }
}

impl SessionHandle {
    /// Switches the view. Resolves once the conversation has loaded, failed to
    /// load, or been superseded by a later navigation.
    pub async fn navigate(&self, conversation_id: Option<String>) -> Result<(), SessionError> {
        let (done, wait) = oneshot::channel();
        self.submit(Command::Navigate {
            conversation_id,
            done,
        })?;
        wait.await.map_err(|_| SessionError::Closed)
    }

    pub fn set_input(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.submit(Command::Apply(Action::InputChanged(text.into())))
    }

    /// Stages an image for the next send, replacing any staged one.
    pub fn attach_image(&self, bytes: &[u8]) -> Result<(), SessionError> {
        self.ensure_can_attach()?;
        let image = ImageAttachment::from_bytes(bytes, self.max_image_bytes)?;
        self.submit(Command::Apply(Action::ImageAttached(image)))
    }

    pub async fn attach_image_file(&self, path: &Path) -> Result<(), SessionError> {
        self.ensure_can_attach()?;
        let image = ImageAttachment::from_path(path, self.max_image_bytes).await?;
        self.submit(Command::Apply(Action::ImageAttached(image)))
    }

    pub fn remove_image(&self) -> Result<(), SessionError> {
        self.submit(Command::Apply(Action::ImageRemoved))
    }

    /// Sends the current input and staged image, waiting for the reply.
    pub async fn send(&self) -> Result<SendOutcome, SessionError> {
        let (done, wait) = oneshot::channel();
        self.submit(Command::Send { done })?;
        wait.await.map_err(|_| SessionError::Closed)
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<SendOutcome, SessionError> {
        self.set_input(text)?;
        self.send().await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    fn ensure_can_attach(&self) -> Result<(), SessionError> {
        if !self.ctx.can(Capability::AttachImages) {
            return Err(SessionError::NotPermitted("attaching images"));
        }
        Ok(())
    }

    fn submit(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Closed)
    }
}

struct Worker {
    state: SessionState,
    ctx: Arc<SessionContext>,
    store: Arc<dyn ChatStore>,
    completion: Arc<dyn CompletionClient>,
    results: mpsc::UnboundedSender<Action>,
    writes: mpsc::UnboundedSender<PendingWrite>,
    snapshot: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    /// Cancelled whenever the view changes.
    cancel: CancellationToken,
    /// Navigate callers waiting on the load for a generation.
    pending_load: Option<(u64, Vec<oneshot::Sender<()>>)>,
    pending_send: Option<(u64, oneshot::Sender<SendOutcome>)>,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut results: mpsc::UnboundedReceiver<Action>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(action) = results.recv() => {
                    let effects = self.step(action);
                    self.run_effects(effects);
                }
            }
        }
        self.cancel.cancel();
        debug!("session worker stopped");
    }

    /// Applies one action and publishes the resulting snapshot before any
    /// waiter is released.
    fn step(&mut self, action: Action) -> Vec<Effect> {
        let effects = self.state.apply(action, &self.ctx);
        self.snapshot.send_replace(self.state.snapshot());
        effects
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Navigate {
                conversation_id,
                done,
            } => {
                let before = self.state.generation();
                let effects = self.step(Action::Navigate { conversation_id });
                if self.state.generation() != before {
                    self.supersede();
                }
                let loading = effects
                    .iter()
                    .any(|effect| matches!(effect, Effect::LoadMessages { .. }));
                let generation = self.state.generation();
                if loading {
                    self.pending_load = Some((generation, vec![done]));
                } else if let Some((_, waiters)) = self
                    .pending_load
                    .as_mut()
                    .filter(|(pending, _)| *pending == generation)
                {
                    // Same conversation, still loading.
                    waiters.push(done);
                } else {
                    let _ = done.send(());
                }
                self.run_effects(effects);
            }
            Command::Send { done } => {
                let generation = self.state.generation();
                let effects = self.step(Action::SendRequested);
                if effects.is_empty() {
                    let _ = done.send(SendOutcome::Ignored);
                    return;
                }
                self.pending_send = Some((generation, done));
                self.run_effects(effects);
            }
            Command::Apply(action) => {
                let effects = self.step(action);
                self.run_effects(effects);
            }
        }
    }

    /// Abandons everything started for the previous view.
    fn supersede(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        if let Some((_, done)) = self.pending_send.take() {
            let _ = done.send(SendOutcome::Superseded);
        }
        if let Some((_, waiters)) = self.pending_load.take() {
            release(waiters);
        }
    }

    fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            self.execute(effect);
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::LoadMessages {
                generation,
                conversation_id,
            } => {
                let store = self.store.clone();
                let owner = self.ctx.current_user().map(|user| user.id.clone());
                self.spawn_cancellable(async move {
                    let Some(owner) = owner else {
                        warn!(%conversation_id, "not signed in, cannot load conversation");
                        return Action::LoadFailed { generation };
                    };
                    match store.list_messages(&owner, &conversation_id).await {
                        Ok(messages) => {
                            debug!(%conversation_id, count = messages.len(), "conversation loaded");
                            Action::ConversationLoaded {
                                generation,
                                messages: messages.into_iter().map(ChatMessage::from).collect(),
                            }
                        }
                        Err(err) => {
                            warn!(%conversation_id, error = %err, "failed to load conversation");
                            Action::LoadFailed { generation }
                        }
                    }
                });
            }
            Effect::CreateConversation { generation, title } => {
                let store = self.store.clone();
                let owner = self.ctx.current_user().map(|user| user.id.clone());
                self.spawn_cancellable(async move {
                    let Some(owner) = owner else {
                        return Action::ConversationCreateFailed { generation };
                    };
                    match store.create_conversation(&owner, &title).await {
                        Ok(conversation) => {
                            info!(conversation_id = %conversation.id, %title, "conversation created");
                            Action::ConversationCreated {
                                generation,
                                conversation_id: conversation.id,
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "failed to create conversation, continuing unsaved");
                            Action::ConversationCreateFailed { generation }
                        }
                    }
                });
            }
            Effect::PersistMessage {
                conversation_id,
                message,
            } => {
                let write = PendingWrite {
                    conversation_id,
                    message,
                };
                if self.writes.send(write).is_err() {
                    warn!("message writer has stopped, dropping write");
                }
            }
            Effect::RequestCompletion { generation, turns } => {
                let completion = self.completion.clone();
                self.spawn_cancellable(async move {
                    match completion.complete(&turns).await {
                        Ok(message) => Action::CompletionReceived {
                            generation,
                            message,
                        },
                        Err(err) => {
                            warn!(error = %err, "completion request failed");
                            Action::CompletionFailed {
                                generation,
                                error: err.to_string(),
                            }
                        }
                    }
                });
            }
            Effect::Emit(event) => {
                // No subscribers is fine.
                let _ = self.events.send(event);
            }
            Effect::LoadSettled { generation } => {
                if let Some(waiters) = take_if_current(&mut self.pending_load, generation) {
                    release(waiters);
                }
            }
            Effect::SendSettled { generation } => {
                if let Some(done) = take_if_current(&mut self.pending_send, generation) {
                    let _ = done.send(SendOutcome::Completed);
                }
            }
        }
    }

    /// Runs `task` and feeds its action back unless the view changes first.
    fn spawn_cancellable<F>(&self, task: F)
    where
        F: Future<Output = Action> + Send + 'static,
    {
        let token = self.cancel.clone();
        let results = self.results.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("operation superseded by navigation"),
                action = task => {
                    let _ = results.send(action);
                }
            }
        });
    }
}

fn take_if_current<T>(slot: &mut Option<(u64, T)>, generation: u64) -> Option<T> {
    if slot
        .as_ref()
        .is_some_and(|(pending, _)| *pending == generation)
    {
        slot.take().map(|(_, done)| done)
    } else {
        None
    }
}

fn release(waiters: Vec<oneshot::Sender<()>>) {
    for done in waiters {
        let _ = done.send(());
    }
}

/// Applies queued writes one at a time so stored order matches send order.
async fn write_messages(
    store: Arc<dyn ChatStore>,
    mut writes: mpsc::UnboundedReceiver<PendingWrite>,
) {
    while let Some(write) = writes.recv().await {
        let PendingWrite {
            conversation_id,
            message,
        } = write;
        if let Err(err) = store
            .append_message(&conversation_id, message.role, &message.content)
            .await
        {
            warn!(%conversation_id, error = %err, "failed to persist message");
        }
    }
}
