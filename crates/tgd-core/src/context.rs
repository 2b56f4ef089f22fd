//! Per-invocation context handed to handler callbacks.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio_util::sync::CancellationToken;

use crate::{
    dispatcher::HandlerFailure,
    domain::{ChatId, ContextData, Update, UserId},
    scheduler::JobScheduler,
};

/// Key/value stores shared by all handlers of one dispatcher.
#[derive(Clone, Default)]
pub struct SharedData {
    inner: Arc<SharedInner>,
}

#[derive(Default)]
struct SharedInner {
    bot: Mutex<ContextData>,
    chats: Mutex<HashMap<ChatId, ContextData>>,
    users: Mutex<HashMap<UserId, ContextData>>,
}

impl SharedData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bot_data<R>(&self, f: impl FnOnce(&mut ContextData) -> R) -> R {
        let mut guard = self.inner.bot.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn with_chat_data<R>(&self, chat: ChatId, f: impl FnOnce(&mut ContextData) -> R) -> R {
        let mut guard = self.inner.chats.lock().unwrap_or_else(|e| e.into_inner());
        f(guard.entry(chat).or_default())
    }

    pub fn with_user_data<R>(&self, user: UserId, f: impl FnOnce(&mut ContextData) -> R) -> R {
        let mut guard = self.inner.users.lock().unwrap_or_else(|e| e.into_inner());
        f(guard.entry(user).or_default())
    }
}

impl std::fmt::Debug for SharedData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedData").finish_non_exhaustive()
    }
}

/// Everything a callback may touch besides the update itself.
#[derive(Clone, Debug)]
pub struct Context {
    update: Arc<Update>,
    data: Option<Arc<ContextData>>,
    error: Option<Arc<HandlerFailure>>,
    shutdown: CancellationToken,
    jobs: Option<JobScheduler>,
    shared: SharedData,
}

impl Context {
    pub(crate) fn new(
        update: Arc<Update>,
        data: Option<ContextData>,
        shutdown: CancellationToken,
        jobs: Option<JobScheduler>,
        shared: SharedData,
    ) -> Self {
        Self {
            update,
            data: data.map(Arc::new),
            error: None,
            shutdown,
            jobs,
            shared,
        }
    }

    /// Context that is not attached to any dispatcher (tests, manual calls).
    pub fn detached(update: Arc<Update>) -> Self {
        Self::new(
            update,
            None,
            CancellationToken::new(),
            None,
            SharedData::new(),
        )
    }

    pub(crate) fn with_error(&self, failure: HandlerFailure) -> Self {
        let mut ctx = self.clone();
        ctx.error = Some(Arc::new(failure));
        ctx
    }

    pub fn update(&self) -> &Arc<Update> {
        &self.update
    }

    /// Caller-supplied data attached to the queue entry.
    pub fn data(&self) -> Option<&ContextData> {
        self.data.as_deref()
    }

    /// The failure being reported. Only set for error handlers.
    pub fn error(&self) -> Option<&HandlerFailure> {
        self.error.as_deref()
    }

    /// Fires when the dispatcher shuts down; long handlers may poll it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn jobs(&self) -> Option<&JobScheduler> {
        self.jobs.as_ref()
    }

    pub fn shared(&self) -> &SharedData {
        &self.shared
    }

    pub fn with_bot_data<R>(&self, f: impl FnOnce(&mut ContextData) -> R) -> R {
        self.shared.with_bot_data(f)
    }

    /// `None` when the update has no chat.
    pub fn with_chat_data<R>(&self, f: impl FnOnce(&mut ContextData) -> R) -> Option<R> {
        let chat = self.update.chat_id()?;
        Some(self.shared.with_chat_data(chat, f))
    }

    /// `None` when the update has no sender.
    pub fn with_user_data<R>(&self, f: impl FnOnce(&mut ContextData) -> R) -> Option<R> {
        let user = self.update.user_id()?;
        Some(self.shared.with_user_data(user, f))
    }
}
