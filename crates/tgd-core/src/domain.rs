use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{errors::Error, Result};

/// Telegram update id (monotonically increasing per bot).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UpdateId(pub i64);

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Telegram chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

/// Telegram user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UserId(pub i64);

/// Arbitrary key/value data carried next to an update. Never interpreted by the engine.
pub type ContextData = HashMap<String, Value>;

/// Discriminant of an update, keyed by the Bot API field that carries the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    Message,
    EditedMessage,
    ChannelPost,
    EditedChannelPost,
    InlineQuery,
    ChosenInlineResult,
    CallbackQuery,
    ShippingQuery,
    PreCheckoutQuery,
    Poll,
    PollAnswer,
    MyChatMember,
    ChatMember,
    ChatJoinRequest,
    Unknown,
}

impl UpdateKind {
    /// Every kind that has a Bot API field, in the order payloads are checked.
    pub const KNOWN: [UpdateKind; 14] = [
        UpdateKind::Message,
        UpdateKind::EditedMessage,
        UpdateKind::ChannelPost,
        UpdateKind::EditedChannelPost,
        UpdateKind::InlineQuery,
        UpdateKind::ChosenInlineResult,
        UpdateKind::CallbackQuery,
        UpdateKind::ShippingQuery,
        UpdateKind::PreCheckoutQuery,
        UpdateKind::Poll,
        UpdateKind::PollAnswer,
        UpdateKind::MyChatMember,
        UpdateKind::ChatMember,
        UpdateKind::ChatJoinRequest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UpdateKind::Message => "message",
            UpdateKind::EditedMessage => "edited_message",
            UpdateKind::ChannelPost => "channel_post",
            UpdateKind::EditedChannelPost => "edited_channel_post",
            UpdateKind::InlineQuery => "inline_query",
            UpdateKind::ChosenInlineResult => "chosen_inline_result",
            UpdateKind::CallbackQuery => "callback_query",
            UpdateKind::ShippingQuery => "shipping_query",
            UpdateKind::PreCheckoutQuery => "pre_checkout_query",
            UpdateKind::Poll => "poll",
            UpdateKind::PollAnswer => "poll_answer",
            UpdateKind::MyChatMember => "my_chat_member",
            UpdateKind::ChatMember => "chat_member",
            UpdateKind::ChatJoinRequest => "chat_join_request",
            UpdateKind::Unknown => "unknown",
        }
    }

    pub fn from_field(field: &str) -> Option<Self> {
        Self::KNOWN.into_iter().find(|k| k.as_str() == field)
    }

    fn is_message_like(self) -> bool {
        matches!(
            self,
            UpdateKind::Message
                | UpdateKind::EditedMessage
                | UpdateKind::ChannelPost
                | UpdateKind::EditedChannelPost
        )
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One update delivered by the Bot API.
///
/// The payload is kept as opaque JSON: decoding it into typed Bot API objects
/// is the handlers' business. Only the few fields the filters need are
/// exposed through accessors.
#[derive(Clone, Debug)]
pub struct Update {
    pub id: UpdateId,
    pub kind: UpdateKind,
    /// The inner object (e.g. the `message` object), or the whole update for `Unknown`.
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl Update {
    pub fn new(id: i64, kind: UpdateKind, payload: Value) -> Self {
        Self {
            id: UpdateId(id),
            kind,
            payload,
            received_at: Utc::now(),
        }
    }

    /// Decode a raw Bot API update object.
    pub fn from_json(raw: Value) -> Result<Self> {
        let Some(id) = raw.get("update_id").and_then(Value::as_i64) else {
            return Err(Error::InvalidUpdate(
                "missing integer update_id".to_string(),
            ));
        };

        let Value::Object(mut map) = raw else {
            return Err(Error::InvalidUpdate("update is not an object".to_string()));
        };

        for kind in UpdateKind::KNOWN {
            if let Some(payload) = map.remove(kind.as_str()) {
                return Ok(Self::new(id, kind, payload));
            }
        }

        Ok(Self::new(id, UpdateKind::Unknown, Value::Object(map)))
    }

    /// The message object for message-like kinds, or the message a callback query is attached to.
    pub fn message(&self) -> Option<&Value> {
        if self.kind.is_message_like() {
            return Some(&self.payload);
        }
        if self.kind == UpdateKind::CallbackQuery {
            return self.payload.get("message");
        }
        None
    }

    /// Message text (or caption), inline query text, or callback data.
    pub fn text(&self) -> Option<&str> {
        match self.kind {
            UpdateKind::CallbackQuery => self.payload.get("data").and_then(Value::as_str),
            UpdateKind::InlineQuery => self.payload.get("query").and_then(Value::as_str),
            k if k.is_message_like() => self
                .payload
                .get("text")
                .or_else(|| self.payload.get("caption"))
                .and_then(Value::as_str),
            _ => None,
        }
    }

    /// Leading `/command` of the text, lowercased, without the `@botname` suffix.
    pub fn command(&self) -> Option<String> {
        if !self.kind.is_message_like() {
            return None;
        }
        let text = self.text()?;
        let first = text.split_whitespace().next()?;
        let name = first.strip_prefix('/')?;
        let name = name.split('@').next().unwrap_or(name);
        if name.is_empty() {
            return None;
        }
        Some(name.to_lowercase())
    }

    pub fn chat_id(&self) -> Option<ChatId> {
        let chat = match self.kind {
            UpdateKind::MyChatMember | UpdateKind::ChatMember | UpdateKind::ChatJoinRequest => {
                self.payload.get("chat")
            }
            _ => self.message().and_then(|m| m.get("chat")),
        }?;
        chat.get("id").and_then(Value::as_i64).map(ChatId)
    }

    pub fn user_id(&self) -> Option<UserId> {
        let from = match self.kind {
            UpdateKind::PollAnswer => self.payload.get("user"),
            UpdateKind::Poll | UpdateKind::Unknown => None,
            _ => self.payload.get("from"),
        }?;
        from.get("id").and_then(Value::as_i64).map(UserId)
    }
}
