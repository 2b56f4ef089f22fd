//! Ready-made predicates and combinators.

use regex::Regex;

use crate::{
    domain::{ChatId, Update, UpdateKind, UserId},
    errors::Error,
    registry::Predicate,
    Result,
};

pub fn any() -> impl Predicate {
    |_: &Update| true
}

pub fn kind(kind: UpdateKind) -> impl Predicate {
    move |u: &Update| u.kind == kind
}

/// Matches `/name` (case-insensitive, `@botname` suffix allowed).
pub fn command(name: &str) -> impl Predicate {
    let name = name.trim_start_matches('/').to_lowercase();
    move |u: &Update| u.command().as_deref() == Some(name.as_str())
}

pub fn text_prefix(prefix: &str) -> impl Predicate {
    let prefix = prefix.to_string();
    move |u: &Update| u.text().is_some_and(|t| t.starts_with(&prefix))
}

pub fn text_regex(pattern: &str) -> Result<impl Predicate> {
    let re = Regex::new(pattern)
        .map_err(|e| Error::Config(format!("invalid text filter /{pattern}/: {e}")))?;
    Ok(move |u: &Update| u.text().is_some_and(|t| re.is_match(t)))
}

pub fn chat(id: i64) -> impl Predicate {
    move |u: &Update| u.chat_id() == Some(ChatId(id))
}

pub fn user(id: i64) -> impl Predicate {
    move |u: &Update| u.user_id() == Some(UserId(id))
}

pub fn and(a: impl Predicate, b: impl Predicate) -> impl Predicate {
    move |u: &Update| a.check(u) && b.check(u)
}

pub fn or(a: impl Predicate, b: impl Predicate) -> impl Predicate {
    move |u: &Update| a.check(u) || b.check(u)
}

pub fn not(p: impl Predicate) -> impl Predicate {
    move |u: &Update| !p.check(u)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(text: &str) -> Update {
        Update::new(
            1,
            UpdateKind::Message,
            json!({"text": text, "chat": {"id": 5}, "from": {"id": 6}}),
        )
    }

    #[test]
    fn command_ignores_case_and_bot_suffix() {
        let p = command("/start");
        assert!(p.check(&msg("/start")));
        assert!(p.check(&msg("/START@my_bot now")));
        assert!(!p.check(&msg("/stop")));
        assert!(!p.check(&msg("start")));
    }

    #[test]
    fn text_filters() {
        assert!(text_prefix("/start").check(&msg("/start x")));
        assert!(!text_prefix("/start").check(&msg("hi")));

        let re = text_regex(r"^\d{3}$").unwrap();
        assert!(re.check(&msg("123")));
        assert!(!re.check(&msg("12a")));
        assert!(text_regex("(").is_err());
    }

    #[test]
    fn combinators_compose() {
        let p = and(kind(UpdateKind::Message), or(chat(5), user(99)));
        assert!(p.check(&msg("x")));
        assert!(!not(any()).check(&msg("x")));

        let cb = Update::new(2, UpdateKind::CallbackQuery, json!({"data": "x"}));
        assert!(!p.check(&cb));
        assert!(not(kind(UpdateKind::Message)).check(&cb));
    }
}
