//! crates/deal_desk_core/src/normalizer.rs
//!
//! Turns provider-shaped webhook bodies into canonical `InboundMessageEvent`s.
//!
//! Work happens in two steps around the idempotency ledger:
//! `split` only detects the payload shape and cuts a batch into raw events, each of
//! which can name its own event key; `normalize` then does the full mapping for
//! raw events the ledger admitted as fresh.
//!
//! Supported shapes:
//! - Meta webhooks (`object` + `entry[].messaging[]`), Messenger and Instagram.
//! - Relay events (`event: "message_created"` with `conversation`, `contact`, `message`).

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::domain::{InboundMessageEvent, MessageDirection, Platform, ProfileFields};

/// Upper bound on stored event keys.
pub const MAX_EVENT_KEY_LEN: usize = 64;

/// Reason codes for payloads that cannot become an `InboundMessageEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnrecognizedReason {
    InvalidJson,
    UnknownShape,
    NotAMessage,
    MissingField,
    InvalidTimestamp,
    UnsupportedPlatform,
    UnsupportedEvent,
}

impl UnrecognizedReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidJson => "invalid_json",
            Self::UnknownShape => "unknown_shape",
            Self::NotAMessage => "not_a_message",
            Self::MissingField => "missing_field",
            Self::InvalidTimestamp => "invalid_timestamp",
            Self::UnsupportedPlatform => "unsupported_platform",
            Self::UnsupportedEvent => "unsupported_event",
        }
    }
}

/// A payload (or batch item) that is logged and skipped without touching state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}", code = .reason.as_str())]
pub struct UnrecognizedPayload {
    pub reason: UnrecognizedReason,
    pub message: String,
}

impl UnrecognizedPayload {
    fn new(reason: UnrecognizedReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
enum RawKind {
    Meta {
        platform: Platform,
        page_id: Option<String>,
    },
    Relay,
    Unknown(UnrecognizedPayload),
}

/// One provider event cut out of a delivery, not yet canonicalized.
#[derive(Debug, Clone)]
pub struct RawEvent {
    kind: RawKind,
    item: Value,
    /// SHA-256 of the raw item, used when no better key exists.
    fallback_key: String,
}

impl RawEvent {
    fn new(kind: RawKind, item: Value) -> Self {
        let fallback_key = sha256_hex(item.to_string().as_bytes());
        Self {
            kind,
            item,
            fallback_key,
        }
    }

    fn unknown_bytes(body: &[u8], reason: UnrecognizedPayload) -> Self {
        Self {
            kind: RawKind::Unknown(reason),
            item: Value::Null,
            fallback_key: sha256_hex(body),
        }
    }

    /// Deterministic dedup key: the provider message id when present, otherwise a
    /// hash over the fields that identify the message.
    pub fn event_key(&self) -> String {
        match &self.kind {
            RawKind::Meta { page_id, .. } => {
                let message = self.item.get("message");
                let mid = message.and_then(|m| m.get("mid")).and_then(Value::as_str);
                let sender = id_field(self.item.get("sender"));
                let recipient = id_field(self.item.get("recipient"));
                let conversation = format!(
                    "{}:{}",
                    page_id.as_deref().unwrap_or_default(),
                    sender.as_deref().unwrap_or_default()
                );
                let timestamp = self
                    .item
                    .get("timestamp")
                    .map(Value::to_string)
                    .unwrap_or_default();
                let content = message.map(Value::to_string).unwrap_or_else(|| self.item.to_string());
                derive_event_key(
                    mid,
                    &conversation,
                    sender.or(recipient).as_deref().unwrap_or_default(),
                    &timestamp,
                    &content,
                )
            }
            RawKind::Relay => {
                let message = self.item.get("message");
                let id = message.and_then(|m| scalar_string(m.get("id")));
                let conversation = self
                    .item
                    .get("conversation")
                    .and_then(|c| scalar_string(c.get("id")))
                    .unwrap_or_default();
                let sender = self
                    .item
                    .get("contact")
                    .and_then(|c| scalar_string(c.get("id")))
                    .unwrap_or_default();
                let timestamp = message
                    .and_then(|m| m.get("timestamp"))
                    .map(Value::to_string)
                    .unwrap_or_default();
                let content = message
                    .and_then(|m| m.get("text"))
                    .map(Value::to_string)
                    .unwrap_or_default();
                derive_event_key(id.as_deref(), &conversation, &sender, &timestamp, &content)
            }
            RawKind::Unknown(_) => self.fallback_key.clone(),
        }
    }
}

/// Cuts a raw delivery body into provider events. Never fails: anything that
/// cannot be read becomes a single unknown event so it still passes the ledger.
pub fn split(body: &[u8]) -> Vec<RawEvent> {
    let payload: Value = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(e) => {
            return vec![RawEvent::unknown_bytes(
                body,
                UnrecognizedPayload::new(UnrecognizedReason::InvalidJson, e.to_string()),
            )]
        }
    };

    if let (Some(object), Some(entries)) = (
        payload.get("object").and_then(Value::as_str),
        payload.get("entry").and_then(Value::as_array),
    ) {
        let platform = match object.to_ascii_lowercase().as_str() {
            "page" => Platform::Messenger,
            "instagram" => Platform::Instagram,
            _ => {
                let reason = UnrecognizedPayload::new(
                    UnrecognizedReason::UnknownShape,
                    format!("unsupported meta object `{}`", object),
                );
                return vec![RawEvent::new(RawKind::Unknown(reason), payload)];
            }
        };
        let mut events = Vec::new();
        for entry in entries {
            let page_id = scalar_string(entry.get("id"));
            if let Some(items) = entry.get("messaging").and_then(Value::as_array) {
                for item in items {
                    events.push(RawEvent::new(
                        RawKind::Meta {
                            platform,
                            page_id: page_id.clone(),
                        },
                        item.clone(),
                    ));
                }
            }
        }
        if !events.is_empty() {
            return events;
        }
        let reason = UnrecognizedPayload::new(
            UnrecognizedReason::NotAMessage,
            "meta payload carries no messaging items",
        );
        return vec![RawEvent::new(RawKind::Unknown(reason), payload)];
    }

    if payload.get("event").and_then(Value::as_str).is_some() && payload.get("message").is_some() {
        return vec![RawEvent::new(RawKind::Relay, payload)];
    }

    let reason = UnrecognizedPayload::new(
        UnrecognizedReason::UnknownShape,
        "payload matches no supported provider shape",
    );
    vec![RawEvent::new(RawKind::Unknown(reason), payload)]
}

/// Maps a ledger-admitted raw event to the canonical message event.
pub fn normalize(raw: &RawEvent) -> Result<InboundMessageEvent, UnrecognizedPayload> {
    match &raw.kind {
        RawKind::Meta { platform, page_id } => normalize_meta(&raw.item, *platform, page_id.as_deref()),
        RawKind::Relay => normalize_relay(&raw.item),
        RawKind::Unknown(reason) => Err(reason.clone()),
    }
}

fn normalize_meta(
    item: &Value,
    platform: Platform,
    page_id: Option<&str>,
) -> Result<InboundMessageEvent, UnrecognizedPayload> {
    let message = item.get("message").filter(|m| m.is_object()).ok_or_else(|| {
        UnrecognizedPayload::new(
            UnrecognizedReason::NotAMessage,
            "messaging item is not a message (receipt, postback or reaction)",
        )
    })?;
    let is_echo = message
        .get("is_echo")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let sender = id_field(item.get("sender")).ok_or_else(|| missing("sender.id"))?;
    let recipient = id_field(item.get("recipient")).ok_or_else(|| missing("recipient.id"))?;
    let (customer, business) = if is_echo {
        (recipient, sender)
    } else {
        (sender, recipient)
    };
    let page = page_id.map(str::to_string).unwrap_or(business);

    let millis = item
        .get("timestamp")
        .and_then(Value::as_i64)
        .ok_or_else(|| missing("timestamp"))?;
    let timestamp = Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
        UnrecognizedPayload::new(
            UnrecognizedReason::InvalidTimestamp,
            format!("timestamp {} is out of range", millis),
        )
    })?;

    let text = match message.get("text").and_then(Value::as_str) {
        Some(text) => text.to_string(),
        None if message.get("attachments").is_some() => "[attachment]".to_string(),
        None => return Err(missing("message.text")),
    };

    Ok(InboundMessageEvent {
        conversation_id: format!("{}:{}", page, customer),
        platform,
        contact_id: customer,
        direction: if is_echo {
            MessageDirection::Manager
        } else {
            MessageDirection::Client
        },
        text,
        timestamp,
        profile: ProfileFields::default(),
        labels: None,
    })
}

fn normalize_relay(payload: &Value) -> Result<InboundMessageEvent, UnrecognizedPayload> {
    let event = payload.get("event").and_then(Value::as_str).unwrap_or_default();
    if event != "message_created" {
        return Err(UnrecognizedPayload::new(
            UnrecognizedReason::UnsupportedEvent,
            format!("relay event '{}' is not handled", event),
        ));
    }

    let conversation = payload.get("conversation").ok_or_else(|| missing("conversation"))?;
    let conversation_id =
        scalar_string(conversation.get("id")).ok_or_else(|| missing("conversation.id"))?;
    let platform_token = conversation
        .get("platform")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("conversation.platform"))?;
    let platform: Platform = platform_token.parse().map_err(|_| {
        UnrecognizedPayload::new(
            UnrecognizedReason::UnsupportedPlatform,
            format!("platform '{}' is not supported", platform_token),
        )
    })?;
    let labels = conversation.get("labels").and_then(Value::as_array).map(|labels| {
        labels
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect::<Vec<_>>()
    });

    let contact = payload.get("contact").ok_or_else(|| missing("contact"))?;
    let contact_id = scalar_string(contact.get("id")).ok_or_else(|| missing("contact.id"))?;
    let profile = ProfileFields {
        first_name: non_empty_str(contact.get("first_name")),
        last_name: non_empty_str(contact.get("last_name")),
    };

    let message = payload.get("message").ok_or_else(|| missing("message"))?;
    let text = message
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("message.text"))?
        .to_string();
    let timestamp = parse_relay_timestamp(message.get("timestamp"))?;
    let direction = match message.get("direction").and_then(Value::as_str) {
        Some("outgoing") => MessageDirection::Manager,
        _ => MessageDirection::Client,
    };

    Ok(InboundMessageEvent {
        conversation_id,
        platform,
        contact_id,
        direction,
        text,
        timestamp,
        profile,
        labels,
    })
}

fn parse_relay_timestamp(value: Option<&Value>) -> Result<DateTime<Utc>, UnrecognizedPayload> {
    let invalid = |detail: String| UnrecognizedPayload::new(UnrecognizedReason::InvalidTimestamp, detail);
    match value {
        Some(Value::Number(n)) => {
            let seconds = n
                .as_i64()
                .ok_or_else(|| invalid(format!("timestamp {} is not an integer", n)))?;
            Utc.timestamp_opt(seconds, 0)
                .single()
                .ok_or_else(|| invalid(format!("timestamp {} is out of range", seconds)))
        }
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| invalid(format!("timestamp '{}': {}", s, e))),
        _ => Err(missing("message.timestamp")),
    }
}

//=========================================================================================
// Event Keys
//=========================================================================================

/// Builds a ledger key of at most `MAX_EVENT_KEY_LEN` characters.
///
/// The provider message id is used verbatim when short enough and hashed when not.
/// Without an id the key hashes conversation, sender, timestamp and a content hash.
pub fn derive_event_key(
    message_id: Option<&str>,
    conversation_id: &str,
    sender_id: &str,
    timestamp: &str,
    content: &str,
) -> String {
    if let Some(id) = message_id.map(str::trim).filter(|id| !id.is_empty()) {
        if id.chars().count() <= MAX_EVENT_KEY_LEN {
            return id.to_string();
        }
        return sha256_hex(id.as_bytes());
    }
    let content_hash = sha256_hex(content.as_bytes());
    let material = format!("{}\n{}\n{}\n{}", conversation_id, sender_id, timestamp, content_hash);
    sha256_hex(material.as_bytes())
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn missing(field: &str) -> UnrecognizedPayload {
    UnrecognizedPayload::new(
        UnrecognizedReason::MissingField,
        format!("required field '{}' is missing", field),
    )
}

fn id_field(value: Option<&Value>) -> Option<String> {
    value.and_then(|v| scalar_string(v.get("id")))
}

/// Accepts ids sent either as strings or as numbers.
fn scalar_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta_body(mid: Option<&str>, text: &str, echo: bool) -> Vec<u8> {
        let mut message = json!({ "text": text, "is_echo": echo });
        if let Some(mid) = mid {
            message["mid"] = json!(mid);
        }
        let (sender, recipient) = if echo { ("page-1", "psid-9") } else { ("psid-9", "page-1") };
        json!({
            "object": "page",
            "entry": [{
                "id": "page-1",
                "time": 1_760_100_000_000i64,
                "messaging": [{
                    "sender": { "id": sender },
                    "recipient": { "id": recipient },
                    "timestamp": 1_760_100_000_000i64,
                    "message": message
                }]
            }]
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn meta_message_normalizes_to_canonical_event() {
        let raw = split(&meta_body(Some("mid:123"), "хочу купить", false));
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].event_key(), "mid:123");

        let event = normalize(&raw[0]).expect("message event");
        assert_eq!(event.conversation_id, "page-1:psid-9");
        assert_eq!(event.contact_id, "psid-9");
        assert_eq!(event.platform, Platform::Messenger);
        assert_eq!(event.direction, MessageDirection::Client);
        assert_eq!(event.text, "хочу купить");
        assert_eq!(event.timestamp.timestamp_millis(), 1_760_100_000_000);
    }

    #[test]
    fn echo_is_attributed_to_the_customer_conversation() {
        let raw = split(&meta_body(Some("mid:echo"), "Добрый день!", true));
        let event = normalize(&raw[0]).expect("echo event");
        assert_eq!(event.direction, MessageDirection::Manager);
        assert_eq!(event.contact_id, "psid-9");
        assert_eq!(event.conversation_id, "page-1:psid-9");
    }

    #[test]
    fn batch_is_split_per_messaging_item() {
        let body = json!({
            "object": "instagram",
            "entry": [
                { "id": "ig-1", "messaging": [
                    { "sender": {"id": "u1"}, "recipient": {"id": "ig-1"}, "timestamp": 1, "message": {"mid": "a", "text": "hi"} },
                    { "sender": {"id": "u1"}, "recipient": {"id": "ig-1"}, "timestamp": 2, "read": {"mid": "a"} }
                ]},
                { "id": "ig-1", "messaging": [
                    { "sender": {"id": "u2"}, "recipient": {"id": "ig-1"}, "timestamp": 3, "message": {"mid": "b", "text": "yo"} }
                ]}
            ]
        });
        let raw = split(body.to_string().as_bytes());
        assert_eq!(raw.len(), 3);
        assert_eq!(normalize(&raw[0]).expect("msg").platform, Platform::Instagram);
        let receipt = normalize(&raw[1]).expect_err("receipt is not a message");
        assert_eq!(receipt.reason, UnrecognizedReason::NotAMessage);
        assert_eq!(raw[2].event_key(), "b");
    }

    #[test]
    fn relay_shape_carries_profile_and_labels() {
        let body = json!({
            "event": "message_created",
            "conversation": { "id": 42, "platform": "instagram", "labels": ["vip", "opt"] },
            "contact": { "id": "c-7", "first_name": "Anna", "last_name": " " },
            "message": { "id": "r-1", "text": "Сколько стоит?", "timestamp": "2026-10-01T10:00:00Z" }
        });
        let raw = split(body.to_string().as_bytes());
        let event = normalize(&raw[0]).expect("relay event");
        assert_eq!(event.conversation_id, "42");
        assert_eq!(event.labels, Some(vec!["vip".to_string(), "opt".to_string()]));
        assert_eq!(event.profile.first_name.as_deref(), Some("Anna"));
        assert_eq!(event.profile.last_name, None);
        assert_eq!(raw[0].event_key(), "r-1");
    }

    #[test]
    fn garbage_is_unrecognized_but_still_keyed() {
        let raw = split(b"not json at all");
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].event_key().len(), MAX_EVENT_KEY_LEN);
        assert_eq!(
            normalize(&raw[0]).expect_err("garbage").reason,
            UnrecognizedReason::InvalidJson
        );

        let raw = split(br#"{"hello":"world"}"#);
        assert_eq!(
            normalize(&raw[0]).expect_err("unknown").reason,
            UnrecognizedReason::UnknownShape
        );
    }

    #[test]
    fn other_meta_objects_are_not_messenger() {
        let body = json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "waba-1",
                "messaging": [{
                    "sender": { "id": "u-1" },
                    "recipient": { "id": "waba-1" },
                    "timestamp": 1_700_000_000_000i64,
                    "message": { "mid": "w-1", "text": "hi" }
                }]
            }]
        })
        .to_string();
        let raw = split(body.as_bytes());
        assert_eq!(raw.len(), 1);
        assert_eq!(
            normalize(&raw[0]).expect_err("unsupported object").reason,
            UnrecognizedReason::UnknownShape
        );
    }

    #[test]
    fn keys_without_message_id_are_deterministic_hashes() {
        let a = split(&meta_body(None, "hello", false));
        let b = split(&meta_body(None, "hello", false));
        let c = split(&meta_body(None, "hello!", false));
        assert_eq!(a[0].event_key(), b[0].event_key());
        assert_ne!(a[0].event_key(), c[0].event_key());
        assert_eq!(a[0].event_key().len(), MAX_EVENT_KEY_LEN);
    }

    #[test]
    fn long_message_ids_are_hashed_to_the_key_limit() {
        let long = "m_".repeat(80);
        let key = derive_event_key(Some(&long), "c", "s", "t", "x");
        assert_eq!(key.len(), MAX_EVENT_KEY_LEN);
        assert_ne!(key, long);
    }
}
