//! Telegram Bot API payloads shared by the host and ESP32 transports.

use serde::{Deserialize, Serialize};

use prayer_relay_common::InboundMessage;

pub const POLL_LIMIT: u8 = 10;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    #[serde(default)]
    from: Option<User>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

impl User {
    fn display_name(&self) -> String {
        let mut name = self.first_name.trim().to_string();
        if let Some(last) = self.last_name.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            if !name.is_empty() {
                name.push(' ');
            }
            name.push_str(last);
        }
        if name.is_empty() {
            if let Some(username) = self.username.as_deref() {
                name = format!("@{username}");
            }
        }
        name
    }
}

#[derive(Debug, Serialize)]
pub struct SendMessage<'a> {
    pub chat_id: i64,
    pub text: &'a str,
    pub disable_web_page_preview: bool,
}

/// One `getUpdates` page. `last_sequence` covers updates that carried no
/// usable text so the offset still advances past them.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UpdateBatch {
    pub last_sequence: Option<i64>,
    pub messages: Vec<InboundMessage>,
}

pub fn updates_url(api_base: &str, token: &str, offset: i64) -> String {
    format!(
        "{}/bot{token}/getUpdates?offset={offset}&limit={POLL_LIMIT}&timeout=0&allowed_updates=%5B%22message%22%5D",
        api_base.trim_end_matches('/')
    )
}

pub fn send_url(api_base: &str, token: &str) -> String {
    format!("{}/bot{token}/sendMessage", api_base.trim_end_matches('/'))
}

pub fn parse_updates(body: &[u8]) -> anyhow::Result<UpdateBatch> {
    let response: ApiResponse<Vec<Update>> = serde_json::from_slice(body)?;
    if !response.ok {
        anyhow::bail!(
            "telegram rejected getUpdates: {}",
            response.description.unwrap_or_default()
        );
    }

    let mut batch = UpdateBatch::default();
    for update in response.result.unwrap_or_default() {
        batch.last_sequence = batch.last_sequence.max(Some(update.update_id));

        let Some(message) = update.message else {
            continue;
        };
        let (Some(text), Some(from)) = (message.text, message.from) else {
            continue;
        };
        batch.messages.push(InboundMessage {
            sequence: update.update_id,
            chat_id: message.chat.id,
            author_id: from.id,
            author_name: from.display_name(),
            text,
        });
    }
    Ok(batch)
}

/// `sendMessage` answers `{"ok":false,...}` with a 4xx status; both are
/// surfaced as errors.
pub fn check_send_response(status: u16, body: &[u8]) -> anyhow::Result<()> {
    let description = serde_json::from_slice::<ApiResponse<serde_json::Value>>(body)
        .ok()
        .and_then(|response| if response.ok { None } else { response.description });

    if (200..300).contains(&status) && description.is_none() {
        return Ok(());
    }
    anyhow::bail!(
        "telegram sendMessage failed with HTTP {status}: {}",
        description.unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn keeps_text_messages_and_tracks_every_update_id() {
        let body = br#"{"ok":true,"result":[
            {"update_id":41,"message":{"chat":{"id":-100},"from":{"id":7,"first_name":"Ali","last_name":"Veli"},"text":"/durum"}},
            {"update_id":42,"message":{"chat":{"id":-100},"from":{"id":8,"first_name":""},"sticker":{}}},
            {"update_id":43,"edited_message":{"chat":{"id":-100}}}
        ]}"#;

        let batch = parse_updates(body).unwrap();
        assert_eq!(batch.last_sequence, Some(43));
        assert_eq!(
            batch.messages,
            vec![InboundMessage {
                sequence: 41,
                chat_id: -100,
                author_id: 7,
                author_name: "Ali Veli".to_string(),
                text: "/durum".to_string(),
            }]
        );
    }

    #[test]
    fn falls_back_to_username() {
        let body = br#"{"ok":true,"result":[
            {"update_id":1,"message":{"chat":{"id":5},"from":{"id":9,"first_name":" ","username":"muezzin"},"text":"/myid"}}
        ]}"#;
        let batch = parse_updates(body).unwrap();
        assert_eq!(batch.messages[0].author_name, "@muezzin");
    }

    #[test]
    fn api_errors_are_reported() {
        let body = br#"{"ok":false,"error_code":401,"description":"Unauthorized"}"#;
        assert!(parse_updates(body).is_err());
        assert!(check_send_response(401, body).is_err());
        assert!(check_send_response(200, br#"{"ok":true,"result":{}}"#).is_ok());
    }

    #[test]
    fn builds_urls() {
        assert_eq!(
            send_url("https://api.telegram.org/", "T"),
            "https://api.telegram.org/botT/sendMessage"
        );
        assert!(updates_url("https://api.telegram.org", "T", 12).contains("offset=12&limit=10"));
    }
}
