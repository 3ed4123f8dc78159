//! REST-backed [`HistoryStore`] and [`ContactDirectory`].

use async_trait::async_trait;
use chat_core::{
    Contact, ContactDirectory, ConversationId, HistoryRecord, HistoryStore, LoadError, Message,
    PersistAck, WriteError, records_to_messages,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};
use url::Url;

use crate::{error::RemoteConfigError, wire::WireTimestamp};

const LOAD_PATH: &str = "api/v1/messages/getallmsg";
const PERSIST_PATH: &str = "api/v1/messages/addmsg";
const CONTACTS_PATH: &str = "api/v1/users/allUsers";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord {
    #[serde(default, alias = "_id")]
    id: Option<String>,
    #[serde(default, alias = "from", alias = "sender")]
    sender_id: Option<String>,
    #[serde(default)]
    from_self: Option<bool>,
    #[serde(alias = "message", alias = "msg")]
    text: String,
    #[serde(default, alias = "createdAt", alias = "timestamp")]
    sent_at: Option<WireTimestamp>,
}

impl From<WireRecord> for HistoryRecord {
    fn from(record: WireRecord) -> Self {
        Self {
            id: record.id,
            sender_id: record.sender_id,
            from_self: record.from_self,
            text: record.text,
            sent_at_ms: record.sent_at.as_ref().and_then(WireTimestamp::to_millis),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireContact {
    #[serde(alias = "_id")]
    id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    avatar_image: Option<String>,
}

impl From<WireContact> for Contact {
    fn from(contact: WireContact) -> Self {
        Self {
            id: contact.id,
            username: contact.username,
            avatar_image: contact.avatar_image.filter(|image| !image.is_empty()),
        }
    }
}

/// List response, either wrapped in a `data` envelope or bare.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListBody<T> {
    Envelope {
        #[serde(alias = "messages")]
        data: Vec<T>,
    },
    Bare(Vec<T>),
}

impl<T> ListBody<T> {
    fn into_items(self) -> Vec<T> {
        match self {
            Self::Envelope { data } | Self::Bare(data) => data,
        }
    }
}

/// History store talking to the chat server's message routes.
#[derive(Debug, Clone)]
pub struct HttpHistoryStore {
    client: reqwest::Client,
    load_url: Url,
    persist_url: Url,
    contacts_url: Url,
}

impl HttpHistoryStore {
    pub fn new(base_url: &str) -> Result<Self, RemoteConfigError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| RemoteConfigError::HttpClient(err.to_string()))?;
        Self::with_client(base_url, client)
    }

    pub fn with_client(base_url: &str, client: reqwest::Client) -> Result<Self, RemoteConfigError> {
        let base = parse_base_url(base_url)?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(RemoteConfigError::UnsupportedScheme(base.scheme().to_owned()));
        }
        let join = |path: &str| {
            base.join(path).map_err(|err| RemoteConfigError::InvalidUrl {
                url: base_url.to_owned(),
                reason: err.to_string(),
            })
        };
        Ok(Self {
            client,
            load_url: join(LOAD_PATH)?,
            persist_url: join(PERSIST_PATH)?,
            contacts_url: join(CONTACTS_PATH)?,
        })
    }
}

/// Parse a server base url, ensuring a trailing slash so relative joins
/// extend the path instead of replacing its last segment.
pub(crate) fn parse_base_url(raw: &str) -> Result<Url, RemoteConfigError> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_owned()
    } else {
        format!("{trimmed}/")
    };
    Url::parse(&with_slash).map_err(|err| RemoteConfigError::InvalidUrl {
        url: raw.to_owned(),
        reason: err.to_string(),
    })
}

#[async_trait]
impl HistoryStore for HttpHistoryStore {
    async fn load(&self, conversation: &ConversationId) -> Result<Vec<Message>, LoadError> {
        let response = self
            .client
            .post(self.load_url.clone())
            .json(&json!({
                "from": conversation.local_user_id,
                "to": conversation.peer_user_id,
            }))
            .send()
            .await
            .map_err(|err| LoadError::Network(err.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| LoadError::Network(err.to_string()))?;
        if !status.is_success() {
            warn!(status = status.as_u16(), conversation = %conversation, "history load rejected");
            return Err(LoadError::from_status(
                status.as_u16(),
                String::from_utf8_lossy(&body),
            ));
        }

        let parsed: ListBody<WireRecord> =
            serde_json::from_slice(&body).map_err(|err| LoadError::Protocol(err.to_string()))?;
        let records: Vec<HistoryRecord> = parsed
            .into_items()
            .into_iter()
            .map(HistoryRecord::from)
            .collect();
        debug!(conversation = %conversation, count = records.len(), "history loaded");
        Ok(records_to_messages(conversation, records))
    }

    async fn persist(
        &self,
        conversation: &ConversationId,
        text: &str,
    ) -> Result<PersistAck, WriteError> {
        let response = self
            .client
            .post(self.persist_url.clone())
            .json(&json!({
                "from": conversation.local_user_id,
                "to": conversation.peer_user_id,
                "message": text,
            }))
            .send()
            .await
            .map_err(|err| WriteError::Network(err.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| WriteError::Network(err.to_string()))?;
        if !status.is_success() {
            return Err(WriteError::from_status(
                status.as_u16(),
                String::from_utf8_lossy(&body),
            ));
        }

        // The ack body is advisory; an unreadable one still counts as stored.
        let message_id = serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|value| ack_message_id(&value));
        Ok(PersistAck { message_id })
    }
}

#[async_trait]
impl ContactDirectory for HttpHistoryStore {
    async fn list_contacts(&self, local_user_id: &str) -> Result<Vec<Contact>, LoadError> {
        let mut url = self.contacts_url.clone();
        url.path_segments_mut()
            .map_err(|_| LoadError::Protocol(format!("cannot extend url '{}'", self.contacts_url)))?
            .pop_if_empty()
            .push(local_user_id);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| LoadError::Network(err.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| LoadError::Network(err.to_string()))?;
        if !status.is_success() {
            warn!(status = status.as_u16(), user = %local_user_id, "contact list rejected");
            return Err(LoadError::from_status(
                status.as_u16(),
                String::from_utf8_lossy(&body),
            ));
        }

        let parsed: ListBody<WireContact> =
            serde_json::from_slice(&body).map_err(|err| LoadError::Protocol(err.to_string()))?;
        let contacts: Vec<Contact> = parsed
            .into_items()
            .into_iter()
            .map(Contact::from)
            .filter(|contact| contact.id != local_user_id)
            .collect();
        debug!(user = %local_user_id, count = contacts.len(), "contacts loaded");
        Ok(contacts)
    }
}

fn ack_message_id(body: &Value) -> Option<String> {
    body.pointer("/data/_id")
        .or_else(|| body.pointer("/data/id"))
        .or_else(|| body.get("_id"))
        .or_else(|| body.get("id"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}
