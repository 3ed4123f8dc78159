use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LoadError;

/// A user the local user can open a conversation with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    /// Stable user id, usable as a conversation peer id.
    pub id: String,
    pub username: String,
    /// Encoded avatar image, when the user has set one.
    pub avatar_image: Option<String>,
}

impl Contact {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            avatar_image: None,
        }
    }
}

/// Directory of users available to chat with.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Every known user except `local_user_id`, in directory order.
    async fn list_contacts(&self, local_user_id: &str) -> Result<Vec<Contact>, LoadError>;
}

#[derive(Default)]
struct InMemoryContacts {
    users: Vec<Contact>,
    failing: VecDeque<LoadError>,
}

/// Process-local contact directory with failure injection.
#[derive(Clone, Default)]
pub struct InMemoryContactDirectory {
    data: Arc<Mutex<InMemoryContacts>>,
}

impl InMemoryContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user; a user with the same id is replaced in place.
    pub fn add(&self, contact: Contact) {
        if let Ok(mut data) = self.data.lock() {
            match data.users.iter_mut().find(|known| known.id == contact.id) {
                Some(known) => *known = contact,
                None => data.users.push(contact),
            }
        }
    }

    /// Make the next `list_contacts` fail with `error`.
    pub fn fail_next_list(&self, error: LoadError) {
        if let Ok(mut data) = self.data.lock() {
            data.failing.push_back(error);
        }
    }
}

#[async_trait]
impl ContactDirectory for InMemoryContactDirectory {
    async fn list_contacts(&self, local_user_id: &str) -> Result<Vec<Contact>, LoadError> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| LoadError::Network("poisoned lock".to_owned()))?;
        if let Some(error) = data.failing.pop_front() {
            return Err(error);
        }

        Ok(data
            .users
            .iter()
            .filter(|contact| contact.id != local_user_id)
            .cloned()
            .collect())
    }
}
