//! Document persistence for messages, contacts, flows, keywords, broadcasts
//! and settings.
//!
//! Two backends implement [`Store`]: [`PgStore`] keeps every collection in
//! PostgreSQL, [`MemoryStore`] keeps them in process and backs development
//! runs without `DATABASE_URL` as well as the test suite.

mod memory;
mod postgres;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::{
    error::StoreError,
    types::{Broadcast, Contact, ContactUpdate, Flow, Keyword, Settings, StoredMessage},
};

#[async_trait]
pub trait Store: Send + Sync {
    /// Short backend name reported by `/health`.
    fn kind(&self) -> &'static str;

    /// Appends a message. Returns `false` when a message with the same id
    /// already exists, which marks a repeated webhook delivery.
    async fn insert_message(&self, message: &StoredMessage) -> Result<bool, StoreError>;

    /// The last `limit` messages exchanged with `wa_id`, oldest first.
    async fn messages_for_contact(
        &self,
        wa_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    async fn upsert_contact(&self, update: &ContactUpdate) -> Result<Contact, StoreError>;
    /// Most recently active first.
    async fn list_contacts(&self) -> Result<Vec<Contact>, StoreError>;
    async fn get_contact(&self, wa_id: &str) -> Result<Option<Contact>, StoreError>;
    /// Removes the contact and every message exchanged with it.
    async fn delete_contact(&self, wa_id: &str) -> Result<bool, StoreError>;

    async fn list_flows(&self) -> Result<Vec<Flow>, StoreError>;
    async fn get_flow(&self, id: &str) -> Result<Option<Flow>, StoreError>;
    async fn insert_flow(&self, flow: &Flow) -> Result<(), StoreError>;
    async fn update_flow(&self, flow: &Flow) -> Result<bool, StoreError>;
    async fn delete_flow(&self, id: &str) -> Result<bool, StoreError>;

    /// In creation order.
    async fn list_keywords(&self) -> Result<Vec<Keyword>, StoreError>;
    async fn get_keyword(&self, id: &str) -> Result<Option<Keyword>, StoreError>;
    async fn insert_keyword(&self, keyword: &Keyword) -> Result<(), StoreError>;
    async fn update_keyword(&self, keyword: &Keyword) -> Result<bool, StoreError>;
    async fn delete_keyword(&self, id: &str) -> Result<bool, StoreError>;

    /// Most recently updated first.
    async fn list_broadcasts(&self) -> Result<Vec<Broadcast>, StoreError>;
    async fn get_broadcast(&self, id: &str) -> Result<Option<Broadcast>, StoreError>;
    async fn insert_broadcast(&self, broadcast: &Broadcast) -> Result<(), StoreError>;
    async fn update_broadcast(&self, broadcast: &Broadcast) -> Result<bool, StoreError>;
    async fn delete_broadcast(&self, id: &str) -> Result<bool, StoreError>;

    async fn get_settings(&self) -> Result<Option<Settings>, StoreError>;
    async fn save_settings(&self, settings: &Settings) -> Result<(), StoreError>;
}

/// Stored settings, or the defaults when nothing was saved yet or the
/// store cannot be read.
pub async fn load_settings(store: &dyn Store) -> Settings {
    match store.get_settings().await {
        Ok(Some(settings)) => settings,
        Ok(None) => Settings::default(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to load settings, using defaults");
            Settings::default()
        }
    }
}

pub(crate) fn sort_flows(flows: &mut [Flow]) {
    flows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}

pub(crate) fn sort_contacts(contacts: &mut [Contact]) {
    contacts.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
}
