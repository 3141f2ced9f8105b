use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{sort_contacts, sort_flows, Store};
use crate::{
    error::StoreError,
    types::{Broadcast, Contact, ContactUpdate, Flow, Keyword, Settings, StoredMessage},
    util::now_iso,
};

#[derive(Default)]
struct Collections {
    messages: Vec<StoredMessage>,
    contacts: HashMap<String, Contact>,
    flows: Vec<Flow>,
    keywords: Vec<Keyword>,
    broadcasts: Vec<Broadcast>,
    settings: Option<Settings>,
}

/// In-process store. Clones share the same collections.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Collections>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn replace_by_id<T, F>(items: &mut [T], id_of: F, id: &str, value: &T) -> bool
where
    T: Clone,
    F: Fn(&T) -> &str,
{
    match items.iter().position(|item| id_of(item) == id) {
        Some(index) => {
            items[index] = value.clone();
            true
        }
        None => false,
    }
}

fn remove_by_id<T, F>(items: &mut Vec<T>, id_of: F, id: &str) -> bool
where
    F: Fn(&T) -> &str,
{
    let before = items.len();
    items.retain(|item| id_of(item) != id);
    items.len() != before
}

#[async_trait]
impl Store for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn insert_message(&self, message: &StoredMessage) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.messages.iter().any(|m| m.id == message.id) {
            return Ok(false);
        }
        inner.messages.push(message.clone());
        Ok(true)
    }

    async fn messages_for_contact(
        &self,
        wa_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let inner = self.inner.read().await;
        let mut messages = inner
            .messages
            .iter()
            .filter(|m| m.wa_id == wa_id)
            .cloned()
            .collect::<Vec<_>>();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let start = messages.len().saturating_sub(limit);
        Ok(messages.split_off(start))
    }

    async fn upsert_contact(&self, update: &ContactUpdate) -> Result<Contact, StoreError> {
        let now = now_iso();
        let mut inner = self.inner.write().await;
        let contact = inner
            .contacts
            .entry(update.wa_id.clone())
            .and_modify(|existing| {
                if !update.contact_name.is_empty() {
                    existing.contact_name = update.contact_name.clone();
                    existing.profile_name = update.contact_name.clone();
                }
                existing.last_message = update.last_message.clone();
                existing.last_message_at = update.last_message_at.clone();
                existing.message_count += 1;
                existing.updated_at = now.clone();
            })
            .or_insert_with(|| Contact {
                wa_id: update.wa_id.clone(),
                contact_name: update.contact_name.clone(),
                profile_name: update.contact_name.clone(),
                last_message: update.last_message.clone(),
                last_message_at: update.last_message_at.clone(),
                message_count: 1,
                created_at: now.clone(),
                updated_at: now.clone(),
            });
        Ok(contact.clone())
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>, StoreError> {
        let inner = self.inner.read().await;
        let mut contacts = inner.contacts.values().cloned().collect::<Vec<_>>();
        sort_contacts(&mut contacts);
        Ok(contacts)
    }

    async fn get_contact(&self, wa_id: &str) -> Result<Option<Contact>, StoreError> {
        Ok(self.inner.read().await.contacts.get(wa_id).cloned())
    }

    async fn delete_contact(&self, wa_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        inner.messages.retain(|m| m.wa_id != wa_id);
        Ok(inner.contacts.remove(wa_id).is_some())
    }

    async fn list_flows(&self) -> Result<Vec<Flow>, StoreError> {
        let mut flows = self.inner.read().await.flows.clone();
        sort_flows(&mut flows);
        Ok(flows)
    }

    async fn get_flow(&self, id: &str) -> Result<Option<Flow>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.flows.iter().find(|f| f.id == id).cloned())
    }

    async fn insert_flow(&self, flow: &Flow) -> Result<(), StoreError> {
        self.inner.write().await.flows.push(flow.clone());
        Ok(())
    }

    async fn update_flow(&self, flow: &Flow) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(replace_by_id(&mut inner.flows, |f| f.id.as_str(), &flow.id, flow))
    }

    async fn delete_flow(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(remove_by_id(&mut inner.flows, |f| f.id.as_str(), id))
    }

    async fn list_keywords(&self) -> Result<Vec<Keyword>, StoreError> {
        Ok(self.inner.read().await.keywords.clone())
    }

    async fn get_keyword(&self, id: &str) -> Result<Option<Keyword>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.keywords.iter().find(|k| k.id == id).cloned())
    }

    async fn insert_keyword(&self, keyword: &Keyword) -> Result<(), StoreError> {
        self.inner.write().await.keywords.push(keyword.clone());
        Ok(())
    }

    async fn update_keyword(&self, keyword: &Keyword) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(replace_by_id(&mut inner.keywords, |k| k.id.as_str(), &keyword.id, keyword))
    }

    async fn delete_keyword(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(remove_by_id(&mut inner.keywords, |k| k.id.as_str(), id))
    }

    async fn list_broadcasts(&self) -> Result<Vec<Broadcast>, StoreError> {
        let mut broadcasts = self.inner.read().await.broadcasts.clone();
        broadcasts.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(broadcasts)
    }

    async fn get_broadcast(&self, id: &str) -> Result<Option<Broadcast>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.broadcasts.iter().find(|b| b.id == id).cloned())
    }

    async fn insert_broadcast(&self, broadcast: &Broadcast) -> Result<(), StoreError> {
        self.inner.write().await.broadcasts.push(broadcast.clone());
        Ok(())
    }

    async fn update_broadcast(&self, broadcast: &Broadcast) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(replace_by_id(
            &mut inner.broadcasts,
            |b| b.id.as_str(),
            &broadcast.id,
            broadcast,
        ))
    }

    async fn delete_broadcast(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(remove_by_id(&mut inner.broadcasts, |b| b.id.as_str(), id))
    }

    async fn get_settings(&self) -> Result<Option<Settings>, StoreError> {
        Ok(self.inner.read().await.settings.clone())
    }

    async fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        self.inner.write().await.settings = Some(settings.clone());
        Ok(())
    }
}
