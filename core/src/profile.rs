//! プロフィールメタデータ (kind 0) と連絡先 (kind 3)

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CoreError, Result};
use crate::event::Event;
use crate::keys;
use crate::relay::{RelayPool, RelaySet, SubscriptionHandle, SubscriptionItem};
use crate::types::{Contact, EventKind, Filter, ProfileMetadata, TagType};

pub struct ProfileService {
    pool: Arc<dyn RelayPool>,
    relays: RelaySet,
    timeout: Duration,
}

impl ProfileService {
    pub fn new(pool: Arc<dyn RelayPool>, relays: RelaySet, timeout: Duration) -> Self {
        Self { pool, relays, timeout }
    }

    /// 自分のメタデータの購読（キャンセルまで継続）
    pub async fn subscribe_metadata(&self, pubkey: &str) -> Result<SubscriptionHandle> {
        let pubkey = keys::normalize_public_key(pubkey)?;
        let relays = self.relays.require()?;
        self.pool
            .subscribe(&relays, vec![Filter::new().kind(EventKind::Metadata).author(pubkey)])
            .await
    }

    /// 最初に届いたメタデータを返す
    ///
    /// 全RelayがEOSEを返すか、タイムアウトした場合は `MetadataTimeout`。
    pub async fn fetch_metadata(&self, pubkey: &str) -> Result<ProfileMetadata> {
        let pubkey = keys::normalize_public_key(pubkey)?;
        let relays = self.relays.require()?;
        let mut sub = self
            .pool
            .subscribe(&relays, vec![Filter::new().kind(EventKind::Metadata).author(pubkey.as_str())])
            .await?;

        let first_event = async {
            let mut eose_from = HashSet::new();
            while let Some(item) = sub.next().await {
                match item {
                    SubscriptionItem::Event { event, .. } => return Ok(event),
                    SubscriptionItem::Eose { relay } => {
                        eose_from.insert(relay);
                        if eose_from.len() >= relays.len() {
                            break;
                        }
                    }
                }
            }
            Err(CoreError::MetadataTimeout)
        };

        let event = tokio::select! {
            result = first_event => result?,
            _ = crate::time::sleep(self.timeout) => {
                log::warn!("Metadata for {} timed out after {:?}", pubkey, self.timeout);
                return Err(CoreError::MetadataTimeout);
            }
        };
        sub.cancel();
        parse_metadata(&event)
    }

    /// Contactイベントの `p` タグを集約（重複除去）
    pub async fn contacts(&self, pubkey: &str) -> Result<Vec<Contact>> {
        let pubkey = keys::normalize_public_key(pubkey)?;
        let relays = self.relays.require()?;
        let events = self
            .pool
            .list(&relays, vec![Filter::new().kind(EventKind::Contact).author(pubkey)])
            .await?;

        let mut contacts: Vec<Contact> = Vec::new();
        for value in events.iter().flat_map(|e| e.tag_values(TagType::PubKey)) {
            let Ok(npub) = keys::parse_hex(value).and_then(|_| keys::hex_to_npub(value)) else {
                log::debug!("Skipping malformed contact key");
                continue;
            };
            if contacts.iter().any(|c| c.hex == value) {
                continue;
            }
            contacts.push(Contact {
                hex: value.to_string(),
                npub,
            });
        }
        Ok(contacts)
    }
}

fn parse_metadata(event: &Event) -> Result<ProfileMetadata> {
    let content = serde_json::from_str(event.content())
        .map_err(|e| CoreError::ParseError(format!("Invalid metadata content: {}", e)))?;
    Ok(ProfileMetadata {
        content,
        tags: event.tags().to_vec(),
    })
}
