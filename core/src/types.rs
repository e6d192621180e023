use serde::{Deserialize, Serialize};

use crate::event::Event;

/// イベント種別（相互運用のため固定値）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Metadata,
    Note,
    Relay,
    Contact,
    DirectMessage,
    Delete,
    Share,
    Reaction,
    ChannelCreation,
    ChannelMetadata,
    Chatroom,
    ChannelHideMessage,
    ChannelMuteUser,
    Reporting,
    SharedKey,
    Policy,
    SpendingProposal,
    ApprovedProposal,
    ZapRequest,
    Zap,
    RelayList,
    Authentication,
    NostrConnect,
}

impl EventKind {
    pub fn as_u16(self) -> u16 {
        match self {
            EventKind::Metadata => 0,
            EventKind::Note => 1,
            EventKind::Relay => 2,
            EventKind::Contact => 3,
            EventKind::DirectMessage => 4,
            EventKind::Delete => 5,
            EventKind::Share => 6,
            EventKind::Reaction => 7,
            EventKind::ChannelCreation => 40,
            EventKind::ChannelMetadata => 41,
            EventKind::Chatroom => 42,
            EventKind::ChannelHideMessage => 43,
            EventKind::ChannelMuteUser => 44,
            EventKind::Reporting => 1984,
            EventKind::SharedKey => 9288,
            EventKind::Policy => 9289,
            EventKind::SpendingProposal => 9290,
            EventKind::ApprovedProposal => 9291,
            EventKind::ZapRequest => 9734,
            EventKind::Zap => 9735,
            EventKind::RelayList => 10002,
            EventKind::Authentication => 22242,
            EventKind::NostrConnect => 24133,
        }
    }

    pub fn from_u16(kind: u16) -> Option<Self> {
        let kind = match kind {
            0 => EventKind::Metadata,
            1 => EventKind::Note,
            2 => EventKind::Relay,
            3 => EventKind::Contact,
            4 => EventKind::DirectMessage,
            5 => EventKind::Delete,
            6 => EventKind::Share,
            7 => EventKind::Reaction,
            40 => EventKind::ChannelCreation,
            41 => EventKind::ChannelMetadata,
            42 => EventKind::Chatroom,
            43 => EventKind::ChannelHideMessage,
            44 => EventKind::ChannelMuteUser,
            1984 => EventKind::Reporting,
            9288 => EventKind::SharedKey,
            9289 => EventKind::Policy,
            9290 => EventKind::SpendingProposal,
            9291 => EventKind::ApprovedProposal,
            9734 => EventKind::ZapRequest,
            9735 => EventKind::Zap,
            10002 => EventKind::RelayList,
            22242 => EventKind::Authentication,
            24133 => EventKind::NostrConnect,
            _ => return None,
        };
        Some(kind)
    }
}

impl From<EventKind> for u16 {
    fn from(kind: EventKind) -> Self {
        kind.as_u16()
    }
}

/// タグ種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagType {
    /// 公開鍵参照
    PubKey,
    /// イベント参照
    Event,
}

impl TagType {
    pub fn as_str(self) -> &'static str {
        match self {
            TagType::PubKey => "p",
            TagType::Event => "e",
        }
    }

    pub fn tag(self, value: impl Into<String>) -> Vec<String> {
        vec![self.as_str().to_string(), value.into()]
    }
}

/// Relay検索フィルター (NIP-01)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(rename = "#e", default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<String>>,
    #[serde(rename = "#p", default, skip_serializing_if = "Option::is_none")]
    pub pubkeys: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind.as_u16());
        self
    }

    pub fn author(mut self, pubkey: impl Into<String>) -> Self {
        self.authors.get_or_insert_with(Vec::new).push(pubkey.into());
        self
    }

    pub fn pubkey(mut self, pubkey: impl Into<String>) -> Self {
        self.pubkeys.get_or_insert_with(Vec::new).push(pubkey.into());
        self
    }

    pub fn event(mut self, event_id: impl Into<String>) -> Self {
        self.events.get_or_insert_with(Vec::new).push(event_id.into());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// イベントがフィルター条件に一致するか
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == event.id()) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == event.pubkey()) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }
        if let Some(events) = &self.events {
            if !event.tag_values(TagType::Event).any(|v| events.iter().any(|e| e == v)) {
                return false;
            }
        }
        if let Some(pubkeys) = &self.pubkeys {
            if !event.tag_values(TagType::PubKey).any(|v| pubkeys.iter().any(|p| p == v)) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at() < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at() > until {
                return false;
            }
        }
        true
    }
}

/// 自分が送信したメッセージ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnMessage {
    pub event_id: String,
    pub to: String,
    pub content: String,
    pub created_at: u64,
}

impl OwnMessage {
    /// 送信済みDirectMessageイベントから作成（宛先は最初の `p` タグ）
    pub fn from_event(event: &Event, plaintext: impl Into<String>) -> Self {
        Self {
            event_id: event.id().to_string(),
            to: event.first_tag(TagType::PubKey).unwrap_or_default().to_string(),
            content: plaintext.into(),
            created_at: event.created_at(),
        }
    }
}

/// ローカルセッションのアカウント情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub hex: String,
    pub npub: String,
    pub tags: Vec<Vec<String>>,
    pub metadata: Option<serde_json::Value>,
    pub relays: Vec<String>,
    pub own_messages: Vec<OwnMessage>,
}

impl Account {
    pub fn new(hex: String, npub: String, relays: Vec<String>) -> Self {
        Self {
            hex,
            npub,
            tags: Vec::new(),
            metadata: None,
            relays,
            own_messages: Vec::new(),
        }
    }

    /// 指定されたフィールドのみ上書き
    pub fn apply(&mut self, update: AccountUpdate) {
        if let Some(tags) = update.tags {
            self.tags = tags;
        }
        if let Some(metadata) = update.metadata {
            self.metadata = Some(metadata);
        }
        if let Some(relays) = update.relays {
            self.relays = relays;
        }
    }
}

/// アカウント更新内容
#[derive(Debug, Clone, Default)]
pub struct AccountUpdate {
    pub tags: Option<Vec<Vec<String>>>,
    pub metadata: Option<serde_json::Value>,
    pub relays: Option<Vec<String>>,
}

/// 連絡先（問い合わせ毎に再計算）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub hex: String,
    pub npub: String,
}

/// プロフィールメタデータ (kind 0)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    pub content: serde_json::Value,
    pub tags: Vec<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_registry() {
        assert_eq!(EventKind::Metadata.as_u16(), 0);
        assert_eq!(EventKind::DirectMessage.as_u16(), 4);
        assert_eq!(EventKind::SharedKey.as_u16(), 9288);
        assert_eq!(EventKind::Policy.as_u16(), 9289);
        assert_eq!(EventKind::NostrConnect.as_u16(), 24133);
        assert_eq!(EventKind::from_u16(9290), Some(EventKind::SpendingProposal));
        assert_eq!(EventKind::from_u16(12345), None);
    }

    #[test]
    fn test_filter_json_shape() {
        let filter = Filter::new()
            .kind(EventKind::Policy)
            .pubkey("abc")
            .limit(10);
        let json = serde_json::to_value(&filter).unwrap();

        assert_eq!(json["kinds"][0], 9289);
        assert_eq!(json["#p"][0], "abc");
        assert_eq!(json["limit"], 10);
        assert!(json.get("authors").is_none());
        assert!(json.get("#e").is_none());
    }

    #[test]
    fn test_filter_time_window() {
        let filter = Filter::new().since(100).until(200);
        let json = serde_json::to_value(&filter).unwrap();

        assert_eq!(json["since"], 100);
        assert_eq!(json["until"], 200);
    }

    #[test]
    fn test_account_apply_only_given_fields() {
        let mut account = Account::new("hex".into(), "npub".into(), vec!["wss://a".into()]);
        account.apply(AccountUpdate {
            tags: Some(vec![vec!["t".into(), "x".into()]]),
            ..Default::default()
        });

        assert_eq!(account.tags.len(), 1);
        assert_eq!(account.relays, vec!["wss://a".to_string()]);
        assert!(account.metadata.is_none());
    }
}
