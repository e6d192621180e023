use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::{
    PublishHandle, RelayPool, RelayStatus, SubscriptionCanceller, SubscriptionHandle,
    SubscriptionItem,
};
use crate::error::{CoreError, Result};
use crate::event::Event;
use crate::subscription::SubscriptionManager;
use crate::types::Filter;

type RejectRule = Box<dyn Fn(&Event) -> Option<String> + Send>;

#[derive(Default)]
struct MockRelay {
    events: Vec<Event>,
    offline: bool,
    rules: Vec<RejectRule>,
}

struct MockState {
    relays: HashMap<String, MockRelay>,
    subs: SubscriptionManager,
    senders: HashMap<String, mpsc::UnboundedSender<SubscriptionItem>>,
    publish_count: usize,
}

impl MockState {
    /// 受理したイベントを購読中のハンドルへ配信
    fn deliver(&self, relay: &str, event: &Event) {
        for sub in self.subs.get_active_subs() {
            if !sub.relays.iter().any(|r| r == relay) {
                continue;
            }
            if !sub.filters.iter().any(|f| f.matches(event)) {
                continue;
            }
            if let Some(tx) = self.senders.get(&sub.sub_id) {
                let _ = tx.send(SubscriptionItem::Event {
                    relay: relay.to_string(),
                    event: event.clone(),
                });
            }
        }
    }

    fn stored_matching(&self, relay: &str, filters: &[Filter]) -> Vec<Event> {
        self.relays
            .get(relay)
            .map(|r| {
                r.events
                    .iter()
                    .filter(|e| filters.iter().any(|f| f.matches(e)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn is_online(&self, relay: &str) -> bool {
        self.relays.get(relay).map_or(false, |r| !r.offline)
    }
}

/// テスト用のインメモリRelayプール
#[derive(Clone)]
pub struct MockRelayPool {
    state: Arc<Mutex<MockState>>,
}

impl MockRelayPool {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                relays: HashMap::new(),
                subs: SubscriptionManager::new("mock"),
                senders: HashMap::new(),
                publish_count: 0,
            })),
        }
    }

    pub fn with_relays(urls: &[&str]) -> Self {
        let pool = Self::new();
        for url in urls {
            pool.add_relay(url);
        }
        pool
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_relay(&self, url: &str) {
        self.lock().relays.entry(url.to_string()).or_default();
    }

    /// Relayをオフラインにする（接続失敗扱い）
    pub fn set_offline(&self, url: &str, offline: bool) {
        self.lock().relays.entry(url.to_string()).or_default().offline = offline;
    }

    /// 条件に一致したイベントを拒否するルールを追加
    pub fn reject_when(&self, url: &str, rule: impl Fn(&Event) -> Option<String> + Send + 'static) {
        self.lock()
            .relays
            .entry(url.to_string())
            .or_default()
            .rules
            .push(Box::new(rule));
    }

    /// イベントを直接格納（配信はしない）
    pub fn insert_event(&self, url: &str, event: Event) {
        self.lock().relays.entry(url.to_string()).or_default().events.push(event);
    }

    pub fn events(&self, url: &str) -> Vec<Event> {
        self.lock()
            .relays
            .get(url)
            .map(|r| r.events.clone())
            .unwrap_or_default()
    }

    pub fn publish_count(&self) -> usize {
        self.lock().publish_count
    }

    pub fn active_subscriptions(&self) -> usize {
        self.lock().senders.len()
    }
}

impl Default for MockRelayPool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl RelayPool for MockRelayPool {
    async fn publish(&self, relays: &[String], event: &Event) -> Result<PublishHandle> {
        let (tx, handle) = PublishHandle::channel(event.id());
        let mut state = self.lock();
        state.publish_count += 1;

        for relay in relays {
            let status = match state.relays.get_mut(relay) {
                None => RelayStatus::Failed {
                    relay: relay.clone(),
                    reason: "unknown relay".to_string(),
                },
                Some(r) if r.offline => RelayStatus::Failed {
                    relay: relay.clone(),
                    reason: "connection refused".to_string(),
                },
                Some(r) => match r.rules.iter().find_map(|rule| rule(event)) {
                    Some(reason) => RelayStatus::Failed {
                        relay: relay.clone(),
                        reason,
                    },
                    None => {
                        if !r.events.iter().any(|e| e.id() == event.id()) {
                            r.events.push(event.clone());
                        }
                        RelayStatus::Ok { relay: relay.clone() }
                    }
                },
            };

            if status.is_ok() {
                state.deliver(relay, event);
            } else {
                log::debug!("mock relay {} rejected {}", relay, event.id());
            }
            let _ = tx.send(status);
        }

        Ok(handle)
    }

    async fn subscribe(&self, relays: &[String], filters: Vec<Filter>) -> Result<SubscriptionHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();

        let online: Vec<String> = relays.iter().filter(|r| state.is_online(r)).cloned().collect();
        if online.is_empty() {
            return Err(CoreError::RelayQueryFailure("no relay reachable".to_string()));
        }

        for relay in &online {
            for event in state.stored_matching(relay, &filters) {
                let _ = tx.send(SubscriptionItem::Event {
                    relay: relay.clone(),
                    event,
                });
            }
            let _ = tx.send(SubscriptionItem::Eose { relay: relay.clone() });
        }

        let (sub_id, _req) = state.subs.open(&online, filters)?;
        state.senders.insert(sub_id.clone(), tx);

        let shared = self.state.clone();
        let id = sub_id.clone();
        let canceller = SubscriptionCanceller::new(move || {
            let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
            state.subs.close(&id);
            state.senders.remove(&id);
        });

        Ok(SubscriptionHandle::new(sub_id, rx, canceller))
    }

    async fn list(&self, relays: &[String], filters: Vec<Filter>) -> Result<Vec<Event>> {
        let state = self.lock();
        let mut result: Vec<Event> = Vec::new();
        let mut failures = 0;

        for relay in relays {
            if !state.is_online(relay) {
                log::warn!("mock relay {} unreachable", relay);
                failures += 1;
                continue;
            }
            for event in state.stored_matching(relay, &filters) {
                if !result.iter().any(|e| e.id() == event.id()) {
                    result.push(event);
                }
            }
        }

        if failures == relays.len() {
            return Err(CoreError::RelayQueryFailure(format!(
                "all {} relays failed",
                relays.len()
            )));
        }
        Ok(result)
    }
}
