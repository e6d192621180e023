//! WebSocketによるRelayプール（ブラウザ用）

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::connection::{ConnectionEvent, ConnectionHandler, RelayConnection};
use super::message::{ClientMessage, RelayMessage};
use super::{
    PublishHandle, RelayPool, RelayStatus, SubscriptionCanceller, SubscriptionHandle,
    SubscriptionItem,
};
use crate::error::{CoreError, Result};
use crate::event::Event;
use crate::subscription::SubscriptionManager;
use crate::types::Filter;

struct PendingPublish {
    tx: mpsc::UnboundedSender<RelayStatus>,
    waiting: HashSet<String>,
}

struct PoolState {
    connections: HashMap<String, Rc<RelayConnection>>,
    subs: SubscriptionManager,
    sub_senders: HashMap<String, mpsc::UnboundedSender<SubscriptionItem>>,
    pending: HashMap<String, Vec<PendingPublish>>,
}

impl PoolState {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
            subs: SubscriptionManager::new("coinstr"),
            sub_senders: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    fn on_message(&mut self, relay: &str, msg: RelayMessage) {
        match msg {
            RelayMessage::Event { sub_id, event } => {
                if let Some(tx) = self.sub_senders.get(&sub_id) {
                    let _ = tx.send(SubscriptionItem::Event {
                        relay: relay.to_string(),
                        event,
                    });
                }
            }
            RelayMessage::Eose { sub_id } => self.on_eose(relay, &sub_id),
            RelayMessage::Closed { sub_id, message } => {
                log::warn!("Subscription {} closed by {}: {}", sub_id, relay, message);
                self.on_eose(relay, &sub_id);
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                let status = if accepted {
                    RelayStatus::Ok {
                        relay: relay.to_string(),
                    }
                } else {
                    RelayStatus::Failed {
                        relay: relay.to_string(),
                        reason: message,
                    }
                };
                self.resolve(&event_id, relay, status);
            }
            RelayMessage::Notice { message } => log::info!("NOTICE from {}: {}", relay, message),
        }
    }

    fn on_eose(&mut self, relay: &str, sub_id: &str) {
        if let Some(tx) = self.sub_senders.get(sub_id) {
            let _ = tx.send(SubscriptionItem::Eose {
                relay: relay.to_string(),
            });
        }
        self.subs.mark_eose(sub_id, relay);
    }

    /// 切断されたRelayの応答待ちを失敗にし、購読はEOSE扱いにする
    fn on_closed(&mut self, relay: &str) {
        let event_ids: Vec<String> = self.pending.keys().cloned().collect();
        for event_id in event_ids {
            self.resolve(
                &event_id,
                relay,
                RelayStatus::Failed {
                    relay: relay.to_string(),
                    reason: "connection closed".to_string(),
                },
            );
        }

        let affected: Vec<String> = self
            .subs
            .get_active_subs()
            .into_iter()
            .filter(|sub| sub.relays.iter().any(|r| r == relay) && !sub.eose_from.contains(relay))
            .map(|sub| sub.sub_id.clone())
            .collect();
        for sub_id in &affected {
            if let Some(tx) = self.sub_senders.get(sub_id) {
                let _ = tx.send(SubscriptionItem::Eose {
                    relay: relay.to_string(),
                });
            }
        }
        let completed = self.subs.mark_relay_gone(relay);
        log::debug!(
            "{} lost: {} subscriptions affected, {} now complete",
            relay,
            affected.len(),
            completed.len()
        );
    }

    fn resolve(&mut self, event_id: &str, relay: &str, status: RelayStatus) {
        let Some(waiters) = self.pending.get_mut(event_id) else {
            return;
        };
        for pending in waiters.iter_mut() {
            if pending.waiting.remove(relay) {
                let _ = pending.tx.send(status.clone());
            }
        }
        // 全Relayの応答が揃った送信はチャンネルを閉じる
        waiters.retain(|pending| !pending.waiting.is_empty());
        if waiters.is_empty() {
            self.pending.remove(event_id);
        }
    }
}

/// WebSocketによるRelayプール
#[derive(Clone)]
pub struct WebSocketPool {
    state: Rc<RefCell<PoolState>>,
    list_timeout: Duration,
}

impl WebSocketPool {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(PoolState::new())),
            list_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_list_timeout(mut self, timeout: Duration) -> Self {
        self.list_timeout = timeout;
        self
    }

    fn handler(&self) -> ConnectionHandler {
        let state: Weak<RefCell<PoolState>> = Rc::downgrade(&self.state);
        Rc::new(move |relay: &str, event: ConnectionEvent| {
            let Some(state) = state.upgrade() else {
                return;
            };
            let mut state = state.borrow_mut();
            match event {
                ConnectionEvent::Message(msg) => state.on_message(relay, msg),
                ConnectionEvent::Closed => state.on_closed(relay),
            };
        })
    }

    /// 接続を取得（なければ作成して接続）
    fn connection(&self, url: &str) -> Result<Rc<RelayConnection>> {
        let existing = self.state.borrow().connections.get(url).cloned();
        let conn = match existing {
            Some(conn) => conn,
            None => {
                let conn = Rc::new(RelayConnection::new(url, self.handler()));
                self.state
                    .borrow_mut()
                    .connections
                    .insert(url.to_string(), conn.clone());
                conn.connect()?;
                return Ok(conn);
            }
        };
        conn.reconnect_if_needed()?;
        Ok(conn)
    }

    /// 全接続を閉じる
    pub fn disconnect(&self) {
        let connections: Vec<Rc<RelayConnection>> =
            self.state.borrow_mut().connections.drain().map(|(_, c)| c).collect();
        for conn in connections {
            conn.close();
        }
    }
}

impl Default for WebSocketPool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl RelayPool for WebSocketPool {
    async fn publish(&self, relays: &[String], event: &Event) -> Result<PublishHandle> {
        let (tx, handle) = PublishHandle::channel(event.id());
        let frame = ClientMessage::Event(event.clone()).to_json()?;

        let mut reachable = Vec::new();
        for relay in relays {
            match self.connection(relay) {
                Ok(conn) => reachable.push(conn),
                Err(e) => {
                    let _ = tx.send(RelayStatus::Failed {
                        relay: relay.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        // 接続できたRelayがなければtxがここでdropされ、ハンドルは完了する
        if !reachable.is_empty() {
            self.state
                .borrow_mut()
                .pending
                .entry(event.id().to_string())
                .or_default()
                .push(PendingPublish {
                    tx,
                    waiting: reachable.iter().map(|c| c.url().to_string()).collect(),
                });
        }

        for conn in reachable {
            if let Err(e) = conn.send(frame.clone()) {
                self.state.borrow_mut().resolve(
                    event.id(),
                    conn.url(),
                    RelayStatus::Failed {
                        relay: conn.url().to_string(),
                        reason: e.to_string(),
                    },
                );
            }
        }

        Ok(handle)
    }

    async fn subscribe(&self, relays: &[String], filters: Vec<Filter>) -> Result<SubscriptionHandle> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut connections = Vec::new();
        for relay in relays {
            match self.connection(relay) {
                Ok(conn) => connections.push(conn),
                Err(e) => {
                    log::warn!("Failed to connect to {}: {}", relay, e);
                    let _ = tx.send(SubscriptionItem::Eose { relay: relay.clone() });
                }
            }
        }
        if connections.is_empty() {
            return Err(CoreError::RelayQueryFailure("no relay reachable".to_string()));
        }

        let urls: Vec<String> = connections.iter().map(|c| c.url().to_string()).collect();
        let (sub_id, req) = {
            let mut state = self.state.borrow_mut();
            let opened = state.subs.open(&urls, filters)?;
            state.sub_senders.insert(opened.0.clone(), tx);
            opened
        };
        for conn in &connections {
            conn.subscribe(&sub_id, req.clone())?;
        }
        log::debug!("Opened subscription {} on {} relays", sub_id, urls.len());

        let state = Rc::downgrade(&self.state);
        let id = sub_id.clone();
        let canceller = SubscriptionCanceller::new(move || {
            let Some(state) = state.upgrade() else {
                return;
            };
            let mut state = state.borrow_mut();
            state.sub_senders.remove(&id);
            if let Some((sub, close)) = state.subs.close(&id) {
                for relay in &sub.relays {
                    if let Some(conn) = state.connections.get(relay) {
                        let _ = conn.unsubscribe(&id, close.clone());
                    }
                }
            }
        });

        Ok(SubscriptionHandle::new(sub_id, rx, canceller))
    }

    async fn list(&self, relays: &[String], filters: Vec<Filter>) -> Result<Vec<Event>> {
        let mut sub = self.subscribe(relays, filters).await?;
        let expected = relays.len();

        let mut events: Vec<Event> = Vec::new();
        let collect = async {
            let mut eose_from = HashSet::new();
            while let Some(item) = sub.next().await {
                match item {
                    SubscriptionItem::Event { event, .. } => {
                        if !events.iter().any(|e| e.id() == event.id()) {
                            events.push(event);
                        }
                    }
                    SubscriptionItem::Eose { relay } => {
                        eose_from.insert(relay);
                        if eose_from.len() >= expected {
                            break;
                        }
                    }
                }
            }
        };

        tokio::select! {
            _ = collect => {}
            _ = crate::time::sleep(self.list_timeout) => {
                log::warn!("List timed out after {:?}, returning {} events", self.list_timeout, events.len());
            }
        }
        sub.cancel();
        Ok(events)
    }
}
