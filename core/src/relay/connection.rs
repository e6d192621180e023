use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use wasm_bindgen::{closure::Closure, JsCast};
use web_sys::{CloseEvent, ErrorEvent, MessageEvent, WebSocket};

use super::backoff::{Availability, ExponentialBackoff};
use super::message::RelayMessage;
use crate::error::{CoreError, Result};

/// 接続状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// 接続から通知されるイベント
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Message(RelayMessage),
    Closed,
}

pub type ConnectionHandler = Rc<dyn Fn(&str, ConnectionEvent)>;

struct Shared {
    url: String,
    ws: RefCell<Option<WebSocket>>,
    state: Cell<ConnectionState>,
    backoff: RefCell<ExponentialBackoff>,
    /// sub_id -> REQフレーム（再接続時に再送）
    subscriptions: RefCell<HashMap<String, String>>,
    /// 接続前に送ろうとしたフレーム
    outbound: RefCell<Vec<String>>,
    handler: ConnectionHandler,
}

impl Shared {
    fn flush(&self) {
        let ws = self.ws.borrow();
        let Some(ws) = ws.as_ref() else {
            return;
        };
        for req in self.subscriptions.borrow().values() {
            if let Err(e) = ws.send_with_str(req) {
                log::warn!("Failed to resubscribe on {}: {:?}", self.url, e);
            }
        }
        let queued: Vec<String> = self.outbound.borrow_mut().drain(..).collect();
        for frame in queued {
            if let Err(e) = ws.send_with_str(&frame) {
                log::warn!("Failed to flush frame to {}: {:?}", self.url, e);
            }
        }
    }
}

/// Relay接続
pub struct RelayConnection {
    shared: Rc<Shared>,
    last_connect_attempt: Cell<u64>,
    // クロージャを保持してドロップされないようにする
    #[allow(clippy::type_complexity)]
    closures: RefCell<
        Option<(
            Closure<dyn FnMut()>,
            Closure<dyn FnMut(MessageEvent)>,
            Closure<dyn FnMut(ErrorEvent)>,
            Closure<dyn FnMut(CloseEvent)>,
        )>,
    >,
}

impl RelayConnection {
    pub fn new(url: impl Into<String>, handler: ConnectionHandler) -> Self {
        Self {
            shared: Rc::new(Shared {
                url: url.into(),
                ws: RefCell::new(None),
                state: Cell::new(ConnectionState::Disconnected),
                backoff: RefCell::new(ExponentialBackoff::new()),
                subscriptions: RefCell::new(HashMap::new()),
                outbound: RefCell::new(Vec::new()),
                handler,
            }),
            last_connect_attempt: Cell::new(0),
            closures: RefCell::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// 接続試行
    pub fn connect(&self) -> Result<()> {
        if self.state() != ConnectionState::Disconnected {
            return Ok(());
        }

        self.shared.state.set(ConnectionState::Connecting);
        self.last_connect_attempt.set(crate::time::now());

        let ws = match WebSocket::new(&self.shared.url) {
            Ok(ws) => ws,
            Err(e) => {
                self.shared.state.set(ConnectionState::Disconnected);
                self.shared.backoff.borrow_mut().next_delay();
                return Err(e.into());
            }
        };
        ws.set_binary_type(web_sys::BinaryType::Arraybuffer);

        let on_open = {
            let shared = self.shared.clone();
            Closure::wrap(Box::new(move || {
                log::info!("WebSocket connected to {}", shared.url);
                shared.state.set(ConnectionState::Connected);
                shared.backoff.borrow_mut().reset();
                shared.flush();
            }) as Box<dyn FnMut()>)
        };

        let on_message = {
            let shared = self.shared.clone();
            Closure::wrap(Box::new(move |event: MessageEvent| {
                let Some(text) = event.data().as_string() else {
                    return;
                };
                match RelayMessage::parse(&text) {
                    Ok(msg) => (shared.handler)(&shared.url, ConnectionEvent::Message(msg)),
                    Err(e) => log::warn!("Failed to parse relay message from {}: {}", shared.url, e),
                }
            }) as Box<dyn FnMut(MessageEvent)>)
        };

        let on_error = {
            let url = self.shared.url.clone();
            Closure::wrap(Box::new(move |_event: ErrorEvent| {
                log::error!("WebSocket error on {}", url);
            }) as Box<dyn FnMut(ErrorEvent)>)
        };

        let on_close = {
            let shared = self.shared.clone();
            Closure::wrap(Box::new(move |_event: CloseEvent| {
                log::info!("WebSocket closed for {}", shared.url);
                shared.state.set(ConnectionState::Disconnected);
                shared.ws.borrow_mut().take();
                // 未送信分は破棄
                shared.outbound.borrow_mut().clear();
                shared.backoff.borrow_mut().next_delay();
                (shared.handler)(&shared.url, ConnectionEvent::Closed);
            }) as Box<dyn FnMut(CloseEvent)>)
        };

        ws.set_onopen(Some(on_open.as_ref().unchecked_ref()));
        ws.set_onmessage(Some(on_message.as_ref().unchecked_ref()));
        ws.set_onerror(Some(on_error.as_ref().unchecked_ref()));
        ws.set_onclose(Some(on_close.as_ref().unchecked_ref()));

        *self.shared.ws.borrow_mut() = Some(ws);
        *self.closures.borrow_mut() = Some((on_open, on_message, on_error, on_close));
        Ok(())
    }

    /// 現在の接続可否
    pub fn availability(&self) -> Availability {
        self.shared.backoff.borrow().availability(
            self.state() == ConnectionState::Disconnected,
            self.last_connect_attempt.get(),
            crate::time::now(),
        )
    }

    /// 必要なら接続し直す。バックオフ中はエラー
    pub fn reconnect_if_needed(&self) -> Result<()> {
        match self.availability() {
            Availability::Usable => Ok(()),
            Availability::Reconnect => {
                log::info!("Reconnecting to {}", self.shared.url);
                self.connect()
            }
            Availability::Backoff { retry_in } => Err(CoreError::RelayError(format!(
                "{} unavailable (backoff, retry in {}s)",
                self.shared.url, retry_in
            ))),
        }
    }

    /// フレーム送信（接続中ならキューに積み、ソケットがなければエラー）
    pub fn send(&self, frame: String) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => match self.shared.ws.borrow().as_ref() {
                Some(ws) => {
                    ws.send_with_str(&frame)?;
                    Ok(())
                }
                None => Err(CoreError::RelayError(format!("{} has no socket", self.shared.url))),
            },
            ConnectionState::Connecting => {
                self.shared.outbound.borrow_mut().push(frame);
                Ok(())
            }
            ConnectionState::Disconnected => Err(CoreError::RelayError(format!(
                "{} is disconnected",
                self.shared.url
            ))),
        }
    }

    /// 購読登録（接続済みなら即送信、再接続時は再送）
    pub fn subscribe(&self, sub_id: &str, req: String) -> Result<()> {
        self.shared
            .subscriptions
            .borrow_mut()
            .insert(sub_id.to_string(), req.clone());
        if self.is_connected() {
            if let Some(ws) = self.shared.ws.borrow().as_ref() {
                ws.send_with_str(&req)?;
            }
        }
        Ok(())
    }

    /// 購読解除（CLOSEフレームを送信）
    pub fn unsubscribe(&self, sub_id: &str, close: String) -> Result<()> {
        if self.shared.subscriptions.borrow_mut().remove(sub_id).is_none() {
            return Ok(());
        }
        if self.is_connected() {
            self.send(close)?;
        }
        Ok(())
    }

    pub fn close(&self) {
        self.shared.subscriptions.borrow_mut().clear();
        self.shared.outbound.borrow_mut().clear();
        if let Some(ws) = self.shared.ws.borrow_mut().take() {
            ws.set_onopen(None);
            ws.set_onmessage(None);
            ws.set_onerror(None);
            ws.set_onclose(None);
            let _ = ws.close();
        }
        self.closures.borrow_mut().take();
        self.shared.state.set(ConnectionState::Disconnected);
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.close();
    }
}
