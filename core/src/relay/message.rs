use crate::error::{CoreError, Result};
use crate::event::Event;
use crate::types::Filter;

/// Relayメッセージ型 (relay -> client)
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event { sub_id: String, event: Event },
    Eose { sub_id: String },
    Ok { event_id: String, accepted: bool, message: String },
    Notice { message: String },
    Closed { sub_id: String, message: String },
}

fn str_at<'a>(arr: &'a [serde_json::Value], index: usize, name: &str) -> Result<&'a str> {
    arr.get(index)
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::ParseError(format!("{} not a string", name)))
}

impl RelayMessage {
    /// JSONからパース
    pub fn parse(json: &str) -> Result<Self> {
        let arr: Vec<serde_json::Value> = serde_json::from_str(json)?;

        if arr.is_empty() {
            return Err(CoreError::ParseError("Empty message array".to_string()));
        }

        let msg_type = str_at(&arr, 0, "Message type")?;

        match msg_type {
            "EVENT" => {
                if arr.len() < 3 {
                    return Err(CoreError::ParseError("Invalid EVENT message".to_string()));
                }
                let sub_id = str_at(&arr, 1, "sub_id")?.to_string();
                let event: Event = serde_json::from_value(arr[2].clone())
                    .map_err(|e| CoreError::InvalidEvent(e.to_string()))?;
                Ok(RelayMessage::Event { sub_id, event })
            }
            "EOSE" => {
                let sub_id = str_at(&arr, 1, "sub_id")?.to_string();
                Ok(RelayMessage::Eose { sub_id })
            }
            "OK" => {
                if arr.len() < 3 {
                    return Err(CoreError::ParseError("Invalid OK message".to_string()));
                }
                let event_id = str_at(&arr, 1, "event_id")?.to_string();
                let accepted = arr[2]
                    .as_bool()
                    .ok_or_else(|| CoreError::ParseError("accepted not a bool".to_string()))?;
                let message = arr.get(3).and_then(|v| v.as_str()).unwrap_or("").to_string();
                Ok(RelayMessage::Ok { event_id, accepted, message })
            }
            "NOTICE" => {
                let message = str_at(&arr, 1, "message")?.to_string();
                Ok(RelayMessage::Notice { message })
            }
            "CLOSED" => {
                let sub_id = str_at(&arr, 1, "sub_id")?.to_string();
                let message = arr.get(2).and_then(|v| v.as_str()).unwrap_or("").to_string();
                Ok(RelayMessage::Closed { sub_id, message })
            }
            _ => Err(CoreError::ParseError(format!("Unknown message type: {}", msg_type))),
        }
    }
}

/// クライアントメッセージ (client -> relay)
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Event),
    Req { sub_id: String, filters: Vec<Filter> },
    Close { sub_id: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            ClientMessage::Event(event) => serde_json::json!(["EVENT", event]),
            ClientMessage::Req { sub_id, filters } => {
                let mut frame = vec![serde_json::json!("REQ"), serde_json::json!(sub_id)];
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                serde_json::Value::Array(frame)
            }
            ClientMessage::Close { sub_id } => serde_json::json!(["CLOSE", sub_id]),
        };
        Ok(value.to_string())
    }
}
