use thiserror::Error;
#[cfg(target_arch = "wasm32")]
use wasm_bindgen::JsValue;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Signing provider is not available")]
    ProviderUnavailable,

    #[error("Invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    #[error("Invalid policy expression: {0}")]
    InvalidPolicyExpression(String),

    #[error("No participant public keys found in policy")]
    EmptyParticipantSet,

    #[error("Shared key generation failed: {0}")]
    KeyGenerationFailure(String),

    #[error("Shared key not found for policy {policy_id}")]
    SharedKeyNotFound { policy_id: String },

    #[error("Unable to decrypt shared key for policy {policy_id}: {reason}")]
    SharedKeyDecryptionFailure { policy_id: String, reason: String },

    #[error("Policy {policy_id} is corrupt: {reason}")]
    PolicyCorrupt { policy_id: String, reason: String },

    #[error("Relay query failed: {0}")]
    RelayQueryFailure(String),

    #[error("Event {event_id} rejected by {relay}: {reason}")]
    PublishRejected {
        event_id: String,
        relay: String,
        reason: String,
    },

    #[error("Failed to get the metadata")]
    MetadataTimeout,

    #[error("No relays configured")]
    NoRelays,

    #[error("No active account")]
    NoActiveAccount,

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("JavaScript error: {0}")]
    JsError(String),

    #[error("Relay error: {0}")]
    RelayError(String),

    #[error("Signer error: {0}")]
    SignerError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("{0}")]
    Other(String),
}

#[cfg(target_arch = "wasm32")]
impl From<JsValue> for CoreError {
    fn from(value: JsValue) -> Self {
        if let Some(s) = value.as_string() {
            CoreError::JsError(s)
        } else {
            CoreError::JsError(format!("{:?}", value))
        }
    }
}

#[cfg(target_arch = "wasm32")]
impl From<CoreError> for JsValue {
    fn from(error: CoreError) -> Self {
        JsValue::from_str(&error.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(error: serde_json::Error) -> Self {
        CoreError::ParseError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
