use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::MessageError;

fn default_queue() -> String {
    "default".to_string()
}

/// The fields of a job payload needed for throttling decisions.
///
/// Jobs produced by an adapter layer carry a generic envelope class in `class` and the
/// logical job class in `wrapped`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    #[serde(default)]
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped: Option<String>,
    pub jid: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default = "default_queue")]
    pub queue: String,
}

impl JobMessage {
    pub fn new(class: impl Into<String>, jid: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            wrapped: None,
            jid: jid.into(),
            args: Vec::new(),
            queue: default_queue(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Move the current class into `wrapped` and use `envelope` as the outer class.
    pub fn wrapped_in(mut self, envelope: impl Into<String>) -> Self {
        let inner = std::mem::replace(&mut self.class, envelope.into());
        self.wrapped = Some(inner);
        self
    }

    /// Decode a raw JSON payload.
    ///
    /// # Errors
    ///
    /// Returns `MessageError` if the payload is not JSON, or if the class or job id is
    /// missing or empty.
    pub fn parse(raw: &str) -> Result<Self, MessageError> {
        let message: JobMessage = serde_json::from_str(raw)?;
        if message.effective_class().is_empty() {
            return Err(MessageError::MissingField("class"));
        }
        if message.jid.is_empty() {
            return Err(MessageError::MissingField("jid"));
        }
        Ok(message)
    }

    pub fn to_json(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The class used for limiter lookup. An empty `wrapped` falls back to `class`.
    pub fn effective_class(&self) -> &str {
        self.wrapped
            .as_deref()
            .filter(|wrapped| !wrapped.is_empty())
            .unwrap_or(&self.class)
    }
}
