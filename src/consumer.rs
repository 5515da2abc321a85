use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Error surfaced by a consumer while executing a task.
///
/// `code` carries the application-defined error code that retry decisions
/// key on; `retryable` marks the error as a candidate for retry at all.
/// Whether a retryable error is actually retried is up to the consumer's
/// `can_retry` and the retry budget.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
#[error("{error_type}: {message}")]
pub struct TaskError {
    pub error_type: String,
    pub message: String,
    pub code: Option<String>,
    pub data: Option<JsonValue>,
    pub retryable: bool,
}

impl TaskError {
    /// Create a general task error with a custom message.
    pub fn new(message: &str) -> Self {
        Self {
            error_type: "TaskError".to_string(),
            message: message.to_string(),
            code: None,
            data: None,
            retryable: false,
        }
    }

    pub fn execution_failed(message: &str) -> Self {
        Self {
            error_type: "ExecutionError".to_string(),
            message: message.to_string(),
            code: None,
            data: None,
            retryable: false,
        }
    }

    /// Create a retryable error carrying an application error code.
    pub fn retryable(code: &str, message: &str) -> Self {
        Self {
            error_type: "RetryableError".to_string(),
            message: message.to_string(),
            code: Some(code.to_string()),
            data: None,
            retryable: true,
        }
    }

    pub fn with_error_type(mut self, error_type: &str) -> Self {
        self.error_type = error_type.to_string();
        self
    }

    pub fn with_error_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Error code used for retry decisions; falls back to the error type
    /// when no explicit code was set.
    pub fn retry_code(&self) -> &str {
        self.code.as_deref().unwrap_or(&self.error_type)
    }
}

/// A registered handler that executes tasks of one consumer id.
///
/// The payload arrives as the opaque JSON it was persisted as; decoding it
/// back into a concrete type is the consumer's business.
#[async_trait]
pub trait TaskConsumer: Send + Sync {
    /// Human-readable label for logs.
    fn task_name(&self) -> &str;

    /// Do the work. The returned string is recorded as the task's response.
    async fn accept(&self, principal: &str, payload: &JsonValue) -> Result<String, TaskError>;

    /// Produce a human-readable failure summary for a terminal failure.
    fn on_error(&self, error_code: &str, error: &TaskError) -> String {
        format!("{} failed [{}]: {}", self.task_name(), error_code, error)
    }

    /// Whether this specific error code may be retried. Defaults to no.
    fn can_retry(&self, _error_code: &str, _error: &TaskError) -> bool {
        false
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate consumer registered for id '{0}'")]
    Duplicate(String),

    #[error("no consumer registered for id '{0}'")]
    Unknown(String),
}

/// Registry of consumers (consumer_id -> handler).
///
/// Built during initialization, immutable at runtime; looked up by plain
/// key access instead of any container machinery.
#[derive(Default)]
pub struct ConsumerRegistry {
    consumers: HashMap<String, Arc<dyn TaskConsumer>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self {
            consumers: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        consumer_id: &str,
        consumer: Arc<dyn TaskConsumer>,
    ) -> Result<(), RegistryError> {
        if self.consumers.contains_key(consumer_id) {
            return Err(RegistryError::Duplicate(consumer_id.to_string()));
        }
        self.consumers.insert(consumer_id.to_string(), consumer);
        Ok(())
    }

    pub fn get(&self, consumer_id: &str) -> Result<Arc<dyn TaskConsumer>, RegistryError> {
        self.consumers
            .get(consumer_id)
            .cloned()
            .ok_or_else(|| RegistryError::Unknown(consumer_id.to_string()))
    }

    pub fn contains(&self, consumer_id: &str) -> bool {
        self.consumers.contains_key(consumer_id)
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}
