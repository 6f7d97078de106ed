//! Error types for the order dispatch service

use thiserror::Error;

/// Dispatch-specific error types
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Request failed validation; never retried
    #[error("Validation error: {message}")]
    Validation {
        /// Detailed validation error message
        message: String,
    },

    /// Transaction or storage failure
    #[error("Persistence error: {0:#}")]
    Persistence(#[from] anyhow::Error),

    /// The stored order id sequence is corrupted
    #[error("Dirty data in order id sequence: {order_id}")]
    DirtyData {
        /// The latest stored order id whose suffix failed to parse
        order_id: String,
    },

    /// No order stored under the given external id
    #[error("Order not found: {external_id}")]
    OrderNotFound {
        /// Client-supplied order id
        external_id: String,
    },

    /// Status change would move an order backwards
    #[error("Order {order_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// System order id
        order_id: String,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Publish buffer stayed full past the enqueue timeout
    #[error("Queue busy: buffer full for {waited_ms}ms")]
    QueueBusy {
        /// How long the producer waited
        waited_ms: u64,
    },

    /// The sender loop is gone and nothing drains the buffer
    #[error("Queue closed")]
    QueueClosed,

    /// All publish attempts failed; the message was dropped
    #[error("Publish failed after {attempts} attempts: {reason}")]
    QueuePublishFailed {
        /// Number of attempts made
        attempts: u32,
        /// Last failure
        reason: String,
    },

    /// Broker connection, channel or declare failure
    #[error("Broker error: {0}")]
    Broker(String),

    /// JSON encoding or decoding failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No courier endpoint configured
    #[error("No courier endpoint configured")]
    Unconfigured,

    /// Configured courier endpoint is not a valid url
    #[error("Configured courier url {url} is invalid")]
    InvalidEndpoint {
        /// The offending url
        url: String,
    },

    /// Courier endpoint could not be reached
    #[error("Courier call failed: {0}")]
    CourierTransport(#[from] reqwest::Error),

    /// Courier answered with a non-success status
    #[error("Courier rejected order with status {status}: {body}")]
    CourierRejected {
        /// HTTP status code
        status: u16,
        /// Response body text
        body: String,
    },

    /// A handler or detached task terminated abnormally
    #[error("Handler panicked in {context}: {message}")]
    HandlerPanic {
        /// Which unit of work panicked
        context: String,
        /// Panic payload rendered as text
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration {
        /// Configuration error message detailing what went wrong
        message: String,
    },
}

impl DispatchError {
    /// Build a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Build a panic error from a caught panic payload
    pub fn from_panic(context: impl Into<String>, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };

        Self::HandlerPanic {
            context: context.into(),
            message,
        }
    }
}

/// Type alias for dispatch results
pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_payload_rendering() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let err = DispatchError::from_panic("cooking", payload.as_ref());
        assert_eq!(err.to_string(), "Handler panicked in cooking: boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned boom"));
        let err = DispatchError::from_panic("handler", payload.as_ref());
        assert!(err.to_string().contains("owned boom"));

        let payload: Box<dyn std::any::Any + Send> = Box::new(42_u8);
        let err = DispatchError::from_panic("handler", payload.as_ref());
        assert!(err.to_string().contains("unknown panic"));
    }

    #[test]
    fn test_persistence_error_keeps_context_chain() {
        let err: DispatchError = anyhow::anyhow!("connection reset")
            .context("save order")
            .into();
        let rendered = err.to_string();
        assert!(rendered.contains("save order"));
        assert!(rendered.contains("connection reset"));
    }
}
