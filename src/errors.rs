// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Engine
//!
//! `AmqpError` covers every failure the consumer and producer engines can
//! surface: connectivity, topology declaration, publishing and confirmation,
//! acknowledgement, handler failures and lifecycle misuse. Each variant maps
//! to an [`ErrorCode`], which is how callers (and the engines themselves) ask
//! "is this a client-closed error?" without matching on variants.

use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error produced by business handlers.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Numeric classification of an [`AmqpError`].
///
/// The values follow the HTTP status they resemble; engine-specific events
/// use the 5010xxx range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    ClientClosed,
    InternalError,
    ServiceUnavailable,
    GatewayTimeout,
    AckFail,
    NackFail,
    RetryInfinitely,
}

impl ErrorCode {
    pub fn to_int(self) -> i64 {
        match self {
            ErrorCode::InvalidArgument => 400,
            ErrorCode::NotFound => 404,
            ErrorCode::ClientClosed => 499,
            ErrorCode::InternalError => 500,
            ErrorCode::ServiceUnavailable => 503,
            ErrorCode::GatewayTimeout => 504,
            ErrorCode::AckFail => 5010001,
            ErrorCode::NackFail => 5010002,
            ErrorCode::RetryInfinitely => 5010003,
        }
    }
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Invalid or incomplete configuration; never retried
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating or using a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Network-layer failure reported by the transport
    #[error("network error")]
    Network(#[source] std::io::Error),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error registering a consumer tag on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error switching the channel into publisher-confirm mode
    #[error("failure to enable publisher confirms: {0}")]
    ConfirmSelectError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker answered a publish with a negative confirmation
    #[error("message was rejected by the broker")]
    PublishNackedError,

    /// A bounded wait (publish or confirm) elapsed
    #[error("timeout: {0}")]
    GatewayTimeout(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error tearing down the consumer tag or the connection
    #[error("failure to close: {0}")]
    CloseError(String),

    /// The owning engine is shutting down or reconnecting
    #[error("client is closing: {0}")]
    ClientClosing(String),

    /// Lookup of a key that was never registered
    #[error("`{0}` has not been initialized yet")]
    NotFound(String),

    /// `work` was called while a worker is already running
    #[error("the worker of `{0}` is working now")]
    AlreadyWorking(String),

    /// `close` was called on an instance that is already closed
    #[error("`{0}` has been closed")]
    AlreadyClosed(String),

    /// Raised by business handlers to request unbounded retries
    #[error("retry infinitely: {0}")]
    RetryInfinitely(String),

    /// Failure returned by a business handler
    #[error("handler failure")]
    HandlerError(#[source] BoxError),

    /// A business handler panicked
    #[error("handler panicked: {0}")]
    HandlerPanic(String),
}

impl AmqpError {
    /// Wraps any business error into [`AmqpError::HandlerError`].
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        AmqpError::HandlerError(err.into())
    }

    /// Returns the classification code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            AmqpError::ConfigError(_) => ErrorCode::InvalidArgument,
            AmqpError::NotFound(_) => ErrorCode::NotFound,
            AmqpError::ClientClosing(_) => ErrorCode::ClientClosed,
            AmqpError::ConnectionError(_) | AmqpError::ChannelError(_) | AmqpError::Network(_) => {
                ErrorCode::ServiceUnavailable
            }
            AmqpError::GatewayTimeout(_) => ErrorCode::GatewayTimeout,
            AmqpError::AckMessageError(_) => ErrorCode::AckFail,
            AmqpError::NackMessageError(_) => ErrorCode::NackFail,
            AmqpError::RetryInfinitely(_) => ErrorCode::RetryInfinitely,
            _ => ErrorCode::InternalError,
        }
    }

    pub fn is_code(&self, code: ErrorCode) -> bool {
        self.code() == code
    }

    /// True for failures of the connection or channel themselves.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_) | AmqpError::ChannelError(_) | AmqpError::Network(_)
        )
    }
}

impl From<lapin::Error> for AmqpError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::IOError(io) => {
                AmqpError::Network(std::io::Error::new(io.kind(), io.to_string()))
            }
            lapin::Error::InvalidConnectionState(state) => {
                AmqpError::ConnectionError(format!("invalid connection state: {:?}", state))
            }
            lapin::Error::InvalidChannelState(state) => {
                AmqpError::ChannelError(format!("invalid channel state: {:?}", state))
            }
            other => AmqpError::InternalError(other.to_string()),
        }
    }
}
