//! Typed error kinds for the bridge's components. These converge on
//! `anyhow::Error` at the Engine/`main` boundary; see DESIGN.md.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransactorError {
    #[error("serial port not open")]
    NotOpen,
    #[error("timed out waiting for reply")]
    Timeout,
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("not connected")]
    NotConnected,
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("receive failed: {0}")]
    ReceiveFailed(String),
}

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed state document: {0}")]
    Malformed(String),
}
