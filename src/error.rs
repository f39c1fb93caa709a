//! Error types for SetuHub
//!
//! # Error Recovery Strategies
//!
//! ## Fatal Errors (Exit Nonzero)
//!
//! - **`Config`**: The configuration file exists but cannot be parsed. Fix
//!   the file and restart. A *missing* configuration file is not an error;
//!   the hub proceeds with built-in defaults.
//!
//! - **`Schema`** / **`Db`**: The variable definitions file or the
//!   persistent value database failed to parse at startup. The variable set
//!   is fixed at startup, so there is no way to continue.
//!
//! - **`Net`**: Bind or listen failure on the server socket.
//!
//! ## Per-Client Errors (Close the Client, Continue)
//!
//! - **`Framing`**: A peer closed mid-frame, declared an inconsistent
//!   length, or sent an unterminated component. The offending connection is
//!   closed; other clients are unaffected.
//!
//! - **`Io`**: Socket-level read/write failure, including a send that could
//!   not complete within the write timeout (slow consumer). Treated as
//!   normal client attrition.
//!
//! ## Programmer Errors
//!
//! - **`MessageTooLarge`**: An outbound message payload exceeds the 16-bit
//!   length field. Hub-generated messages are bounded by inbound ones, so
//!   this indicates a bug in message construction.

use thiserror::Error;

/// Errors that can occur in the hub
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Variable definitions error: {0}")]
    Schema(String),

    #[error("Variable database error: {0}")]
    Db(String),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Message too large: {0} byte payload exceeds 16-bit length field")]
    MessageTooLarge(usize),

    #[error("Network error: {0}")]
    Net(String),
}

pub type Result<T> = std::result::Result<T, Error>;
