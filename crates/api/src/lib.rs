// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps LedgerError
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Resell API Library
//!
//! HTTP surface the chat adapter talks to. The adapter authenticates with a
//! shared key and forwards each button press or message as a dialogue input.

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

pub use auth::ChatUser;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
