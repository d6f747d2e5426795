#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod classify;
pub mod dispatch;
pub mod reconcile;
pub mod runner;
pub mod source;
pub mod store;
pub mod stream;
