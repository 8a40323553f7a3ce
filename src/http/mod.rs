//! HTTP/1.1: parsing, the handler chain and the per-connection I/O task.
//!
//! Each accepted socket is driven by one [`connection::Connection`] task that
//! moves through a small state machine:
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← wait for a complete request
//!        └──────┬──────┘
//!               │ request parsed
//!               ▼
//!        ┌──────────────────┐
//!        │   Processing     │ ← handler chain runs on the executor
//!        └──────┬───────────┘
//!               │ response sealed, or upgrade
//!               ▼
//!        ┌──────────────────┐
//!        │    Writing       │ ── upgrade ──▶ WebSocket / EventSource
//!        └──────┬───────────┘
//!               ├─ keep-alive → Reading
//!               └─ close → Closed
//! ```
//!
//! Handlers never touch the socket. They seal a [`response::NativeResponse`]
//! (or upgrade through [`control::Control`]) and the result travels to the
//! I/O task over a channel.

pub(crate) mod connection;
pub mod control;
pub mod handler;
pub mod headers;
pub mod parser;
pub mod query;
pub mod request;
pub mod response;
pub mod writer;
