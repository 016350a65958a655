//! # Switchyard Gateway
//!
//! Glue between events and the dispatch core, plus the HTTP API.
//!
//! ```text
//! channel adapter / POST /hooks/wake / CronEngine
//!        │
//!        ▼
//!   Dispatcher ── resolve() ──► SessionKey + priority
//!        │
//!        ▼
//!   DispatchQueue ──► PoolExecutor ──► WorkerPool ──► worker process
//!                                         │
//!                         Responder::respond(reply) ◄┘
//! ```

pub mod dispatch;
pub mod executor;
pub mod routes;
pub mod server;

pub use dispatch::{Backpressure, Dispatched, Dispatcher, InboundMessage};
pub use executor::PoolExecutor;
pub use server::{AppState, build_router, start};
