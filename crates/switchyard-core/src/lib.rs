//! # Switchyard Core
//!
//! Shared building blocks for the dispatch core: configuration, the error
//! taxonomy, inbound message shapes, units of work with their single-fire
//! completion handle, and the session key router.

pub mod completion;
pub mod config;
pub mod error;
pub mod routing;
pub mod types;
pub mod work;

pub use completion::{Completion, Reply, Responder, completion};
pub use config::SwitchyardConfig;
pub use error::{Result, SwitchyardError};
pub use routing::{Route, resolve};
pub use types::{ChatType, MessageSource, SessionKey};
pub use work::{DeliveryPolicy, JobMode, TypingHook, UnitOfWork, WorkKind, WorkPayload};
