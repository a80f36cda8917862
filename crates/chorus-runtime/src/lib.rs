//! # chorus-runtime
//!
//! Session-level wiring for the Chorus client.
//!
//! - [`reconciler::ResponseReconciler`]: holds persona text until that
//!   persona's audio starts
//! - [`session::SessionRuntime`]: owns the connection, dispatcher, audio
//!   coordinator and reconciler for one session and publishes
//!   [`events::RuntimeEvent`]s to UI observers
//! - [`errors::RuntimeError`]: start-up failures

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod reconciler;
pub mod session;

pub use errors::{Result, RuntimeError};
pub use events::RuntimeEvent;
pub use reconciler::{ReconcileOutcome, ResponseReconciler};
pub use session::{RuntimeConfig, RuntimeDeps, SessionRuntime, SessionSeed};
