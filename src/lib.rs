pub mod binding;
pub mod cache;
pub mod capabilities;
pub mod client;
pub mod config;
pub mod diff;
pub mod dispatch;
pub mod documents;
pub mod error;
pub mod events;
pub mod logging;
pub mod methods;
pub mod rpc;
pub mod scheduling;

pub use binding::{EndCause, bind_language_client};
pub use client::{DisposeReason, LanguageClient};
pub use config::MutualizerOptions;
pub use error::{Error, ResponseError, Result};
