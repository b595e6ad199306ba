pub mod clipboard;
pub mod collections;
pub mod dispatch;
pub mod drafts;
pub mod editor;
pub mod error;
pub mod filters;
pub mod http;
pub mod metadata;
pub mod query;
pub mod selection;
pub mod service;
pub mod session;
pub mod settings;

#[cfg(feature = "desktop")]
mod shell;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{Error, RemoteError, Result, ValidationError};

#[cfg(feature = "desktop")]
pub use shell::run;
