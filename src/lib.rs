#![forbid(unsafe_code)]

//! Unattended republishing: search a source platform by keyword, send each new
//! video through a remote subtitle/dubbing service, generate localized
//! metadata, upload the result, and remember what was done.

pub mod config;
pub mod discovery;
pub mod duplicate;
pub mod error;
pub mod history;
pub mod metadata;
pub mod pipeline;
pub mod preflight;
pub mod processing;
pub mod publisher;
pub mod retry;

#[cfg(test)]
mod test_support;
