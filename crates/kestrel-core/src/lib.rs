//! # Kestrel Core
//!
//! Types shared by every stage of the Kestrel query pipeline.
//!
//! ## Features
//!
//! - [`Client`]: the envelope carrying a request, its current question and the
//!   response built so far
//! - [`QueryHandler`] and [`Resolver`]: the two stage traits
//! - [`ResolverChain`]: ordered resolver stages that stop at the first
//!   conclusive response
//! - Message helpers for rrset handling and response classification

use thiserror::Error;

pub mod client;
pub mod handler;
pub mod message;

pub use client::{Client, QueryKey};
pub use handler::{QueryHandler, Resolver, ResolverChain};
pub use message::{classify_response, ResponseCategory};

/// Name of the view every deployment has.
pub const DEFAULT_VIEW: &str = "default";

/// Core errors.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("request has no question")]
    MissingQuestion,
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
