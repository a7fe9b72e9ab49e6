//! LLM Backend Integration
//!
//! Inference backends the worker calls to answer tasks, behind the
//! [`LlmBackend`] trait.
//!
//! # Available Backends
//!
//! - **llama.cpp**: local HTTP server (`/completion`)
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::backend::{BackendConfig, LlamaCppBackend, LlmBackend, LlmRequest};
//!
//! let backend = LlamaCppBackend::new(BackendConfig::default());
//! let rx = backend.generate_stream(&LlmRequest::new("Hello!").with_stream(true)).await?;
//! ```

mod llama_cpp;
mod traits;

pub use llama_cpp::LlamaCppBackend;
pub use traits::{BackendConfig, LlmBackend, LlmRequest, LlmResponse, StreamingToken};
