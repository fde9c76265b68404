//! Translation between the public OpenAI-style schema and the native runtime API.
//!
//! Everything here is pure (no I/O): requests are rewritten before they
//! reach the native handler, and responses or streamed events are reshaped
//! on the way back.

pub mod content;
pub mod models;
pub mod native_types;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;
