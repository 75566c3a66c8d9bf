//! Concrete [`crate::provider::LlmProvider`] implementations.

pub mod http;
pub mod mock;

pub use http::HttpChatProvider;
pub use mock::{ScriptedProvider, ScriptedTurn};
