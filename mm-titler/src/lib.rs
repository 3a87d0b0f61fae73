//! Title generation for archived conversations.
//!
//! Pure HTTP clients behind one `Summarizer` trait: an external title service
//! or an OpenAI-compatible endpoint.

mod client;
mod error;
mod openai;
mod types;

pub use client::{HttpSummarizer, Provider, Summarizer};
pub use error::{Result, TitleError};
pub use openai::{DEFAULT_OPENAI_BASE_URL, OpenAiSummarizer};
pub use types::{DialogueTurn, TitleReply, TranscriptLine, TranscriptSender, dialogue_from};
