//! API Module
//!
//! Chat completion API types.

pub mod completion;

pub use completion::{
    Choice, CompletionRequest, CompletionResponse, ContentPart, ImageUrl, Message, MessageContent,
    Usage,
};
