//! Presentation-facing commands. Errors are flattened to strings for the UI.

pub mod chat;
pub mod settings;
