//! Per-user index lifecycle and answer synthesis.

pub mod manager;
pub mod synth;

pub use manager::{validate_username, Answer, AskOptions, FileOutcome, FileReport, IndexManager, UploadFile, UploadReport};
pub use synth::{build_prompt, OpenAiSynthesizer};
