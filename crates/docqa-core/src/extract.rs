use std::path::Path;

use crate::error::{Error, Result};
use crate::traits::DocumentExtractor;

/// Decodes plain-text uploads. Other formats are rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

const TEXT_EXTENSIONS: &[&str] = &["txt", "text", "md"];

impl DocumentExtractor for PlainTextExtractor {
    fn extract(&self, bytes: &[u8], declared_filename: &str) -> Result<String> {
        let extension = Path::new(declared_filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        if !TEXT_EXTENSIONS.contains(&extension.as_str()) {
            return Err(Error::UnsupportedFormat {
                filename: declared_filename.to_string(),
                extension: format!(".{extension}"),
            });
        }
        match std::str::from_utf8(bytes) {
            Ok(text) => Ok(text.to_string()),
            Err(_) => Ok(String::from_utf8_lossy(bytes).into_owned()),
        }
    }
}
