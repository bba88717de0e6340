use tts_core::{Command, ProtocolError};

/// Maximum length of a single text fragment
const MAX_FRAGMENT_LENGTH: usize = 5000;

/// Validate a parsed control command
pub fn validate_command(command: &Command) -> Result<(), ProtocolError> {
    match command {
        Command::Text { content, .. } => validate_text_fragment(content),
        Command::Synthesize | Command::Cancel | Command::NewSession => Ok(()),
    }
}

/// Validate one text fragment. Empty fragments are accepted (streamed input
/// often sends blank lines) and simply add nothing to the buffer.
pub fn validate_text_fragment(content: &str) -> Result<(), ProtocolError> {
    if content.len() > MAX_FRAGMENT_LENGTH {
        return Err(ProtocolError::Invalid(format!(
            "Text too long (max {} characters)",
            MAX_FRAGMENT_LENGTH
        )));
    }
    if content.chars().any(|c| c == '\0') {
        return Err(ProtocolError::Invalid("Text contains NUL characters".to_string()));
    }
    Ok(())
}
