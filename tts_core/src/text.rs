//! Accumulation of text fragments awaiting synthesis.

/// Ordered, append-only buffer of text fragments for the active session.
///
/// Finalizing consumes the buffer, so a fragment can never be handed to
/// the engine twice; callers replace it with a fresh buffer afterwards.
#[derive(Debug, Default)]
pub struct PendingTextBuffer {
    fragments: Vec<String>,
    len: usize,
}

impl PendingTextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: impl Into<String>) {
        let fragment = fragment.into();
        if fragment.is_empty() {
            return;
        }
        self.len += fragment.len();
        self.fragments.push(fragment);
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Total number of bytes buffered.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn finalize(self) -> FinalizedText {
        FinalizedText {
            fragments: self.fragments,
        }
    }
}

/// A closed buffer, ready to be consumed by one synthesis run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizedText {
    fragments: Vec<String>,
}

impl FinalizedText {
    /// Fragments in submission order.
    pub fn fragments(&self) -> impl Iterator<Item = &str> {
        self.fragments.iter().map(String::as_str)
    }

    /// The ordered concatenation of every fragment.
    pub fn joined(&self) -> String {
        self.fragments().collect()
    }

    /// True when there is nothing worth speaking.
    pub fn is_blank(&self) -> bool {
        self.fragments().all(|f| f.trim().is_empty())
    }

    pub fn len(&self) -> usize {
        self.fragments().map(str::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concatenates_in_order() {
        let mut buffer = PendingTextBuffer::new();
        buffer.push("Hello");
        buffer.push(", ");
        buffer.push("world");
        assert_eq!(buffer.len(), 12);

        let text = buffer.finalize();
        assert_eq!(text.joined(), "Hello, world");
        assert_eq!(text.fragments().collect::<Vec<_>>(), vec!["Hello", ", ", "world"]);
    }

    #[test]
    fn empty_fragments_are_skipped() {
        let mut buffer = PendingTextBuffer::new();
        buffer.push("");
        assert!(buffer.is_empty());
        buffer.push("   ");
        assert!(!buffer.is_empty());
        assert!(buffer.finalize().is_blank());
    }
}
