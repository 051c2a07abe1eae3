//! Text tokenizer trait

use crate::Result;

/// SentencePiece word-boundary marker, rendered as a space in outbound text
pub const WORD_MARKER: char = '\u{2581}';

/// Text tokenizer used for prompts and for rendering generated text tokens
pub trait TextTokenizer: Send + Sync + 'static {
    /// Encode text into token ids (no special tokens added)
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Raw vocabulary piece for a token id
    fn id_to_piece(&self, id: u32) -> Option<String>;

    /// Piece with the word marker replaced by a space, ready to send to clients
    fn render_piece(&self, id: u32) -> Option<String> {
        self.id_to_piece(id)
            .map(|piece| piece.replace(WORD_MARKER, " "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedVocab;

    impl TextTokenizer for FixedVocab {
        fn encode(&self, _text: &str) -> Result<Vec<u32>> {
            Ok(vec![])
        }

        fn id_to_piece(&self, id: u32) -> Option<String> {
            match id {
                1 => Some("\u{2581}hello".to_string()),
                2 => Some("lo".to_string()),
                _ => None,
            }
        }
    }

    #[test]
    fn test_render_piece_replaces_word_marker() {
        assert_eq!(FixedVocab.render_piece(1).as_deref(), Some(" hello"));
        assert_eq!(FixedVocab.render_piece(2).as_deref(), Some("lo"));
        assert_eq!(FixedVocab.render_piece(9), None);
    }
}
