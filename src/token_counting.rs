//! Token Counting Utility
//!
//! The pipeline only ever needs token *lengths*: for trimming history against the
//! context window, for the pre-flight usage estimate, and for the terminal count
//! after a stream ends. A real BPE can be plugged in through [`Tokenizer`].

/// Tokenizer capability. Tokens are never decoded.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;

    fn count(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}

/// Heuristic tokenizer: words are split into pieces of at most four bytes,
/// punctuation is one token each, whitespace is folded into the next piece.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenizer;

const PIECE_BYTES: usize = 4;

impl HeuristicTokenizer {
    fn piece_id(piece: &str) -> u32 {
        // FNV-1a, folded to u32
        let mut hash: u32 = 0x811c_9dc5;
        for b in piece.bytes() {
            hash ^= b as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash
    }
}

impl Tokenizer for HeuristicTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        let mut tokens = Vec::with_capacity(text.len() / 3 + 1);
        let mut word = String::new();

        let flush = |word: &mut String, tokens: &mut Vec<u32>| {
            if word.is_empty() {
                return;
            }
            let mut piece = String::new();
            for ch in word.chars() {
                if piece.len() + ch.len_utf8() > PIECE_BYTES && !piece.is_empty() {
                    tokens.push(Self::piece_id(&piece));
                    piece.clear();
                }
                piece.push(ch);
            }
            if !piece.is_empty() {
                tokens.push(Self::piece_id(&piece));
            }
            word.clear();
        };

        for ch in text.chars() {
            if ch.is_alphanumeric() || ch == '_' {
                word.push(ch);
            } else if ch.is_whitespace() {
                flush(&mut word, &mut tokens);
            } else {
                flush(&mut word, &mut tokens);
                let mut buf = [0u8; 4];
                tokens.push(Self::piece_id(ch.encode_utf8(&mut buf)));
            }
        }
        flush(&mut word, &mut tokens);

        tokens
    }
}

/// Token count for a list of (role, content) messages, with per-message overhead.
pub fn estimate_messages_tokens<'a, I>(tokenizer: &dyn Tokenizer, messages: I) -> usize
where
    I: IntoIterator<Item = &'a str>,
{
    messages
        .into_iter()
        .map(|content| tokenizer.count(content) + 4)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_has_no_tokens() {
        assert_eq!(HeuristicTokenizer.count(""), 0);
        assert_eq!(HeuristicTokenizer.count("   \n\t"), 0);
    }

    #[test]
    fn test_token_estimation_is_reasonable() {
        let text = "Hello, how are you doing today?";
        let count = HeuristicTokenizer.count(text);
        assert!(count >= 6, "got {}", count);
        assert!(count < text.len(), "got {}", count);
    }

    #[test]
    fn test_long_words_split_into_pieces() {
        // 12 bytes -> 3 pieces
        assert_eq!(HeuristicTokenizer.count("abcdefghijkl"), 3);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let a = HeuristicTokenizer.encode("fn main() {}");
        let b = HeuristicTokenizer.encode("fn main() {}");
        assert_eq!(a, b);
    }

    #[test]
    fn test_message_estimate_adds_overhead() {
        // "hi" -> 1 piece, "there" -> "ther" + "e"
        let est = estimate_messages_tokens(&HeuristicTokenizer, ["hi", "there"]);
        assert_eq!(est, 3 + 8);
    }
}
