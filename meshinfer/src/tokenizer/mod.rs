//! Tokenizer integration
//!
//! Defines the [`Tokenizer`] trait and concrete implementations.

mod byte_tokenizer;
mod hf_tokenizer;

use crate::Result;

pub use byte_tokenizer::ByteTokenizer;
pub use hf_tokenizer::HfTokenizer;

/// Trait for tokenizers that convert between text and token IDs.
///
/// The generator uses this trait to handle text in/out and the chat
/// formatter uses [`Tokenizer::special_token_id`] to splice role headers.
pub trait Tokenizer {
    /// Encode text to token IDs.
    ///
    /// # Arguments
    /// * `text` - The text to encode
    /// * `add_bos` - Whether to prepend the beginning-of-sequence token
    /// * `add_eos` - Whether to append the end-of-sequence token
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    fn encode(&self, text: &str, add_bos: bool, add_eos: bool) -> Result<Vec<u32>>;

    /// Decode token IDs to text. Special tokens are skipped.
    ///
    /// # Errors
    /// Returns an error if decoding fails.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Get the beginning-of-sequence token ID.
    fn bos_token_id(&self) -> u32;

    /// Get the end-of-sequence token ID.
    fn eos_token_id(&self) -> u32;

    /// Look up a special token such as `<|eot_id|>`.
    fn special_token_id(&self, token: &str) -> Option<u32>;

    /// Number of ids the tokenizer can produce.
    fn vocab_size(&self) -> usize;
}
