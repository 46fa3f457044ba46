//! Byte-level tokenizer with Llama-3 style special tokens.
//!
//! Used with synthetic checkpoints and in tests, where no `tokenizer.json`
//! is available.

use crate::tokenizer::Tokenizer;
use crate::{Error, Result};

const SPECIALS: [&str; 8] = [
    "<|pad|>",
    "<|begin_of_text|>",
    "<|end_of_text|>",
    "<|start_header_id|>",
    "<|end_header_id|>",
    "<|eot_id|>",
    "<|reserved_0|>",
    "<|reserved_1|>",
];

/// Every byte is one token, offset past the special ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    /// Id of the first byte token.
    pub const BYTE_OFFSET: u32 = 8;
    /// Specials plus the 256 byte values.
    pub const VOCAB_SIZE: usize = 264;
    pub const PAD: u32 = 0;
    pub const BOS: u32 = 1;
    pub const EOS: u32 = 2;
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str, add_bos: bool, add_eos: bool) -> Result<Vec<u32>> {
        let mut ids = Vec::with_capacity(text.len() + 2);
        if add_bos {
            ids.push(Self::BOS);
        }
        ids.extend(text.bytes().map(|b| u32::from(b) + Self::BYTE_OFFSET));
        if add_eos {
            ids.push(Self::EOS);
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut bytes = Vec::with_capacity(ids.len());
        for &id in ids {
            if id < Self::BYTE_OFFSET {
                continue;
            }
            let b = u8::try_from(id - Self::BYTE_OFFSET)
                .map_err(|_| Error::Tokenizer(format!("token id {id} outside byte vocab")))?;
            bytes.push(b);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn bos_token_id(&self) -> u32 {
        Self::BOS
    }

    fn eos_token_id(&self) -> u32 {
        Self::EOS
    }

    fn special_token_id(&self, token: &str) -> Option<u32> {
        SPECIALS
            .iter()
            .position(|s| *s == token)
            .and_then(|i| u32::try_from(i).ok())
    }

    fn vocab_size(&self) -> usize {
        Self::VOCAB_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_roundtrip_skips_specials() {
        let tok = ByteTokenizer;
        let ids = tok.encode("Hi", true, true).unwrap();
        assert_eq!(ids, vec![1, 72 + 8, 105 + 8, 2]);
        assert_eq!(tok.decode(&ids).unwrap(), "Hi");
    }

    #[test]
    fn test_special_lookup() {
        let tok = ByteTokenizer;
        assert_eq!(tok.special_token_id("<|eot_id|>"), Some(5));
        assert_eq!(tok.special_token_id("<|start_header_id|>"), Some(3));
        assert_eq!(tok.special_token_id("<nope>"), None);
    }

    #[test]
    fn test_out_of_vocab_decode_fails() {
        assert!(ByteTokenizer.decode(&[9999]).is_err());
    }
}
