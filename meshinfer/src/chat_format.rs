//! Llama 3 instruct prompt formatting at the token level.
//!
//! Format:
//! ```text
//! <|begin_of_text|><|start_header_id|>system<|end_header_id|>
//!
//! {content}<|eot_id|><|start_header_id|>user<|end_header_id|>
//!
//! {content}<|eot_id|><|start_header_id|>assistant<|end_header_id|>
//!
//!
//! ```
//!
//! Working on ids rather than strings lets the prefill scheduler truncate the
//! body of a prompt and re-append the closing header without re-tokenizing
//! special tokens.

use crate::tokenizer::Tokenizer;
use crate::{Error, Result};

/// A chat message in the `OpenAI` messages format.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// Role of the message sender (`"system"`, `"user"`, `"assistant"`).
    pub role: String,
    /// Content of the message.
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }
}

/// Splices Llama 3 role headers around encoded messages.
pub struct ChatFormat<'a, T: Tokenizer + ?Sized> {
    tokenizer: &'a T,
    start_header: u32,
    end_header: u32,
    eot: u32,
}

impl<'a, T: Tokenizer + ?Sized> ChatFormat<'a, T> {
    /// # Errors
    /// Returns an error if the tokenizer lacks the Llama 3 header tokens.
    pub fn new(tokenizer: &'a T) -> Result<Self> {
        let special = |name: &str| {
            tokenizer
                .special_token_id(name)
                .ok_or_else(|| Error::Tokenizer(format!("tokenizer has no {name} token")))
        };
        Ok(Self {
            tokenizer,
            start_header: special("<|start_header_id|>")?,
            end_header: special("<|end_header_id|>")?,
            eot: special("<|eot_id|>")?,
        })
    }

    /// `<|start_header_id|>{role}<|end_header_id|>\n\n`
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn encode_header(&self, role: &str) -> Result<Vec<u32>> {
        let mut ids = vec![self.start_header];
        ids.extend(self.tokenizer.encode(role, false, false)?);
        ids.push(self.end_header);
        ids.extend(self.tokenizer.encode("\n\n", false, false)?);
        Ok(ids)
    }

    /// Header, trimmed content, `<|eot_id|>`.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn encode_message(&self, message: &ChatMessage) -> Result<Vec<u32>> {
        let mut ids = self.encode_header(&message.role)?;
        ids.extend(self.tokenizer.encode(message.content.trim(), false, false)?);
        ids.push(self.eot);
        Ok(ids)
    }

    /// Full dialog followed by an open assistant header.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn encode_dialog_prompt(&self, messages: &[ChatMessage]) -> Result<Vec<u32>> {
        let mut ids = vec![self.tokenizer.bos_token_id()];
        for message in messages {
            ids.extend(self.encode_message(message)?);
        }
        ids.extend(self.encode_header("assistant")?);
        Ok(ids)
    }

    /// Tokens opening a single user turn: BOS and the user header.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn user_prefix(&self) -> Result<Vec<u32>> {
        let mut ids = vec![self.tokenizer.bos_token_id()];
        ids.extend(self.encode_header("user")?);
        Ok(ids)
    }

    /// Tokens closing a user turn and opening the assistant's.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn closing(&self) -> Result<Vec<u32>> {
        let mut ids = vec![self.eot];
        ids.extend(self.encode_header("assistant")?);
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::ByteTokenizer;

    #[test]
    fn test_single_user_prompt_layout() {
        let tok = ByteTokenizer;
        let fmt = ChatFormat::new(&tok).unwrap();
        let ids = fmt
            .encode_dialog_prompt(&[ChatMessage::user("  hi ")])
            .unwrap();
        let mut expected = fmt.user_prefix().unwrap();
        expected.extend(tok.encode("hi", false, false).unwrap());
        expected.extend(fmt.closing().unwrap());
        assert_eq!(ids, expected);
        assert_eq!(ids[0], ByteTokenizer::BOS);
    }

    #[test]
    fn test_system_then_user() {
        let tok = ByteTokenizer;
        let fmt = ChatFormat::new(&tok).unwrap();
        let ids = fmt
            .encode_dialog_prompt(&[ChatMessage::system("s"), ChatMessage::user("u")])
            .unwrap();
        let eot = tok.special_token_id("<|eot_id|>").unwrap();
        assert_eq!(ids.iter().filter(|&&t| t == eot).count(), 2);
        assert_eq!(tok.decode(&ids).unwrap(), "system\n\nsuser\n\nuassistant\n\n");
    }
}
