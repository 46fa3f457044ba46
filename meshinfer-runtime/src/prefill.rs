//! Per-user prefill.
//!
//! Each prompt runs through the model on its own, padded to a power of two
//! of at least 128 tokens, so attention sees a clean causal mask over the
//! padded length. The model only projects the 32-row tile holding the last
//! prompt token; the first generated token is the host argmax of that row.

use meshinfer::model::{Model, RotationInputs, TensorOf};
use meshinfer::{
    ChatFormat, ChatMessage, DType, Error, HostData, HostLogits, LayoutOps, MeshControl,
    Profiler, Result, TensorIo, TensorSpec, Tokenizer,
};

use crate::kv_cache::KvCacheManager;
use crate::rope_index::RopeIndex;

/// Shortest padded prefill.
pub const MIN_PREFILL_LEN: usize = 128;
/// Rows of logits the model returns per prefill.
pub const LAST_TOKEN_TILE: usize = 32;

/// Padded length a prompt of `len` tokens is prefilled at.
#[must_use]
pub fn prefill_seq_len(len: usize) -> usize {
    len.next_power_of_two().max(MIN_PREFILL_LEN)
}

/// `(get_last_token, row)`: the tile start passed to the model and the row
/// of the returned tile that holds the last prompt token.
#[must_use]
pub fn last_token_offsets(prompt_len: usize) -> (usize, usize) {
    let last = prompt_len.saturating_sub(1);
    (last / LAST_TOKEN_TILE * LAST_TOKEN_TILE, last % LAST_TOKEN_TILE)
}

/// Cut `tokens` to `cap`. With `closing`, the cut body keeps room for the
/// closing tokens and ends with them. Returns whether anything was cut.
pub fn truncate_prompt(tokens: &mut Vec<u32>, cap: usize, closing: Option<&[u32]>) -> bool {
    if tokens.len() <= cap {
        return false;
    }
    match closing {
        Some(closing) if closing.len() < cap => {
            tokens.truncate(cap - closing.len());
            tokens.extend_from_slice(closing);
        }
        _ => tokens.truncate(cap),
    }
    true
}

/// Tokenize `prompts`, in the chat template when `instruct` is set, and
/// truncate anything longer than `max_prefill_len`.
///
/// # Errors
/// Returns a tokenizer error, or one for an instruct prompt with a
/// tokenizer lacking the chat header tokens.
pub fn encode_prompts<T: Tokenizer + ?Sized, S: AsRef<str>>(
    tokenizer: &T,
    prompts: &[S],
    instruct: bool,
    max_prefill_len: usize,
) -> Result<Vec<Vec<u32>>> {
    let format = if instruct {
        Some(ChatFormat::new(tokenizer)?)
    } else {
        None
    };
    let closing = format.as_ref().map(ChatFormat::closing).transpose()?;
    prompts
        .iter()
        .enumerate()
        .map(|(user, prompt)| -> Result<Vec<u32>> {
            let mut tokens = match &format {
                Some(format) => format.encode_dialog_prompt(&[ChatMessage::user(prompt.as_ref())])?,
                None => tokenizer.encode(prompt.as_ref(), true, false)?,
            };
            let len = tokens.len();
            if truncate_prompt(&mut tokens, max_prefill_len, closing.as_deref()) {
                log::warn!("Prompt of user {user} truncated from {len} to {max_prefill_len} tokens");
            }
            Ok(tokens)
        })
        .collect()
}

/// Reject empty prompts and prompts the KV slot cannot hold.
///
/// # Errors
/// Returns a configuration error naming the user and length.
pub fn check_prompts(prompts: &[Vec<u32>], max_seq_len: usize) -> Result<()> {
    for (user, prompt) in prompts.iter().enumerate() {
        if prompt.is_empty() {
            return Err(Error::config(format!("prompt of user {user} is empty")));
        }
        if prompt.len() > max_seq_len {
            return Err(Error::config(format!(
                "prompt of user {user} has {} tokens, max_seq_len is {max_seq_len}",
                prompt.len()
            )));
        }
    }
    Ok(())
}

/// What prefill hands to the decode loop.
pub struct PrefillOutput {
    /// First generated token of each user.
    pub first_tokens: Vec<u32>,
    /// Prompt length of each user, the position its first decode step writes.
    pub prompt_lens: Vec<usize>,
    /// Logits of each user's last prompt token, `[B, vocab]`.
    pub logits: HostLogits,
}

/// Prefills users one at a time into the shared KV cache.
pub struct PrefillScheduler<'a, M: Model> {
    model: &'a M,
    rope: &'a RopeIndex<M::B>,
    kv: &'a KvCacheManager<M::B>,
    pad_token_id: u32,
}

impl<'a, M: Model> PrefillScheduler<'a, M> {
    #[must_use]
    pub fn new(
        model: &'a M,
        rope: &'a RopeIndex<M::B>,
        kv: &'a KvCacheManager<M::B>,
        pad_token_id: u32,
    ) -> Self {
        Self {
            model,
            rope,
            kv,
            pad_token_id,
        }
    }

    /// Enqueue the prefill of one user and return its `[1, 1, 32, vocab]`
    /// logits tile.
    ///
    /// # Errors
    /// Returns an error if the upload or any kernel fails.
    pub fn prefill_user(&self, user: usize, tokens: &[u32]) -> Result<TensorOf<M>> {
        let args = self.model.args();
        let seq_len = prefill_seq_len(tokens.len());
        let mut padded = tokens.to_vec();
        padded.resize(seq_len, self.pad_token_id);
        let ids = <M::B as TensorIo>::from_host(
            self.model.mesh(),
            &[1, seq_len],
            HostData::U32(padded),
            TensorSpec::new(DType::U32).row_major(),
        )?;
        let x = <M::B as LayoutOps>::reshape(&self.model.embed(&ids)?, &[1, 1, seq_len, args.dim])?;
        let (cos, sin) = self.rope.get_prefill_rot_mats(seq_len)?;
        let rot = RotationInputs {
            cos: &cos,
            sin: &sin,
            trans_mat: self.rope.get_prefill_trans_mats(),
        };
        let (get_last_token, _) = last_token_offsets(tokens.len());
        self.model.prefill_forward(
            &x,
            &rot,
            user,
            self.kv.page_table(),
            self.kv.per_layer_handles(),
            get_last_token,
        )
    }

    /// Prefill every user and pick their first tokens.
    ///
    /// User 0 is timed as `compile_prefill`, the rest as
    /// `inference_prefill`. With a single user and `profile` set, user 0 is
    /// run a second time so `inference_prefill` has a warm measurement.
    ///
    /// # Errors
    /// Returns a configuration error for an empty or oversized prompt, or
    /// the first kernel error.
    pub fn run(
        &self,
        prompts: &[Vec<u32>],
        max_seq_len: usize,
        profile: bool,
        profiler: &mut Profiler,
    ) -> Result<PrefillOutput> {
        check_prompts(prompts, max_seq_len)?;
        let Some(first) = prompts.first() else {
            return Err(Error::config("no prompts to prefill"));
        };
        let mesh = self.model.mesh();
        let batch = prompts.len();
        let mut tiles = Vec::with_capacity(batch);

        profiler.start("compile_prefill", None);
        tiles.push(self.prefill_user(0, first)?);
        mesh.synchronize()?;
        profiler.end("compile_prefill", None);

        profiler.start("inference_prefill", None);
        if batch == 1 && profile {
            tiles[0] = self.prefill_user(0, first)?;
        }
        for (user, prompt) in prompts.iter().enumerate().skip(1) {
            tiles.push(self.prefill_user(user, prompt)?);
        }
        mesh.synchronize()?;
        profiler.end("inference_prefill", None);

        let vocab = self.model.args().vocab_size;
        let mut rows = Vec::with_capacity(batch * vocab);
        for (tile, prompt) in tiles.iter().zip(prompts) {
            let data = <M::B as TensorIo>::to_host(tile)?.into_f32()?;
            let (_, row) = last_token_offsets(prompt.len());
            rows.extend_from_slice(&data[row * vocab..(row + 1) * vocab]);
        }
        let logits = HostLogits::new(rows, vocab)?;
        let first_tokens = (0..batch).map(|user| logits.argmax(user)).collect();
        log::info!(
            "Prefilled {batch} users in {:.3}s ({:.3}s compile)",
            profiler.seconds("inference_prefill", None) + profiler.seconds("compile_prefill", None),
            profiler.seconds("compile_prefill", None)
        );
        Ok(PrefillOutput {
            first_tokens,
            prompt_lens: prompts.iter().map(Vec::len).collect(),
            logits,
        })
    }
}

#[cfg(test)]
mod tests {
    use meshinfer::{ByteTokenizer, ErrorKind};

    use super::*;

    #[test]
    fn test_padded_length() {
        assert_eq!(prefill_seq_len(1), 128);
        assert_eq!(prefill_seq_len(128), 128);
        assert_eq!(prefill_seq_len(129), 256);
        assert_eq!(prefill_seq_len(60_000), 65_536);
    }

    #[test]
    fn test_last_token_tile() {
        assert_eq!(last_token_offsets(1), (0, 0));
        assert_eq!(last_token_offsets(32), (0, 31));
        assert_eq!(last_token_offsets(33), (32, 0));
        assert_eq!(last_token_offsets(100), (96, 3));
    }

    #[test]
    fn test_truncate_keeps_closing() {
        let mut raw: Vec<u32> = (0..10).collect();
        assert!(truncate_prompt(&mut raw, 6, None));
        assert_eq!(raw, vec![0, 1, 2, 3, 4, 5]);

        let mut chat: Vec<u32> = (0..10).collect();
        assert!(truncate_prompt(&mut chat, 6, Some(&[90, 91])));
        assert_eq!(chat, vec![0, 1, 2, 3, 90, 91]);

        let mut short = vec![1, 2];
        assert!(!truncate_prompt(&mut short, 6, Some(&[90])));
    }

    #[test]
    fn test_instruct_prompt_truncation() {
        let tok = ByteTokenizer;
        let closing = ChatFormat::new(&tok).unwrap().closing().unwrap();
        let long = "x".repeat(200);
        let prompts = encode_prompts(&tok, &[long.as_str(), "hi"], true, 64).unwrap();
        assert_eq!(prompts[0].len(), 64);
        assert!(prompts[0].ends_with(&closing));
        assert!(prompts[1].len() < 64);
        assert!(prompts[1].ends_with(&closing));

        let raw = encode_prompts(&tok, &["hi"], false, 64).unwrap();
        assert_eq!(raw[0], vec![ByteTokenizer::BOS, 104 + 8, 105 + 8]);
    }

    #[test]
    fn test_bad_prompt_lengths() {
        let err = check_prompts(&[vec![1], vec![]], 16).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("user 1"));
        let err = check_prompts(&[vec![0; 17]], 16).unwrap_err();
        assert!(err.to_string().contains("17"));
        assert!(check_prompts(&[vec![0; 16]], 16).is_ok());
    }
}
