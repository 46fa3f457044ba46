//! Model trait for batched generation
//!
//! Defines the interface a transformer implementation must satisfy to be
//! driven by the generation engine. A model is a fixed sequence of Kernel
//! Runtime calls; it owns its weights and nothing else. KV slabs, the page
//! table and the rotary inputs are owned by the engine and passed in.

use crate::backend::{Backend, KernelRuntime};
use crate::model_args::ModelArgs;
use crate::Result;

/// Device tensor type of a model's backend.
pub type TensorOf<M> = <<M as Model>::B as Backend>::Tensor;

/// One layer's key and value slabs.
#[derive(Clone)]
pub struct LayerKvCache<T> {
    pub k: T,
    pub v: T,
}

/// Rotary inputs for one forward call.
///
/// For prefill `cos`/`sin` are `[1, 1, S, head_dim]`; for decode they are
/// `[1, B, 1, head_dim]`, one row per user. `trans_mat` is the
/// `[1, 1, head_dim, head_dim]` rotation basis.
pub struct RotationInputs<'a, T> {
    pub cos: &'a T,
    pub sin: &'a T,
    pub trans_mat: &'a T,
}

/// Trait for models that can be driven by the generation engine.
pub trait Model {
    type B: KernelRuntime;

    /// Immutable hyper-parameters.
    fn args(&self) -> &ModelArgs;

    /// Mesh the weights live on.
    fn mesh(&self) -> &<Self::B as Backend>::Mesh;

    /// Embedding lookup for `U32` token ids of any shape; appends a `dim` axis.
    ///
    /// # Errors
    /// Returns an error if the lookup cannot be enqueued.
    fn embed(&self, tokens: &TensorOf<Self>) -> Result<TensorOf<Self>>;

    /// Prefill one user.
    ///
    /// `x` is the embedded, padded prompt `[1, 1, S, dim]`. Every layer's
    /// keys and values for positions `0..S` are written to the slot of
    /// `user_id`. Only the 32 rows starting at `get_last_token` pass through
    /// the output head: returns `[1, 1, 32, vocab]` logits sharded along the
    /// vocab dim.
    ///
    /// # Errors
    /// Returns an error if any kernel call fails.
    #[allow(clippy::too_many_arguments)]
    fn prefill_forward(
        &self,
        x: &TensorOf<Self>,
        rot: &RotationInputs<'_, TensorOf<Self>>,
        user_id: usize,
        page_table: Option<&TensorOf<Self>>,
        kv_cache: &[LayerKvCache<TensorOf<Self>>],
        get_last_token: usize,
    ) -> Result<TensorOf<Self>>;

    /// One decode step for the whole batch.
    ///
    /// `x` is the embedded `[1, 1, B, dim]` batch in the decode residual
    /// memory config and `cur_pos` the `[B]` `I32` positions of those tokens.
    /// The call sequence is fixed so it can be captured into a trace.
    /// Returns `[1, 1, B, vocab]` logits sharded along the vocab dim.
    ///
    /// # Errors
    /// Returns an error if any kernel call fails.
    fn decode_forward(
        &self,
        x: &TensorOf<Self>,
        cur_pos: &TensorOf<Self>,
        rot: &RotationInputs<'_, TensorOf<Self>>,
        page_table: Option<&TensorOf<Self>>,
        kv_cache: &[LayerKvCache<TensorOf<Self>>],
    ) -> Result<TensorOf<Self>>;
}
