//! Prompt embedding construction.
//!
//! Text goes through the tokenizer session (string in, int64 ids out), gets
//! padded against the negative prompt, and is pushed through the text encoder
//! window by window when it exceeds the tokenizer limit. With guidance
//! enabled, the negative and positive embeddings are concatenated along the
//! batch axis so the UNet evaluates both in one call.

use ndarray::{concatenate, ArrayD, Axis};

use diffusionkit_core::{DiffusionError, Result};

use crate::session::{InputValue, OnnxInferenceParameters, OnnxModelSession};

/// Embedding tensors handed to the UNet.
#[derive(Debug, Clone)]
pub struct PromptEmbeddings {
    /// `[batch, tokens, dim]`; batch is 2 when guidance is enabled.
    pub prompt_embeds: ArrayD<f32>,
    pub pooled_prompt_embeds: Option<ArrayD<f32>>,
    pub negative_pooled: Option<ArrayD<f32>>,
}

impl PromptEmbeddings {
    pub fn batch(&self) -> usize {
        self.prompt_embeds.shape()[0]
    }
}

/// Stateless encoder parameterized by the model set's tokenizer constants.
#[derive(Debug, Clone, Copy)]
pub struct PromptEncoder {
    pub tokenizer_limit: usize,
    pub pad_token_id: i64,
}

impl PromptEncoder {
    pub fn new(tokenizer_limit: usize, pad_token_id: i64) -> Self {
        Self { tokenizer_limit, pad_token_id }
    }

    /// Encodes prompt and negative prompt into guidance-ready embeddings.
    pub async fn encode(
        &self,
        tokenizer: &OnnxModelSession,
        text_encoder: &OnnxModelSession,
        prompt: &str,
        negative_prompt: &str,
        guidance: bool,
    ) -> Result<PromptEmbeddings> {
        let prompt_tokens = self.tokenize(tokenizer, prompt).await?;
        let negative_tokens = self.tokenize(tokenizer, negative_prompt).await?;

        let max_len = prompt_tokens.len().max(negative_tokens.len()).max(self.tokenizer_limit);
        let prompt_tokens = pad_tokens(&prompt_tokens, max_len, self.pad_token_id);
        let negative_tokens = pad_tokens(&negative_tokens, max_len, self.pad_token_id);

        let (positive, pooled) = self.embed(text_encoder, &prompt_tokens).await?;
        if !guidance {
            return Ok(PromptEmbeddings {
                prompt_embeds: positive,
                pooled_prompt_embeds: pooled,
                negative_pooled: None,
            });
        }

        let (negative, negative_pooled) = self.embed(text_encoder, &negative_tokens).await?;
        let prompt_embeds = concatenate(Axis(0), &[negative.view(), positive.view()])
            .map_err(|_| DiffusionError::shape(format!("{:?}", positive.shape()), format!("{:?}", negative.shape())))?;
        Ok(PromptEmbeddings { prompt_embeds, pooled_prompt_embeds: pooled, negative_pooled })
    }

    /// Dual-encoder path: both encoders run on the same token windows, hidden
    /// states concatenate along the last axis, and the pooled vector comes
    /// from the second encoder.
    pub async fn encode_dual(
        &self,
        tokenizer: &OnnxModelSession,
        text_encoder: &OnnxModelSession,
        text_encoder2: &OnnxModelSession,
        prompt: &str,
        negative_prompt: &str,
        guidance: bool,
    ) -> Result<PromptEmbeddings> {
        let first = self.encode(tokenizer, text_encoder, prompt, negative_prompt, guidance).await?;
        let second = self.encode(tokenizer, text_encoder2, prompt, negative_prompt, guidance).await?;
        let prompt_embeds = concatenate(
            Axis(first.prompt_embeds.ndim() - 1),
            &[first.prompt_embeds.view(), second.prompt_embeds.view()],
        )
        .map_err(|_| {
            DiffusionError::shape(
                format!("{:?}", first.prompt_embeds.shape()),
                format!("{:?}", second.prompt_embeds.shape()),
            )
        })?;
        Ok(PromptEmbeddings {
            prompt_embeds,
            pooled_prompt_embeds: second.pooled_prompt_embeds,
            negative_pooled: second.negative_pooled,
        })
    }

    /// Runs the tokenizer session: one string in, int64 token ids out.
    async fn tokenize(&self, tokenizer: &OnnxModelSession, text: &str) -> Result<Vec<i64>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let params = OnnxInferenceParameters::new()
            .add_input(InputValue::Text(vec![text.to_string()]));
        let mut outputs = tokenizer.run_async(params).await?;
        if outputs.is_empty() {
            return Err(DiffusionError::inference("tokenizer", "no output tensor"));
        }
        let ids = outputs.remove(0).into_int64()?;
        Ok(ids.iter().copied().collect())
    }

    /// Pushes padded ids through the text encoder, window by window, and
    /// concatenates the hidden states along the sequence axis.
    async fn embed(
        &self,
        text_encoder: &OnnxModelSession,
        tokens: &[i64],
    ) -> Result<(ArrayD<f32>, Option<ArrayD<f32>>)> {
        let windows = split_windows(tokens, self.tokenizer_limit, self.pad_token_id);
        let mut hidden_states: Vec<ArrayD<f32>> = Vec::with_capacity(windows.len());
        let mut pooled = None;

        for window in &windows {
            let ids: Vec<i32> = window.iter().map(|&id| id as i32).collect();
            let input = ArrayD::from_shape_vec(vec![1, window.len()], ids)
                .map_err(|e| DiffusionError::inference("text-encoder", e))?;
            let params =
                OnnxInferenceParameters::new().add_input(InputValue::Int32(input));
            let mut outputs = text_encoder.run_async(params).await?;
            if outputs.is_empty() {
                return Err(DiffusionError::inference("text-encoder", "no output tensor"));
            }
            let hidden = outputs.remove(0).into_float()?;
            if pooled.is_none() && !outputs.is_empty() {
                pooled = outputs.remove(0).into_float().ok();
            }
            hidden_states.push(hidden);
        }

        let views: Vec<_> = hidden_states.iter().map(|h| h.view()).collect();
        let embeds = concatenate(Axis(1), &views)
            .map_err(|e| DiffusionError::inference("text-encoder", e))?;
        Ok((embeds, pooled))
    }
}

/// Pads `tokens` to `len` with the pad token.
pub(crate) fn pad_tokens(tokens: &[i64], len: usize, pad_token_id: i64) -> Vec<i64> {
    let mut padded = tokens.to_vec();
    padded.resize(len.max(tokens.len()), pad_token_id);
    padded
}

/// Splits ids into consecutive windows of `limit`, padding the last.
pub(crate) fn split_windows(tokens: &[i64], limit: usize, pad_token_id: i64) -> Vec<Vec<i64>> {
    if tokens.len() <= limit {
        return vec![pad_tokens(tokens, limit, pad_token_id)];
    }
    tokens
        .chunks(limit)
        .map(|chunk| pad_tokens(chunk, limit, pad_token_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAD: i64 = 49407;

    #[test]
    fn pad_fills_to_length() {
        let padded = pad_tokens(&[1, 2, 3], 6, PAD);
        assert_eq!(padded, vec![1, 2, 3, PAD, PAD, PAD]);
    }

    #[test]
    fn pad_never_truncates() {
        let padded = pad_tokens(&[1, 2, 3], 2, PAD);
        assert_eq!(padded, vec![1, 2, 3]);
    }

    #[test]
    fn short_prompt_is_a_single_padded_window() {
        let windows = split_windows(&[5, 6], 4, PAD);
        assert_eq!(windows, vec![vec![5, 6, PAD, PAD]]);
    }

    #[test]
    fn long_prompt_chunks_and_pads_the_tail() {
        let tokens: Vec<i64> = (0..10).collect();
        let windows = split_windows(&tokens, 4, PAD);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0], vec![0, 1, 2, 3]);
        assert_eq!(windows[1], vec![4, 5, 6, 7]);
        assert_eq!(windows[2], vec![8, 9, PAD, PAD]);
    }

    #[test]
    fn prompt_and_negative_share_padded_length() {
        // The padding contract from the encoder: both sides padded to
        // max(len_p, len_n, limit).
        let prompt: Vec<i64> = (0..100).collect();
        let negative: Vec<i64> = (0..3).collect();
        let max_len = prompt.len().max(negative.len()).max(77);
        let p = pad_tokens(&prompt, max_len, PAD);
        let n = pad_tokens(&negative, max_len, PAD);
        assert_eq!(p.len(), n.len());
        assert_eq!(p.len(), 100);
        // Both then window into the same number of encoder calls.
        assert_eq!(
            split_windows(&p, 77, PAD).len(),
            split_windows(&n, 77, PAD).len()
        );
    }
}
