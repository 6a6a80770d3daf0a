//! Tokenization and micro-batch collation

use tch::{Device, Kind, Tensor};

use super::{ChatTokenizer, DataResult, FormattedExample};
use crate::constants::IGNORE_INDEX;

/// Token ids for one training example. Labels equal the inputs; the loss
/// shifts them by one position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedExample {
    pub input_ids: Vec<i64>,
}

impl EncodedExample {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Model inputs for one micro-batch, right padded to the longest sequence
#[derive(Debug)]
pub struct Batch {
    /// [batch, seq] int64
    pub input_ids: Tensor,
    /// [batch, seq] int64, 1 for real tokens
    pub attention_mask: Tensor,
    /// [batch, seq] int64, `IGNORE_INDEX` on padding
    pub labels: Tensor,
    /// Non-padding token count
    pub tokens: usize,
}

/// Tokenize with special tokens and truncate to `max_seq_length`.
///
/// Sequences shorter than two tokens carry no next-token target and are dropped.
pub fn encode_examples(
    tokenizer: &ChatTokenizer,
    examples: &[FormattedExample],
    max_seq_length: usize,
) -> DataResult<Vec<EncodedExample>> {
    let mut encoded = Vec::with_capacity(examples.len());
    let mut truncated = 0usize;

    for (idx, example) in examples.iter().enumerate() {
        let mut ids = tokenizer.encode(&example.text, true)?;
        if ids.len() > max_seq_length {
            ids.truncate(max_seq_length);
            truncated += 1;
        }
        if ids.len() < 2 {
            tracing::warn!("Example {} has fewer than two tokens, skipping", idx);
            continue;
        }
        encoded.push(EncodedExample {
            input_ids: ids.into_iter().map(i64::from).collect(),
        });
    }

    if truncated > 0 {
        tracing::info!(
            "{} of {} examples truncated to {} tokens",
            truncated,
            examples.len(),
            max_seq_length
        );
    }
    Ok(encoded)
}

/// Stack examples into padded tensors on `device`
pub fn collate(batch: &[&EncodedExample], pad_id: i64, device: Device) -> DataResult<Batch> {
    let max_len = batch.iter().map(|e| e.len()).max().unwrap_or(0);
    let rows = batch.len();

    let mut ids = Vec::with_capacity(rows * max_len);
    let mut mask = Vec::with_capacity(rows * max_len);
    let mut labels = Vec::with_capacity(rows * max_len);
    let mut tokens = 0usize;

    for example in batch {
        let pad = max_len - example.len();
        ids.extend_from_slice(&example.input_ids);
        labels.extend_from_slice(&example.input_ids);
        mask.extend(std::iter::repeat(1i64).take(example.len()));
        ids.extend(std::iter::repeat(pad_id).take(pad));
        labels.extend(std::iter::repeat(IGNORE_INDEX).take(pad));
        mask.extend(std::iter::repeat(0i64).take(pad));
        tokens += example.len();
    }

    let shape = [rows as i64, max_len as i64];
    let to_tensor = |data: &[i64]| -> DataResult<Tensor> {
        Ok(Tensor::f_from_slice(data)?
            .f_view(shape)?
            .f_to_kind(Kind::Int64)?
            .f_to_device(device)?)
    };

    Ok(Batch {
        input_ids: to_tensor(&ids)?,
        attention_mask: to_tensor(&mask)?,
        labels: to_tensor(&labels)?,
        tokens,
    })
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_collate_pads_right() {
        let a = EncodedExample { input_ids: vec![5, 6, 7] };
        let b = EncodedExample { input_ids: vec![8, 9] };
        let batch = collate(&[&a, &b], 0, Device::Cpu).expect("test: collate");

        assert_eq!(batch.input_ids.size(), vec![2, 3]);
        assert_eq!(batch.tokens, 5);

        let ids = Vec::<i64>::try_from(batch.input_ids.view([-1])).expect("test: ids");
        let mask = Vec::<i64>::try_from(batch.attention_mask.view([-1])).expect("test: mask");
        let labels = Vec::<i64>::try_from(batch.labels.view([-1])).expect("test: labels");
        assert_eq!(ids, vec![5, 6, 7, 8, 9, 0]);
        assert_eq!(mask, vec![1, 1, 1, 1, 1, 0]);
        assert_eq!(labels, vec![5, 6, 7, 8, 9, IGNORE_INDEX]);
    }

    #[test]
    fn test_collate_single_example_has_no_padding() {
        let a = EncodedExample { input_ids: vec![1, 2, 3, 4] };
        let batch = collate(&[&a], 99, Device::Cpu).expect("test: collate");
        let labels = Vec::<i64>::try_from(batch.labels.view([-1])).expect("test: labels");
        assert_eq!(labels, vec![1, 2, 3, 4]);
    }
}
