//! Character-level corpus for the training binary.

use std::collections::{BTreeSet, HashMap};

use crate::error::{LstmError, Result};

#[derive(Clone, Debug)]
pub struct CharCorpus {
    chars: Vec<char>,
    char_to_idx: HashMap<char, usize>,
    /// `inputs[i]` predicts `targets[i] == inputs[i + 1]`.
    pub inputs: Vec<usize>,
    pub targets: Vec<usize>,
}

impl CharCorpus {
    /// Vocabulary is the sorted set of distinct characters in `text`.
    pub fn from_text(text: &str) -> Result<Self> {
        let vocab: BTreeSet<char> = text.chars().collect();
        Self::with_vocab(text, vocab.into_iter().collect())
    }

    /// Use a fixed vocabulary, e.g. the one a checkpoint was trained with.
    pub fn with_vocab(text: &str, chars: Vec<char>) -> Result<Self> {
        let char_to_idx: HashMap<char, usize> = chars.iter().enumerate().map(|(i, &c)| (c, i)).collect();
        let mut corpus = CharCorpus { chars, char_to_idx, inputs: Vec::new(), targets: Vec::new() };
        let ids = corpus.encode(text)?;
        if ids.len() < 2 {
            return Err(LstmError::InvalidSequence(format!(
                "training text needs at least 2 characters, got {}",
                ids.len()
            )));
        }
        corpus.inputs = ids[..ids.len() - 1].to_vec();
        corpus.targets = ids[1..].to_vec();
        Ok(corpus)
    }

    pub fn vocab_size(&self) -> usize {
        self.chars.len()
    }

    pub fn vocab(&self) -> String {
        self.chars.iter().collect()
    }

    pub fn encode(&self, text: &str) -> Result<Vec<usize>> {
        text.chars()
            .enumerate()
            .map(|(pos, c)| {
                self.char_to_idx.get(&c).copied().ok_or_else(|| {
                    LstmError::InvalidSequence(format!("character {:?} at position {} is not in the vocabulary", c, pos))
                })
            })
            .collect()
    }

    /// Unknown indices decode as `?`.
    pub fn decode(&self, ids: &[usize]) -> String {
        ids.iter().map(|&i| self.chars.get(i).copied().unwrap_or('?')).collect()
    }

    /// Consecutive non-overlapping `(inputs, targets)` windows of `seq_len`.
    /// A trailing partial window is dropped unless it is the only one.
    pub fn sequences(&self, seq_len: usize) -> Vec<(&[usize], &[usize])> {
        let n = self.inputs.len();
        let seq_len = seq_len.max(1);
        if n <= seq_len {
            return vec![(&self.inputs[..], &self.targets[..])];
        }
        (0..n / seq_len)
            .map(|k| {
                let (s, e) = (k * seq_len, (k + 1) * seq_len);
                (&self.inputs[s..e], &self.targets[s..e])
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocab_is_sorted_and_targets_are_shifted() {
        let c = CharCorpus::from_text("abca").unwrap();
        assert_eq!(c.vocab(), "abc");
        assert_eq!(c.inputs, vec![0, 1, 2]);
        assert_eq!(c.targets, vec![1, 2, 0]);
        assert_eq!(c.decode(&[2, 0, 9]), "ca?");
    }

    #[test]
    fn windows_cover_full_chunks() {
        let c = CharCorpus::from_text("abcdefghij").unwrap();
        let seqs = c.sequences(4);
        assert_eq!(seqs.len(), 2);
        assert_eq!(seqs[1].0, &[4, 5, 6, 7]);
        assert_eq!(seqs[1].1, &[5, 6, 7, 8]);
        assert_eq!(c.sequences(100).len(), 1);
    }

    #[test]
    fn too_short_or_unknown_text_is_rejected() {
        assert!(CharCorpus::from_text("a").is_err());
        assert!(CharCorpus::with_vocab("abz", vec!['a', 'b']).is_err());
    }
}
