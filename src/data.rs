use anyhow::Context;
use candle_core::{Device, Tensor};
use flate2::bufread::GzDecoder;
use rand::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;

/// Reads the raw corpus, transparently gunzipping `.gz` files.
pub fn read_corpus(path: &Path) -> anyhow::Result<String> {
    let file =
        File::open(path).with_context(|| format!("error opening corpus {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut bytes = Vec::new();
    if path.extension().is_some_and(|ext| ext == "gz") {
        GzDecoder::new(reader).read_to_end(&mut bytes)?;
    } else {
        reader.read_to_end(&mut bytes)?;
    }
    String::from_utf8(bytes).context("corpus is not valid UTF-8")
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum DataError {
    #[error("corpus is empty")]
    EmptyCorpus,
    #[error("character {0:?} is not in the vocabulary")]
    UnknownCharacter(char),
    #[error("token {0} is out of vocabulary range")]
    UnknownToken(u32),
    #[error("split ratio {0} must lie in (0, 1)")]
    InvalidSplitRatio(f64),
    #[error("{split:?} split holds {available} tokens, a window needs {needed}")]
    WindowTooShort {
        split: Split,
        available: usize,
        needed: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
}

/// Bijective character <-> token-id mapping, ids assigned in sorted
/// character order so the same text always yields the same vocabulary.
#[derive(Debug, Clone)]
pub struct Vocab {
    chars: Vec<char>,
    ids: HashMap<char, u32>,
}

impl Vocab {
    pub fn build(text: &str) -> Result<Self, DataError> {
        if text.is_empty() {
            return Err(DataError::EmptyCorpus);
        }
        let chars: Vec<char> = text.chars().collect::<BTreeSet<_>>().into_iter().collect();
        let ids = chars.iter().enumerate().map(|(i, &c)| (c, i as u32)).collect();
        Ok(Self { chars, ids })
    }

    pub fn vocab_size(&self) -> usize {
        self.chars.len()
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>, DataError> {
        text.chars()
            .map(|c| self.ids.get(&c).copied().ok_or(DataError::UnknownCharacter(c)))
            .collect()
    }

    pub fn decode(&self, tokens: &[u32]) -> Result<String, DataError> {
        tokens
            .iter()
            .map(|&t| self.chars.get(t as usize).copied().ok_or(DataError::UnknownToken(t)))
            .collect()
    }
}

/// The encoded corpus split into a train prefix and validation suffix,
/// plus the rng that drives window sampling.
pub struct Dataset {
    pub vocab: Vocab,
    train_tokens: Vec<u32>,
    val_tokens: Vec<u32>,
    rng: StdRng,
    device: Device,
}

impl Dataset {
    pub fn new(text: &str, split_ratio: f64, seed: u64, device: &Device) -> Result<Self, DataError> {
        if split_ratio <= 0.0 || split_ratio >= 1.0 {
            return Err(DataError::InvalidSplitRatio(split_ratio));
        }
        let vocab = Vocab::build(text)?;
        let mut tokens = vocab.encode(text)?;
        let val_tokens = tokens.split_off((tokens.len() as f64 * split_ratio) as usize);
        Ok(Self {
            vocab,
            train_tokens: tokens,
            val_tokens,
            rng: StdRng::seed_from_u64(seed),
            device: device.clone(),
        })
    }

    pub fn tokens(&self, split: Split) -> &[u32] {
        match split {
            Split::Train => &self.train_tokens,
            Split::Val => &self.val_tokens,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Samples `batch_size` random windows from the chosen split. Targets
    /// are the inputs shifted one position into the future.
    pub fn batch(
        &mut self,
        split: Split,
        batch_size: usize,
        sequence_length: usize,
    ) -> anyhow::Result<(Tensor, Tensor)> {
        let available = self.tokens(split).len();
        if available < sequence_length + 1 {
            return Err(DataError::WindowTooShort {
                split,
                available,
                needed: sequence_length + 1,
            }
            .into());
        }
        let starts: Vec<usize> = (0..batch_size)
            .map(|_| self.rng.gen_range(0..available - sequence_length))
            .collect();
        let data = self.tokens(split);
        let mut xs = Vec::with_capacity(batch_size * sequence_length);
        let mut ys = Vec::with_capacity(batch_size * sequence_length);
        for s in starts {
            xs.extend_from_slice(&data[s..s + sequence_length]);
            ys.extend_from_slice(&data[s + 1..s + sequence_length + 1]);
        }
        let x = Tensor::from_vec(xs, (batch_size, sequence_length), &self.device)?;
        let y = Tensor::from_vec(ys, (batch_size, sequence_length), &self.device)?;
        Ok((x, y))
    }
}
