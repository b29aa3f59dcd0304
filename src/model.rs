use candle_core::{Device, IndexOp, Result, Tensor, D};
use candle_nn::{
    embedding, layer_norm, linear, linear_no_bias, ops, Embedding, LayerNorm, Linear, Module,
    VarBuilder,
};
use candle_transformers::generation::LogitsProcessor;
use clap::ValueEnum;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Bigram,
    Transformer,
}

/// Next-character scores from nothing but the current character: a single
/// (vocab, vocab) lookup table, every position independent.
pub struct Bigram {
    table: Embedding,
}

impl Bigram {
    pub fn new(vocab_size: usize, vb: VarBuilder) -> Result<Self> {
        let table = embedding(vocab_size, vocab_size, vb.pp("table"))?;
        Ok(Self { table })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.table.forward(xs)
    }
}

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> Result<Tensor> {
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(mask.dims())?;
    mask.where_cond(&on_true, on_false)
}

// 1 where key position j lies in the future of query position i
fn causal_mask(t: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<u8> = (0..t)
        .flat_map(|i| (0..t).map(move |j| u8::from(j > i)))
        .collect();
    Tensor::from_vec(mask, (t, t), device)
}

struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    scale: f64,
}

impl SelfAttention {
    fn new(embed_size: usize, vb: VarBuilder) -> Result<Self> {
        let query = linear_no_bias(embed_size, embed_size, vb.pp("query"))?;
        let key = linear_no_bias(embed_size, embed_size, vb.pp("key"))?;
        let value = linear_no_bias(embed_size, embed_size, vb.pp("value"))?;
        Ok(Self {
            query,
            key,
            value,
            scale: 1.0 / (embed_size as f64).sqrt(),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_b, t, _c) = x.dims3()?;
        let q = self.query.forward(x)?;
        let k = self.key.forward(x)?;
        let v = self.value.forward(x)?;
        let att = q.matmul(&k.t()?.contiguous()?)?.affine(self.scale, 0.)?;
        let mask = causal_mask(t, x.device())?.broadcast_as(att.dims())?;
        let att = masked_fill(&att, &mask, f32::NEG_INFINITY)?;
        let att = ops::softmax(&att, D::Minus1)?;
        att.matmul(&v)
    }
}

struct FeedForward {
    linear1: Linear,
    linear2: Linear,
}

impl FeedForward {
    fn new(dim: usize, mult: usize, vb: VarBuilder) -> Result<Self> {
        let dim_inner = dim * mult;
        let linear1 = linear(dim, dim_inner, vb.pp("linear1"))?;
        let linear2 = linear(dim_inner, dim, vb.pp("linear2"))?;
        Ok(Self { linear1, linear2 })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out = self.linear1.forward(x)?.gelu()?;
        self.linear2.forward(&out)
    }
}

struct Block {
    norm1: LayerNorm,
    attn: SelfAttention,
    norm2: LayerNorm,
    ffn: FeedForward,
}

impl Block {
    fn new(dim: usize, ff_mult: usize, vb: VarBuilder) -> Result<Self> {
        let norm1 = layer_norm(dim, 1e-5, vb.pp("norm1"))?;
        let attn = SelfAttention::new(dim, vb.pp("attn"))?;
        let norm2 = layer_norm(dim, 1e-5, vb.pp("norm2"))?;
        let ffn = FeedForward::new(dim, ff_mult, vb.pp("ffn"))?;
        Ok(Self {
            norm1,
            attn,
            norm2,
            ffn,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.attn.forward(&self.norm1.forward(x)?)?.add(x)?;
        self.ffn.forward(&self.norm2.forward(&x)?)?.add(&x)
    }
}

pub struct TransformerConfig {
    pub vocab_size: usize,
    pub sequence_length: usize,
    pub embed_size: usize,
    pub num_layers: usize,
    pub ff_mult: usize,
}

impl TransformerConfig {
    pub fn new(vocab_size: usize, sequence_length: usize, embed_size: usize) -> Self {
        Self {
            vocab_size,
            sequence_length,
            embed_size,
            num_layers: 2,
            ff_mult: 4,
        }
    }
}

/// Decoder-only transformer over a window of at most `sequence_length`
/// prior characters.
pub struct Transformer {
    token_emb: Embedding,
    pos_emb: Embedding,
    blocks: Vec<Block>,
    norm: LayerNorm,
    to_logits: Linear,
    sequence_length: usize,
}

impl Transformer {
    pub fn new(cfg: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let token_emb = embedding(cfg.vocab_size, cfg.embed_size, vb.pp("token_emb"))?;
        let pos_emb = embedding(cfg.sequence_length, cfg.embed_size, vb.pp("pos_emb"))?;
        let mut blocks = Vec::with_capacity(cfg.num_layers);
        for i in 0..cfg.num_layers {
            blocks.push(Block::new(
                cfg.embed_size,
                cfg.ff_mult,
                vb.pp(format!("block{i}")),
            )?);
        }
        let norm = layer_norm(cfg.embed_size, 1e-5, vb.pp("norm"))?;
        let to_logits = linear_no_bias(cfg.embed_size, cfg.vocab_size, vb.pp("to_logits"))?;
        Ok(Self {
            token_emb,
            pos_emb,
            blocks,
            norm,
            to_logits,
            sequence_length: cfg.sequence_length,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_b, t) = xs.dims2()?;
        let positions = Tensor::arange(0, t as u32, xs.device())?;
        let tok = self.token_emb.forward(xs)?;
        let pos = self.pos_emb.forward(&positions)?;
        let mut out = tok.broadcast_add(&pos)?;
        for block in &self.blocks {
            out = block.forward(&out)?;
        }
        let out = self.norm.forward(&out)?;
        self.to_logits.forward(&out)
    }
}

/// The model selected at startup; everything downstream goes through this
/// uniform forward/yap surface.
pub enum Model {
    Bigram(Bigram),
    Transformer(Transformer),
}

impl Model {
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Model::Bigram(m) => m.forward(xs),
            Model::Transformer(m) => m.forward(xs),
        }
    }

    /// How many trailing tokens a forward pass can condition on.
    pub fn context_size(&self) -> usize {
        match self {
            Model::Bigram(_) => 1,
            Model::Transformer(m) => m.sequence_length,
        }
    }

    /// Autoregressive generation: sample `length` tokens, each step fed the
    /// last `context_size()` tokens produced so far. Returns the sampled
    /// ids only; the seed token is context, not output.
    pub fn yap(
        &self,
        seed_token: u32,
        length: usize,
        sampler: &mut LogitsProcessor,
        device: &Device,
    ) -> Result<Vec<u32>> {
        let mut context = vec![seed_token];
        let mut out = Vec::with_capacity(length);
        for _ in 0..length {
            let start = context.len().saturating_sub(self.context_size());
            let window = &context[start..];
            let input = Tensor::from_slice(window, (1, window.len()), device)?;
            let logits = self.forward(&input)?;
            let next = sampler.sample(&logits.i((0, window.len() - 1))?)?;
            context.push(next);
            out.push(next);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{loss::cross_entropy, VarMap};
    use candle_transformers::generation::Sampling;

    const VOCAB: usize = 65;

    fn cpu_vb() -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (varmap, vb)
    }

    fn token_batch(rows: &[Vec<u32>]) -> Tensor {
        let flat: Vec<u32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), rows[0].len()), &Device::Cpu).unwrap()
    }

    #[test]
    fn bigram_logits_shape() {
        let (_varmap, vb) = cpu_vb();
        let model = Bigram::new(VOCAB, vb).unwrap();
        let x = token_batch(&vec![vec![0u32; 32]; 8]);
        let logits = model.forward(&x).unwrap();
        assert_eq!(logits.dims(), &[8, 32, VOCAB]);
    }

    #[test]
    fn bigram_loss_is_finite_and_non_negative() {
        let (_varmap, vb) = cpu_vb();
        let model = Bigram::new(VOCAB, vb).unwrap();
        let x = token_batch(&vec![(0..32u32).collect::<Vec<_>>(); 8]);
        let y = token_batch(&vec![(1..33u32).collect::<Vec<_>>(); 8]);
        let logits = model.forward(&x).unwrap();
        let (b, t, c) = logits.dims3().unwrap();
        let loss = cross_entropy(
            &logits.reshape((b * t, c)).unwrap(),
            &y.reshape(b * t).unwrap(),
        )
        .unwrap();
        let loss = loss.to_scalar::<f32>().unwrap();
        assert!(loss.is_finite());
        assert!(loss >= 0.0);
    }

    #[test]
    fn transformer_logits_shape() {
        let (_varmap, vb) = cpu_vb();
        let cfg = TransformerConfig::new(VOCAB, 32, 16);
        let model = Transformer::new(&cfg, vb).unwrap();
        let x = token_batch(&vec![vec![1u32; 32]; 8]);
        assert_eq!(model.forward(&x).unwrap().dims(), &[8, 32, VOCAB]);
    }

    #[test]
    fn transformer_accepts_partial_context() {
        let (_varmap, vb) = cpu_vb();
        let cfg = TransformerConfig::new(VOCAB, 32, 16);
        let model = Transformer::new(&cfg, vb).unwrap();
        let x = token_batch(&[vec![3u32, 1, 4]]);
        assert_eq!(model.forward(&x).unwrap().dims(), &[1, 3, VOCAB]);
    }

    #[test]
    fn transformer_rows_do_not_leak_across_the_batch() {
        let (_varmap, vb) = cpu_vb();
        let cfg = TransformerConfig::new(VOCAB, 8, 16);
        let model = Transformer::new(&cfg, vb).unwrap();
        let seq: Vec<u32> = vec![5, 12, 0, 7, 33, 2, 9, 41];
        let other: Vec<u32> = vec![60, 3, 3, 17, 8, 25, 1, 50];
        let alone = model.forward(&token_batch(&[seq.clone()])).unwrap();
        let batched = model.forward(&token_batch(&[seq, other])).unwrap();
        let alone = alone.i(0).unwrap().to_vec2::<f32>().unwrap();
        let in_batch = batched.i(0).unwrap().to_vec2::<f32>().unwrap();
        for (a, b) in alone.iter().flatten().zip(in_batch.iter().flatten()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn transformer_attention_is_causal() {
        let (_varmap, vb) = cpu_vb();
        let cfg = TransformerConfig::new(VOCAB, 8, 16);
        let model = Transformer::new(&cfg, vb).unwrap();
        let base: Vec<u32> = vec![5, 12, 0, 7, 33, 2, 9, 41];
        let mut altered = base.clone();
        altered[7] = 60;
        let logits_a = model.forward(&token_batch(&[base])).unwrap();
        let logits_b = model.forward(&token_batch(&[altered])).unwrap();
        // changing the final token must leave every earlier position alone
        let a = logits_a.i((0, ..7)).unwrap().to_vec2::<f32>().unwrap();
        let b = logits_b.i((0, ..7)).unwrap().to_vec2::<f32>().unwrap();
        for (va, vb) in a.iter().flatten().zip(b.iter().flatten()) {
            assert!((va - vb).abs() < 1e-5);
        }
    }

    #[test]
    fn yap_produces_exactly_the_requested_tokens() {
        let (_varmap, vb) = cpu_vb();
        let cfg = TransformerConfig::new(VOCAB, 32, 16);
        let model = Model::Transformer(Transformer::new(&cfg, vb).unwrap());
        let mut sampler = LogitsProcessor::from_sampling(42, Sampling::All { temperature: 1.0 });
        let tokens = model.yap(0, 100, &mut sampler, &Device::Cpu).unwrap();
        assert_eq!(tokens.len(), 100);
        assert!(tokens.iter().all(|&t| (t as usize) < VOCAB));
    }

    #[test]
    fn bigram_yap_restarts_from_a_fresh_seed() {
        let (_varmap, vb) = cpu_vb();
        let model = Model::Bigram(Bigram::new(VOCAB, vb).unwrap());
        let mut sampler = LogitsProcessor::from_sampling(7, Sampling::All { temperature: 1.0 });
        let first = model.yap(0, 20, &mut sampler, &Device::Cpu).unwrap();
        let mut sampler = LogitsProcessor::from_sampling(7, Sampling::All { temperature: 1.0 });
        let again = model.yap(0, 20, &mut sampler, &Device::Cpu).unwrap();
        assert_eq!(first, again);
        assert!(first.iter().all(|&t| (t as usize) < VOCAB));
    }
}
