use crate::data::{Dataset, Split};
use crate::model::{Bigram, Model, ModelKind, Transformer, TransformerConfig};
use candle_core::{DType, Result, Tensor};
use candle_nn::{loss::cross_entropy, AdamW, Optimizer, VarBuilder, VarMap};
use candle_transformers::generation::{LogitsProcessor, Sampling};

pub struct TrainConfig {
    pub model: ModelKind,
    pub batch_size: usize,
    pub sequence_length: usize,
    pub embed_size: usize,
    pub steps: usize,
    pub learning_rate: f64,
    pub log_every: usize,
    pub sample_length: usize,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model: ModelKind::Transformer,
            batch_size: 8,
            sequence_length: 32,
            embed_size: 16,
            steps: 3000,
            learning_rate: 0.01,
            log_every: 100,
            sample_length: 100,
            seed: 42,
        }
    }
}

// flatten (B, T, V) logits against (B, T) targets
fn next_token_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (b, t, c) = logits.dims3()?;
    cross_entropy(&logits.reshape((b * t, c))?, &targets.reshape(b * t)?)
}

fn build_model(ds: &Dataset, cfg: &TrainConfig, vb: VarBuilder) -> Result<Model> {
    let vocab_size = ds.vocab.vocab_size();
    Ok(match cfg.model {
        ModelKind::Bigram => Model::Bigram(Bigram::new(vocab_size, vb)?),
        ModelKind::Transformer => {
            let model_cfg =
                TransformerConfig::new(vocab_size, cfg.sequence_length, cfg.embed_size);
            Model::Transformer(Transformer::new(&model_cfg, vb)?)
        }
    })
}

pub fn run(ds: &mut Dataset, cfg: &TrainConfig) -> anyhow::Result<()> {
    let device = ds.device().clone();

    let train_len = ds.tokens(Split::Train).len();
    let val_len = ds.tokens(Split::Val).len();
    let total = train_len + val_len;
    println!(
        "Train: {} tokens ({:.1}%)",
        train_len,
        100.0 * train_len as f64 / total as f64
    );
    println!(
        "Val: {} tokens ({:.1}%)",
        val_len,
        100.0 * val_len as f64 / total as f64
    );

    let (x, y) = ds.batch(Split::Train, cfg.batch_size, cfg.sequence_length)?;
    println!("x: {:?}", x.to_vec2::<u32>()?);
    println!("y: {:?}", y.to_vec2::<u32>()?);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = build_model(ds, cfg, vb)?;

    let mut sampler = LogitsProcessor::from_sampling(cfg.seed, Sampling::All { temperature: 1.0 });
    let before = model.yap(0, cfg.sample_length, &mut sampler, &device)?;
    println!("yap before training:\n{}", ds.vocab.decode(&before)?);

    let mut optim = AdamW::new_lr(varmap.all_vars(), cfg.learning_rate)?;
    for step in 0..cfg.steps {
        let (x, y) = ds.batch(Split::Train, cfg.batch_size, cfg.sequence_length)?;
        let logits = model.forward(&x)?;
        let loss = next_token_loss(&logits, &y)?;
        optim.backward_step(&loss)?;

        if step % cfg.log_every == 0 {
            let (vx, vy) = ds.batch(Split::Val, cfg.batch_size, cfg.sequence_length)?;
            let val_loss = next_token_loss(&model.forward(&vx)?, &vy)?;
            println!(
                "step {}, loss: {:.4}, val loss: {:.4}",
                step,
                loss.to_scalar::<f32>()?,
                val_loss.to_scalar::<f32>()?
            );
        }
    }

    let after = model.yap(0, cfg.sample_length, &mut sampler, &device)?;
    println!("yap after training:\n{}", ds.vocab.decode(&after)?);

    Ok(())
}
