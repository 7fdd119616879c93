//! train_synthetic - 合成データで2ヘッドネットワークを学習するツール
//!
//! 乱数で作った局面特徴量に対し、固定の射影から方策ラベルと価値ラベルを作って学習する。
//! 学習ループ・オプティマイザ・正則化・デバイス配置を通しで動かす確認用。
//!
//! # 使用例
//!
//! ```bash
//! # 既定設定（Adam, 200 ステップ）
//! cargo run -p rshogi-nn --release --bin train_synthetic
//!
//! # TOML 設定を使い、ステップ数だけ上書き
//! cargo run -p rshogi-nn --release --bin train_synthetic -- \
//!   --config train.toml --steps 500
//!
//! # 周期 Nesterov
//! cargo run -p rshogi-nn --release --bin train_synthetic -- --cyclic
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Axis, IxDyn};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::path::PathBuf;

use rshogi_nn::{
    Activation, Graph, Network, OptimizerPolicy, RegularizationRules, Tensor, TrainerConfig,
    TrainingBatch, TwoHeadNetwork, TwoHeadParts,
};

/// 合成データで2ヘッドネットワークを学習する
#[derive(Parser)]
#[command(name = "train_synthetic", version, about = "合成データによる方策・価値ネットワークの学習")]
struct Cli {
    /// 学習設定（TOML）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// ステップ数（設定ファイルより優先）
    #[arg(long)]
    steps: Option<usize>,

    /// 乱数シード（設定ファイルより優先）
    #[arg(long)]
    seed: Option<u64>,

    /// 周期 Nesterov を使う（既定の学習率で上書き）
    #[arg(long)]
    cyclic: bool,

    /// アクセラレータへの配置を要求する（無ければ CPU）
    #[arg(long)]
    accelerator: bool,

    /// バッチサイズ
    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    /// 入力特徴量の次元
    #[arg(long, default_value_t = 12)]
    features: usize,

    /// 胴体の出力次元
    #[arg(long, default_value_t = 16)]
    hidden: usize,

    /// 方策の候補手数
    #[arg(long, default_value_t = 6)]
    moves: usize,
}

/// ネットワークのハイパーパラメータ
#[derive(Clone, Debug)]
struct NetHyper {
    features: usize,
    hidden: usize,
    moves: usize,
}

/// 1バッチ分の合成局面
struct Batch {
    features: Tensor,
    moves: Vec<usize>,
    values: Tensor,
}

impl TrainingBatch for Batch {
    fn input(&self) -> Option<&Tensor> {
        Some(&self.features)
    }
}

/// ラベル付け用の固定射影
struct Oracle {
    projection: Tensor,
}

impl Oracle {
    fn new<R: Rng>(rng: &mut R, features: usize, moves: usize) -> Self {
        let projection =
            Tensor::from_shape_fn(IxDyn(&[moves, features]), |_| rng.random_range(-1.0..1.0));
        Self { projection }
    }

    fn batch<R: Rng>(&self, rng: &mut R, size: usize) -> Batch {
        let features_dim = self.projection.shape()[1];
        let features =
            Tensor::from_shape_fn(IxDyn(&[size, features_dim]), |_| rng.random_range(-1.0..1.0));
        let mut moves = Vec::with_capacity(size);
        let mut values = Tensor::zeros(IxDyn(&[size, 1]));
        for (b, row) in features.axis_iter(Axis(0)).enumerate() {
            let scores: Vec<f32> = self
                .projection
                .axis_iter(Axis(0))
                .map(|p| p.iter().zip(row.iter()).map(|(a, x)| a * x).sum())
                .collect();
            let best = scores
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map_or(0, |(i, _)| i);
            moves.push(best);
            values[[b, 0]] = (row.sum() / features_dim as f32 * 2.0).tanh();
        }
        Batch {
            features,
            moves,
            values,
        }
    }
}

fn build_network<R: Rng>(rng: &mut R, hyper: NetHyper) -> rshogi_nn::Result<TwoHeadNetwork<NetHyper>> {
    let mut g = Graph::new();
    let d = g.dense(rng, hyper.features, hyper.hidden, true);
    let bn = g.batch_norm(hyper.hidden);
    let relu = g.activation(Activation::Relu);
    let trunk = g.chain(vec![d, bn, relu])?;

    let v = g.dense(rng, hyper.hidden, 1, true);
    let tanh = g.activation(Activation::Tanh);
    let value_head = g.chain(vec![v, tanh])?;

    let p = g.dense(rng, hyper.hidden, hyper.moves, true);
    let softmax = g.activation(Activation::Softmax);
    let policy_head = g.chain(vec![p, softmax])?;

    TwoHeadNetwork::new(
        hyper,
        g,
        TwoHeadParts {
            trunk,
            value_head,
            policy_head,
        },
    )
}

/// 方策の交差エントロピー + 価値の二乗誤差
fn policy_value_loss(policy: &Tensor, value: &Tensor, batch: &Batch) -> f32 {
    let n = batch.moves.len().max(1) as f32;
    let ce: f32 = batch
        .moves
        .iter()
        .enumerate()
        .map(|(b, &m)| -(policy[[b, m]] + 1e-12).ln())
        .sum();
    let mse: f32 = value
        .iter()
        .zip(batch.values.iter())
        .map(|(v, t)| (v - t) * (v - t))
        .sum();
    (ce + mse) / n
}

fn accuracy(policy: &Tensor, moves: &[usize]) -> f32 {
    let hits = policy
        .axis_iter(Axis(0))
        .zip(moves)
        .filter(|(row, m)| {
            row.iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .is_some_and(|(i, _)| i == **m)
        })
        .count();
    hits as f32 / moves.len().max(1) as f32
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => TrainerConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => TrainerConfig::default(),
    };
    if let Some(steps) = cli.steps {
        config.steps = steps;
    }
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if cli.cyclic {
        config.optimizer = OptimizerPolicy::CyclicMomentum {
            lr_base: 1e-2,
            lr_high: 5e-2,
            lr_low: 1e-3,
            momentum_high: 0.95,
            momentum_low: 0.85,
        };
    }
    if cli.batch_size == 0 {
        anyhow::bail!("--batch-size must be positive");
    }
    config.validate().context("Invalid trainer config")?;

    let ctx = config.device.resolve();
    let backend = config.backend()?;
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(config.seed);

    let hyper = NetHyper {
        features: cli.features,
        hidden: cli.hidden,
        moves: cli.moves,
    };
    let net = build_network(&mut rng, hyper).context("Failed to build network")?;
    let device = ctx.default_device(config.device.prefer_accelerator || cli.accelerator);
    let mut net = net.to_device(&ctx, device);

    let rules = RegularizationRules::default();
    let regs = net.regularized_params(&rules)?;
    log::info!("Network: {:?} on {:?}", net.hyperparams(), net.device());
    log::info!(
        "Parameters: {} (regularized {}), mean |w| = {:.4}",
        net.num_parameters()?,
        net.num_regularized_parameters(&rules)?,
        net.mean_weight(&rules)?
    );

    let oracle = Oracle::new(&mut rng, cli.features, cli.moves);
    let held_out = oracle.batch(&mut rng, 256);
    let batch_size = cli.batch_size;
    let stream = std::iter::repeat_with(|| oracle.batch(&mut rng, batch_size));

    let weight_decay = config.weight_decay;
    let loss = |net: &TwoHeadNetwork<NetHyper>, batch: &Batch| -> rshogi_nn::Result<f32> {
        let out = net.forward(&batch.features)?;
        let penalty = regs.sum_of_squares(net.graph())?;
        Ok(policy_value_loss(&out.policy, &out.value, batch) + weight_decay * penalty)
    };

    let progress = ProgressBar::new(config.steps as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss:{msg}")
            .expect("valid template"),
    );
    let log_interval = config.log_interval;
    let report = net
        .train(
            &backend,
            &config.optimizer,
            loss,
            stream,
            config.steps,
            |i, l| {
                if i % log_interval == 0 || i == 1 {
                    progress.set_message(format!("{l:.6}"));
                }
                progress.inc(1);
                Ok(())
            },
        )
        .context("Training failed")?;
    progress.finish();
    ctx.reclaim_memory();

    let net = net.to_cpu(&ctx);
    let out = net.forward_on(&ctx, &held_out.features)?;
    println!("Steps:           {}", report.steps);
    if let (Some(mean), Some(last)) = (report.mean_loss, report.final_loss) {
        println!("Mean loss:       {mean:.6}");
        println!("Final loss:      {last:.6}");
    }
    println!(
        "Held-out loss:   {:.6}",
        policy_value_loss(&out.policy, &out.value, &held_out)
    );
    println!(
        "Policy accuracy: {:.1}%",
        accuracy(&out.policy, &held_out.moves) * 100.0
    );
    println!("Mean |w|:        {:.4}", net.mean_weight(&rules)?);
    Ok(())
}
