use std::time::Instant;

use anyhow::{Ok, Result};
use clap::Parser;
use tracing::info;

use wap::{
    attention::reconstruct_attention,
    config::WapConfig,
    context::WapContext,
    loader::TensorDataMap,
    model::Wap,
    util::{mmap_file, run_threadlimited},
    vocab::Vocab,
};

mod args;
mod util;

use args::Args;
use util::{load_grayscale, sanitize_token, write_overlay, FloatType};

pub fn setup_logging() {
    use tracing::metadata::LevelFilter;
    use tracing_subscriber::{fmt, fmt::time::FormatTime, layer::SubscriberExt, Layer};

    #[derive(Clone, Debug, Copy, PartialEq, Eq)]
    struct Elapsed(Instant);
    impl FormatTime for Elapsed {
        fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
            let e = self.0.elapsed();
            write!(w, "{:4}.{:02}s", e.as_secs(), e.subsec_millis() / 10)
        }
    }

    let fmt_layer = fmt::layer()
        .compact()
        .with_timer(Elapsed(Instant::now()))
        .with_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        );

    let sub = tracing_subscriber::registry().with(fmt_layer);

    tracing::subscriber::set_global_default(sub).expect("Could tracing subscriber");
}

fn go() -> Result<()> {
    let args = Args::parse();
    let vocabfn = &args.vocab;
    let modelfn = &args.model;
    info!("Using configuration: {args:?}\n");

    info!("Loading vocabulary from: {vocabfn}");
    let vocab = Vocab::from_file(vocabfn)?;
    let config = WapConfig::crohme(vocab.len());

    info!("Loading model from: {modelfn}");
    let mm = mmap_file(modelfn)?;
    #[cfg(unix)]
    mm.advise(memmap2::Advice::Sequential)?;
    let tdm: TensorDataMap<'_> = (modelfn.clone(), &mm[..]).try_into()?;
    let model: Wap<FloatType> = (&config, tdm).try_into()?;
    let context = WapContext::new(model, vocab)?;

    info!(
        "Loaded: layers={}, feature dim={}, vocab={}",
        config.num_layers,
        config.feature_dim(),
        config.vocab_size
    );

    info!("Reading image from: {}", args.image.display());
    let image = load_grayscale(&args.image, config.input_dims)?;

    let stime = Instant::now();
    let translation =
        run_threadlimited(args.max_eval_threads, || context.translate(&image))?;
    let elapsed = stime.elapsed();

    println!("{}", translation.latex);
    let tcount = translation.tokens.len();
    let tps = tcount as f64 / (elapsed.as_millis() as f64 / 1000.0);
    info!(
        "Completion. Token(s) decoded: {tcount}, elapsed time: {:?}, TPS: {tps}",
        elapsed
    );

    if let Some(dir) = &args.dump_attention {
        std::fs::create_dir_all(dir)?;
        let grid = config.output_dim;
        for (i, alpha) in translation.alphas.iter().enumerate() {
            let token = context
                .vocab
                .token(translation.tokens[i])
                .unwrap_or("<unk>");
            let map = reconstruct_attention(
                alpha.view(),
                grid,
                config.input_dims,
                args.attention_scale.into(),
            )?;
            let fname = dir.join(format!("{i:03}_{}.png", sanitize_token(token)));
            write_overlay(&fname, &image, &map)?;
            info!("Wrote attention map for {token:?} to {}", fname.display());
        }
    }
    Ok(())
}

pub fn main() -> Result<()> {
    setup_logging();
    go()
}
