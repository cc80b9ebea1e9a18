use anyhow::Result;

use anidiff::{provider, Args, CancelToken, ModelChoice, Pipeline};
use clap::Parser;
use tracing::{info, warn};

/// Exit status of a process stopped by SIGINT.
const INTERRUPTED_STATUS: i32 = 130;

#[derive(Debug, thiserror::Error)]
#[error("interrupted twice, not waiting for the generation to stop")]
struct Interrupted;

/// Resolves on the second Ctrl-C, cancelling `cancel` on the first one.
async fn interrupted(cancel: CancelToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        return std::future::pending().await;
    }
    warn!("Interrupted, cancelling generation. Press Ctrl-C again to exit now.");
    cancel.cancel();
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn run(args: Args) -> Result<()> {
    let settings = args.settings()?;
    let request = args.request(&settings);
    let pipeline = Pipeline::new(provider::from_settings(&settings));

    let task = pipeline.spawn(request);
    let cancel = task.cancel_token();
    let batch = tokio::select! {
        batch = task.wait() => batch?,
        () = interrupted(cancel) => return Err(Interrupted.into()),
    };
    for filename in batch.save(&args.final_image)? {
        info!("Saved {filename}.");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.list_models {
        for choice in ModelChoice::ALL {
            println!("{}\t{}", choice.label(), choice.repo());
        }
        return Ok(());
    }

    let guard = args.init_tracing();
    match run(args).await {
        // Dropping the runtime would wait on the sampler still running on the blocking pool.
        Err(err) if err.is::<Interrupted>() => {
            drop(guard);
            eprintln!("{err}");
            std::process::exit(INTERRUPTED_STATUS);
        }
        result => result,
    }
}
