use anyhow::{Context, Result};
use tracing::{error, info, warn};

use plumbline::engine::{Engine, EngineError, InterruptAction};
use plumbline::plugins::Registry;
use plumbline::{cli, config, logging};

/// Exit status of a run stopped by an interrupt.
const EXIT_INTERRUPTED: i32 = 130;

fn main() -> Result<()> {
    let cli_opts = cli::parse();
    logging::init_logging_with(cli_opts.debug, cli_opts.log_json);

    if cli_opts.list_plugins {
        let registry = Registry::builtin()?;
        for descriptor in registry.descriptors() {
            println!(
                "{:<12} {:<8} weight={} {}",
                descriptor.name, descriptor.category, descriptor.weight, descriptor.description
            );
        }
        return Ok(());
    }

    let mut loaded = config::load_config(cli_opts.config_path.as_deref())?;
    cli_opts.apply(&mut loaded.config);
    let cfg = &loaded.config;

    info!(
        "starting source={} output={} workers={} single_threaded={} image={}",
        cfg.source_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string()),
        cfg.output_path.display(),
        cfg.worker_count,
        cfg.single_threaded,
        cfg.is_image
    );

    let engine = Engine::new(loaded);
    let handle = engine.shutdown_handle();
    ctrlc::set_handler(move || match handle.interrupt() {
        InterruptAction::Draining => {
            warn!("interrupt received, stopping (interrupt again to terminate)");
        }
        InterruptAction::Terminate => {
            error!("second interrupt, terminating");
            std::process::exit(1);
        }
    })
    .context("installing interrupt handler")?;

    match engine.run() {
        Ok(stats) if stats.interrupted => {
            warn!("run interrupted, output is partial");
            std::process::exit(EXIT_INTERRUPTED);
        }
        Ok(_) => {
            info!("plumbline run finished");
            Ok(())
        }
        Err(EngineError::Interrupted) => std::process::exit(1),
        Err(err) => Err(err).context("processing failed"),
    }
}
