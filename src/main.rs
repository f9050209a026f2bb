use std::sync::Arc;

use aletheia::config::Config;
use aletheia::events::{EventSink, NdjsonEventLog, NullSink};
use aletheia::orchestrator::RunParams;
use aletheia::progress::{EventKind, ProgressBus};
use aletheia::tasks::TaskKind;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    let (query, params, kind) = parse_args()?;

    tracing::info!("aletheia starting");
    let config = Config::from_env();

    let model = config.build_model();
    let search = config.build_search();
    let store = config.build_store().await;
    let bus = Arc::new(ProgressBus::new());

    let sink: Arc<dyn EventSink> = match &config.artifacts_dir {
        Some(dir) => match NdjsonEventLog::create(dir, "cli") {
            Some(log) => Arc::new(log),
            None => Arc::new(NullSink),
        },
        None => Arc::new(NullSink),
    };

    let manager = aletheia::build_task_manager(&config, model, search, store, bus.clone(), sink);

    #[cfg(feature = "durable-store")]
    let manager = match config
        .db_path
        .clone()
        .and_then(aletheia::store::durable::DurableStore::open)
    {
        Some(durable) => manager.with_durable(durable),
        None => manager,
    };

    let task_id = manager.submit(&query, kind, params)?;
    let mut progress = bus.subscribe(&task_id);
    println!("task accepted: {task_id}");

    while let Some(event) = progress.recv().await {
        println!(
            "[{}] {}",
            event.event_type.as_str(),
            event.message
        );
        if matches!(event.event_type, EventKind::Completed | EventKind::Failed) {
            break;
        }
    }

    match manager.report(&task_id) {
        Some(report) if report.report_md.is_some() => {
            println!("\n{}", report.report_md.unwrap_or_default());
            if let Some(bib) = report.sources_bib
                && !bib.is_empty()
            {
                println!("\n---\nSources:\n{bib}");
            }
        }
        _ => {
            let status = manager.status(&task_id);
            anyhow::bail!(
                "research did not produce a report: {:?}",
                status.and_then(|s| s.details)
            );
        }
    }

    tracing::info!("aletheia shutting down");
    Ok(())
}

/// `aletheia "<query>" [--simple] [--iterations N] [--min-score X]`
fn parse_args() -> anyhow::Result<(String, RunParams, TaskKind)> {
    let mut query = None;
    let mut params = RunParams::default();
    let mut kind = TaskKind::Deep;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--simple" => kind = TaskKind::Simple,
            "--iterations" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--iterations needs a value"))?;
                params.max_iterations = value.parse()?;
            }
            "--min-score" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--min-score needs a value"))?;
                params.min_score = value.parse()?;
            }
            other if query.is_none() => query = Some(other.to_string()),
            other => anyhow::bail!("unexpected argument: {other}"),
        }
    }

    let query = query.ok_or_else(|| {
        anyhow::anyhow!("usage: aletheia \"<query>\" [--simple] [--iterations N] [--min-score X]")
    })?;
    Ok((query, params, kind))
}
