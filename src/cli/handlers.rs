use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use crate::app::{AppFactory, ItemOutcome, ProgressEvent};
use crate::config::Config;
use crate::credentials;
use crate::refresh::DailySchedule;
use crate::semantic::VectorStorage;
use crate::web;

pub fn handle_serve(config: &Config, addr: Option<String>, no_refresh: bool) -> Result<()> {
    let app = Arc::new(AppFactory::create_app(config)?);

    let schedule = if no_refresh {
        None
    } else {
        match AppFactory::create_refresher(config) {
            Ok(refresher) => Some(DailySchedule::new(refresher, &config.refresh)?),
            Err(err) => {
                log::warn!("catalog refresh disabled: {err}");
                None
            }
        }
    };

    let addr = addr.unwrap_or_else(|| config.server.addr.clone());
    web::start_daemon(app, &addr, schedule)
}

pub fn handle_query(config: &Config, targets: Vec<String>, progress: bool) -> Result<()> {
    let app = AppFactory::create_app(config)?;

    let (tx, rx) = mpsc::channel::<ProgressEvent>();
    let printer = progress.then(|| {
        std::thread::spawn(move || {
            for event in rx {
                if let Ok(line) = serde_json::to_string(&event) {
                    eprintln!("{line}");
                }
            }
        })
    });
    let sink = progress.then_some(&tx);

    let outcomes: Vec<_> = targets
        .iter()
        .map(|target| app.find_similar_with_progress(target, sink))
        .collect();

    drop(tx);
    if let Some(printer) = printer {
        let _ = printer.join();
    }

    if let [single] = outcomes.as_slice() {
        return match single {
            Ok(result) => {
                println!("{}", serde_json::to_string_pretty(result)?);
                Ok(())
            }
            Err(err) => bail!("{err}"),
        };
    }

    let outcomes: Vec<ItemOutcome> = outcomes
        .into_iter()
        .map(|outcome| match outcome {
            Ok(result) => ItemOutcome::Found(result),
            Err(err) => ItemOutcome::Failed {
                error: err.to_string(),
            },
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&outcomes)?);
    Ok(())
}

pub fn handle_search(config: &Config, query: String) -> Result<()> {
    let app = AppFactory::create_app(config)?;
    let candidates = app.search(&query)?;

    println!("{}", serde_json::to_string_pretty(&candidates)?);
    Ok(())
}

pub fn handle_reindex(config: &Config) -> Result<()> {
    let app = AppFactory::create_app(config)?;

    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg} [{elapsed}]") {
        spinner.set_style(style);
    }
    spinner.set_message("building vector index");
    spinner.enable_steady_tick(Duration::from_millis(120));

    match app.reindex() {
        Ok(chunks) => {
            spinner.finish_with_message(format!("vector index built with {chunks} chunks"));
            Ok(())
        }
        Err(err) => {
            spinner.abandon_with_message("vector index build failed");
            Err(err).context("Reindex failed")
        }
    }
}

pub fn handle_refresh(config: &Config, daemon: bool) -> Result<()> {
    let refresher = AppFactory::create_refresher(config)?;
    // no in-process handle here; the serving process notices the catalog change
    let storage = VectorStorage::new(config.index_dir());

    if !daemon {
        let report = refresher.run(&storage).context("Catalog refresh failed")?;
        if report.changed {
            println!("{} products saved", report.products);
            if let Some(backup) = report.backup {
                println!("previous catalog kept at {}", backup.display());
            }
        } else {
            println!("catalog unchanged ({} products)", report.products);
        }
        return Ok(());
    }

    let schedule = DailySchedule::new(refresher, &config.refresh)?;

    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        flag.store(true, Ordering::Relaxed);
    })
    .context("Failed to set Ctrl+C handler")?;

    schedule.run(&storage, &stop);
    Ok(())
}

pub fn handle_configure_token(config: &Config) -> Result<()> {
    let token = inquire::Password::new("Catalog service token:")
        .without_confirmation()
        .prompt()
        .context("No token entered")?;

    let token = token.trim();
    if token.is_empty() {
        bail!("Token must not be empty");
    }

    credentials::save_token(config.base_path(), token)
        .with_context(|| format!("Failed to save token in {}", config.base_path().display()))?;

    println!("token saved in {}", config.base_path().display());
    Ok(())
}
