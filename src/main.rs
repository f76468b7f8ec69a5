use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ui_capture_agent::browser::BrowserSession;
use ui_capture_agent::config::{Settings, task_slug};
use ui_capture_agent::orchestrator::{LoopPolicy, Orchestrator};
use ui_capture_agent::planner::OllamaPlanner;
use ui_capture_agent::report;
use ui_capture_agent::vision::OllamaVision;

/// Automate a web UI task with a vision model and a reasoning model driving
/// a real browser.
#[derive(Debug, Parser)]
#[command(name = "ui-capture-agent", version, about)]
struct Args {
    /// Task description (e.g. "Create a project in Linear").
    #[arg(long)]
    task: String,

    /// Initial URL to start from.
    #[arg(long)]
    url: Option<String>,

    /// Task name for data storage (default: derived from the description).
    #[arg(long = "task-name")]
    task_name: Option<String>,

    /// Path to the settings file.
    #[arg(long, default_value = "configs/settings.yaml")]
    config: PathBuf,

    /// Skip rendering the HTML run report.
    #[arg(long)]
    no_report: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();
    let settings = Settings::load_or_default(&args.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.logging.level.clone())),
        )
        .init();

    info!("starting ui capture agent");

    let task_name = args
        .task_name
        .clone()
        .unwrap_or_else(|| task_slug(&args.task));
    let data_dir = PathBuf::from(&settings.web.data_dir);

    // Chrome startup is blocking and can take a while.
    info!("launching browser");
    let web_settings = settings.web.clone();
    let browser = tokio::task::spawn_blocking(move || BrowserSession::launch(&web_settings))
        .await
        .context("browser launch task panicked")??;
    let browser = Arc::new(browser);

    let describer = Arc::new(OllamaVision::new(&settings.vision)?);
    let planner = Arc::new(OllamaPlanner::new(&settings.reasoning)?);

    let mut orchestrator = Orchestrator::new(
        &task_name,
        browser,
        describer,
        planner,
        LoopPolicy::from_settings(&settings),
        &data_dir,
    )?;

    // The loop catches its own failures; the result always comes back, and
    // the browser session tears Chrome down when it drops.
    let result = orchestrator.run_task(&args.task, args.url.as_deref()).await;

    if !args.no_report {
        match report::generate(orchestrator.run_dir()) {
            Ok(path) => info!(path = %path.display(), "run report written"),
            Err(e) => warn!(error = %e, "run report generation failed"),
        }
    }

    println!("\n{}", "=".repeat(50));
    println!("Task Execution Summary");
    println!("{}", "=".repeat(50));
    println!("Task: {}", result.task);
    println!("Completed: {}", result.completed);
    println!("Steps: {}", result.steps);
    if let Some(error) = &result.error {
        println!("Error: {error}");
        error!(error = %error, "task did not complete");
    }
    println!("{}", "=".repeat(50));

    Ok(())
}
