use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info};
use serde_json::Value;

use updates_interface::config::{REQUEST_HEADERS_KEY, RUNTIME_VERSION_KEY, UPDATE_URL_KEY};
use updates_interface::{
    Configuration, FetchEvent, FetchSettings, Manifest, UpdatesExternalInterface, UpdatesProvider,
    env, fetch_events,
};

#[derive(Parser, Debug)]
#[command(
    name = "updates-fetch",
    author,
    version,
    about = "Fetch an over-the-air update manifest and its assets into a local store"
)]
struct Cli {
    /// JSON file holding the fetch configuration object.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Manifest URL; overrides `updateUrl` from --config.
    #[arg(long)]
    url: Option<String>,
    /// Extra request header as NAME=VALUE. Repeatable.
    #[arg(long = "header", value_name = "NAME=VALUE")]
    headers: Vec<String>,
    /// Runtime version the update must target.
    #[arg(long)]
    runtime_version: Option<String>,
    /// Store directory. Defaults to a per-host directory under the user data dir.
    #[arg(long)]
    root: Option<PathBuf>,
    /// Print the manifest and reject it instead of downloading assets.
    #[arg(long)]
    dry_run: bool,
    /// Discard the stored update before fetching.
    #[arg(long)]
    reset: bool,
    /// Print the tool version and exit.
    #[arg(long)]
    version_only: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if cli.version_only {
        println!("updates-fetch {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let configuration = build_configuration(&cli)?;
    let settings = FetchSettings::from_configuration(&configuration).map_err(|e| e.to_string())?;
    let root = cli.root.clone().unwrap_or_else(|| {
        env::scoped_dir(settings.update_url.host_str().unwrap_or("default"))
    });
    info!("store: {}", root.display());

    let provider = Arc::new(UpdatesProvider::new(root));
    if cli.reset {
        provider.reset();
    }

    let mut bar: Option<ProgressBar> = None;
    let mut session = fetch_events(provider.clone(), configuration);
    while let Some(event) = session.next().await {
        match event {
            FetchEvent::ManifestReceived { manifest, decision } => {
                print_manifest(&manifest);
                decision.decide(!cli.dry_run);
            }
            FetchEvent::Progress(progress) => {
                let bar = bar.get_or_insert_with(|| {
                    ProgressBar::new(progress.total).with_style(progress_style())
                });
                bar.set_length(progress.total);
                bar.set_position(progress.finished());
                bar.set_message(format!("{} failed", progress.failed));
            }
            FetchEvent::Finished(Some(manifest)) => {
                if let Some(bar) = &bar {
                    bar.finish_and_clear();
                }
                info!("update {} stored", manifest.id().unwrap_or("?"));
                match provider.launch_asset_url() {
                    Some(url) => println!("{url}"),
                    None => debug!("no launch asset recorded"),
                }
                return Ok(());
            }
            FetchEvent::Finished(None) => {
                info!("manifest not applied");
                return Ok(());
            }
            FetchEvent::Failed(err) => {
                if let Some(bar) = &bar {
                    bar.abandon();
                }
                return Err(err.to_string());
            }
        }
    }
    Err("fetch ended without a result".into())
}

fn build_configuration(cli: &Cli) -> Result<Configuration, String> {
    let mut configuration = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("unable to read {}: {e}", path.display()))?;
            match serde_json::from_str::<Value>(&text)
                .map_err(|e| format!("config parse error: {e}"))?
            {
                Value::Object(map) => map,
                _ => return Err(format!("{} must hold a JSON object", path.display())),
            }
        }
        None => Configuration::new(),
    };

    if let Some(url) = &cli.url {
        configuration.insert(UPDATE_URL_KEY.into(), Value::String(url.clone()));
    }
    if let Some(runtime) = &cli.runtime_version {
        configuration.insert(RUNTIME_VERSION_KEY.into(), Value::String(runtime.clone()));
    }
    if !cli.headers.is_empty() {
        let headers = configuration
            .entry(REQUEST_HEADERS_KEY)
            .or_insert_with(|| Value::Object(Default::default()));
        let Value::Object(headers) = headers else {
            return Err(format!("`{REQUEST_HEADERS_KEY}` must be an object"));
        };
        for raw in &cli.headers {
            let (name, value) = raw
                .split_once('=')
                .ok_or_else(|| format!("header `{raw}` is not NAME=VALUE"))?;
            headers.insert(name.trim().to_owned(), Value::String(value.trim().to_owned()));
        }
    }
    Ok(configuration)
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner} assets {pos}/{len} [{bar:30}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn print_manifest(manifest: &Manifest) {
    println!("manifest {}", manifest.id().unwrap_or("?"));
    if let Some(created) = manifest.created_at() {
        println!("  created:  {created}");
    }
    if let Some(runtime) = manifest.runtime_version() {
        println!("  runtime:  {runtime}");
    }
    let assets = manifest
        .get("assets")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    println!("  assets:   {} + launch asset", assets);
}
