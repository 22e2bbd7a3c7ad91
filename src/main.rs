use anyhow::{bail, Context};
use clap::Parser;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::info;

use studio_relay::batch::generate_all;
use studio_relay::cli::{Cli, Command, RequestArgs};
use studio_relay::clock::SystemClock;
use studio_relay::config::AppConfig;
use studio_relay::constants::IMGBB_KEY;
use studio_relay::core::{Capability, GenerationRequest, GenerationResult, Payload};
use studio_relay::credentials::{CredentialStore, EnvCredentials};
use studio_relay::engine::Dispatcher;
use studio_relay::persist::{JsonlStore, Persistence, RecordQuery};
use studio_relay::platforms::{plan_platform_requests, PLATFORMS};
use studio_relay::progress::{Progress, ProgressScope};
use studio_relay::providers::builtin_adapters;
use studio_relay::registry::ProviderRegistry;
use studio_relay::sink::ImgbbSink;
use studio_relay::transport::{ReqwestTransport, Transport};
use studio_relay::utils::{ensure_dir, extension_for_mime, slugify};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let (tx, rx) = mpsc::unbounded_channel::<Progress>();
    let printer = tokio::spawn(print_progress(rx));
    // Provider calls use the blocking client, which must stay off the async workers.
    let outcome = tokio::task::spawn_blocking(move || run(cli, tx)).await?;
    printer.await?;
    outcome
}

async fn print_progress(mut rx: UnboundedReceiver<Progress>) {
    while let Some(progress) = rx.recv().await {
        if progress.finished || progress.scope == ProgressScope::Run {
            eprintln!("{progress}");
        }
    }
}

fn run(cli: Cli, tx: UnboundedSender<Progress>) -> anyhow::Result<()> {
    let cfg = AppConfig::load(cli.config.as_deref())?;
    if let Some(source) = &cfg.source {
        info!(config = %source.display(), "loaded configuration");
    }
    match cli.cmd {
        Command::Generate {
            capability,
            prompt,
            request,
            duration,
            voice,
            system,
            temperature,
            structured,
            download,
            output_dir,
        } => {
            let mut req = build_request(capability, &prompt, &request)?;
            if let Some(seconds) = duration {
                req = req.with_duration(seconds);
            }
            if let Some(voice) = voice {
                req = req.with_voice(voice);
            }
            if let Some(system) = system {
                req = req.with_system(system);
            }
            if let Some(temperature) = temperature {
                req = req.with_temperature(temperature);
            }
            if structured {
                req = req.structured();
            }

            let dispatcher = build_dispatcher(&cfg)?;
            let out_dir = output_dir.unwrap_or_else(|| cfg.output_dir.clone());
            let outcome = dispatcher.execute(&req);
            let mut files = Vec::new();
            let status = match outcome {
                Ok(result) => {
                    print_attempts(&result);
                    let stem = format!("{}-{}", capability, &req.fingerprint()[..12]);
                    if let Some(path) =
                        save_result(&dispatcher, &result, &out_dir, &stem, download)?
                    {
                        println!("{}", path.display());
                        files.push(path);
                    }
                    Ok(())
                }
                Err(err) => Err(anyhow::Error::new(err)),
            };
            write_run_summary(&dispatcher, &cfg, &out_dir, "generate", &files)?;
            status?;
        }
        Command::Campaign {
            prompt,
            request,
            platforms,
            workers,
            output_dir,
        } => {
            let base = build_request(Capability::Image, &prompt, &request)?;
            let keys = if platforms.is_empty() {
                PLATFORMS.iter().map(|p| p.key.to_string()).collect()
            } else {
                platforms
            };
            let (planned, unknown) = plan_platform_requests(&base, &keys);
            if !unknown.is_empty() {
                bail!(
                    "Unknown platform(s): {}. Known: {}",
                    unknown.join(", "),
                    PLATFORMS.iter().map(|p| p.key).collect::<Vec<_>>().join(", ")
                );
            }

            let dispatcher = build_dispatcher(&cfg)?;
            let out_dir = output_dir.unwrap_or_else(|| cfg.output_dir.clone());
            let results = generate_all(
                &dispatcher,
                planned,
                workers.unwrap_or(cfg.workers),
                Some(&tx),
            )?;
            let mut files = Vec::new();
            let mut failed = 0;
            for (key, outcome) in &results {
                match outcome {
                    Ok(result) => {
                        if let Some(path) =
                            save_result(&dispatcher, result, &out_dir, &slugify(key), false)?
                        {
                            println!("{key}\t{}\t{}", result.provider_id, path.display());
                            files.push(path);
                        }
                    }
                    Err(err) => {
                        failed += 1;
                        println!("{key}\tFAILED\t{err}");
                    }
                }
            }
            write_run_summary(&dispatcher, &cfg, &out_dir, "campaign", &files)?;
            if failed == results.len() && failed > 0 {
                bail!("every platform target failed");
            }
        }
        Command::Providers { capability, json } => {
            let registry = build_registry(&cfg, Arc::new(EnvCredentials::new()));
            let rows = registry.eligibility(capability);
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in rows {
                    let caps = row
                        .capabilities
                        .iter()
                        .map(Capability::as_str)
                        .collect::<Vec<_>>()
                        .join(",");
                    println!(
                        "{:<20} {:<8} {:<6} {} ({})",
                        row.id,
                        caps,
                        if row.synchronous { "sync" } else { "async" },
                        row.credential,
                        if row.credential_present { "set" } else { "missing" }
                    );
                }
            }
        }
        Command::Track {
            provider,
            job_id,
            capability,
            download,
            output_dir,
        } => {
            let dispatcher = build_dispatcher(&cfg)?;
            let result = dispatcher.resume(&provider, &job_id, capability)?;
            let out_dir = output_dir.unwrap_or_else(|| cfg.output_dir.clone());
            let stem = format!("{}-{}", slugify(&provider), slugify(&job_id));
            if let Some(path) = save_result(&dispatcher, &result, &out_dir, &stem, download)? {
                println!("{}", path.display());
            }
        }
        Command::History {
            capability,
            provider,
            limit,
            json,
        } => {
            let Some(path) = cfg.persistence.clone() else {
                bail!("No persistence path configured; set `persistence:` in the config file");
            };
            let store = JsonlStore::new(path);
            let records = store.query(&RecordQuery {
                capability,
                provider_id: provider,
                fingerprint: None,
                limit: Some(limit),
            })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for record in records {
                    println!(
                        "{}  {:<7} {:<20} {:<10} {}",
                        record
                            .created_at
                            .format(&time::format_description::well_known::Rfc3339)
                            .unwrap_or_default(),
                        record.capability,
                        record.provider_id,
                        bytesize::ByteSize(record.payload_bytes as u64),
                        truncate(&record.prompt, 60)
                    );
                }
            }
        }
    }
    Ok(())
}

fn build_request(
    capability: Capability,
    prompt: &str,
    args: &RequestArgs,
) -> anyhow::Result<GenerationRequest> {
    let mut request = GenerationRequest::new(capability, prompt).prefer(args.prefer.clone());
    if let Some(aspect) = &args.aspect {
        request = request.with_aspect_ratio(aspect.clone());
    }
    if let Some(path) = &args.reference {
        let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let mime = mime_guess::from_path(path)
            .first()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|| "image/png".to_string());
        request = request.with_reference_image(data, mime);
    }
    Ok(request)
}

fn build_registry(cfg: &AppConfig, credentials: Arc<dyn CredentialStore>) -> ProviderRegistry {
    ProviderRegistry::new(
        builtin_adapters(&cfg.endpoints),
        cfg.priorities.clone(),
        credentials,
    )
}

fn build_dispatcher(cfg: &AppConfig) -> anyhow::Result<Dispatcher> {
    let credentials = Arc::new(EnvCredentials::new());
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new()?);
    let registry = build_registry(cfg, credentials.clone());
    let mut dispatcher = Dispatcher::new(
        Arc::new(registry),
        transport.clone(),
        Arc::new(SystemClock),
        cfg.orchestrator(),
    );
    if let Some(key) = credentials.get(IMGBB_KEY) {
        dispatcher = dispatcher.with_sink(Arc::new(ImgbbSink::new(transport, key)));
    }
    if let Some(path) = &cfg.persistence {
        let store: Arc<dyn Persistence> = Arc::new(JsonlStore::new(path.clone()));
        dispatcher = dispatcher.with_persistence(store);
    }
    Ok(dispatcher)
}

fn print_attempts(result: &GenerationResult) {
    for attempt in &result.attempts {
        let status = match &attempt.outcome {
            studio_relay::core::AttemptOutcome::Succeeded => "ok".to_string(),
            studio_relay::core::AttemptOutcome::Failed { class, message } => {
                format!("{class}: {message}")
            }
        };
        eprintln!("  {} (tries: {}) {}", attempt.provider_id, attempt.tries, status);
    }
}

fn save_result(
    dispatcher: &Dispatcher,
    result: &GenerationResult,
    out_dir: &Path,
    stem: &str,
    download: bool,
) -> anyhow::Result<Option<PathBuf>> {
    let payload = match &result.payload {
        Payload::Uri(uri) if !download => {
            println!("{uri}");
            return Ok(None);
        }
        Payload::Uri(_) => dispatcher.download(result)?,
        other => other.clone(),
    };
    ensure_dir(out_dir)?;
    let (path, bytes) = match payload {
        Payload::Text(text) => (out_dir.join(format!("{stem}.txt")), text.into_bytes()),
        Payload::Structured(value) => (
            out_dir.join(format!("{stem}.json")),
            serde_json::to_vec_pretty(&value)?,
        ),
        Payload::Bytes { data, mime } => (
            out_dir.join(format!("{stem}.{}", extension_for_mime(&mime))),
            data,
        ),
        Payload::Uri(uri) => bail!("download of {uri} returned another URI"),
    };
    fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(Some(path))
}

fn write_run_summary(
    dispatcher: &Dispatcher,
    cfg: &AppConfig,
    out_dir: &Path,
    label: &str,
    files: &[PathBuf],
) -> anyhow::Result<()> {
    let stamp = OffsetDateTime::now_utc().unix_timestamp();
    let run_dir = out_dir.join("runs");
    let summary_path = run_dir.join(format!("{label}-{stamp}.json"));
    let events_path = run_dir.join(format!("{label}-{stamp}.ndjson"));
    dispatcher.monitor().note_event(
        "run.config",
        json!({"workers": cfg.workers, "retry_attempts": cfg.retry.max_attempts}),
    );
    dispatcher.monitor().flush_summary(
        &summary_path,
        label,
        files,
        dispatcher.quota().limits(),
        Some(&events_path),
    )?;
    info!(summary = %summary_path.display(), "wrote run summary");
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        format!("{}…", text.chars().take(max).collect::<String>())
    }
}
