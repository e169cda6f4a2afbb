use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::Engine;
use clap::Parser;
use serde_json::Value as JsonValue;
use sieve_core::{RuleKind, RuleSet};
use sieve_runtime::{
    stream_channel, AnalysisRequest, BatchAnalyzer, BuiltinAdapterFactory, Capability,
    FileStorage, ImageOptions, LlmService, ProviderId, ServiceContext, Settings,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cli;

use cli::{CacheAction, Cli, Commands, SettingsAction};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "sieve_runtime=debug,sieve_core=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Validate { rules, file } => cmd_validate(&rules, file.as_deref()),
        Commands::Providers => {
            cmd_providers();
            Ok(())
        }
        command => {
            let storage = Arc::new(FileStorage::new(&cli.data_dir));
            let context = ServiceContext::new(storage.clone(), Arc::new(BuiltinAdapterFactory::new()));
            let service = Arc::new(LlmService::new(context).await);

            let result = run_with_service(command, &service, &storage).await;
            service.flush().await.context("saving analysis cache")?;
            result
        }
    }
}

async fn run_with_service(
    command: Commands,
    service: &Arc<LlmService>,
    storage: &FileStorage,
) -> Result<()> {
    match command {
        Commands::Analyze {
            text,
            criteria,
            kind,
        } => {
            let result = match RuleKind::from(kind) {
                RuleKind::Embedding => service.analyze_by_embedding(&text, &criteria, None).await?,
                _ => service.analyze_by_prompt(&text, &criteria, None).await?,
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
            log_usage(service, result.provider);
            Ok(())
        }
        Commands::Image { path, criteria } => {
            let bytes =
                std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let options = ImageOptions {
                mime_type: mime_type(&path).to_string(),
                ..ImageOptions::default()
            };
            let image = base64::engine::general_purpose::STANDARD.encode(bytes);
            let subject = path.display().to_string();

            let result = service
                .analyze_by_image(&image, &criteria, Some(&subject), &options)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            log_usage(service, result.provider);
            Ok(())
        }
        Commands::Stream { request, rules } => cmd_stream(service, &request, &rules).await,
        Commands::Cache { action } => match action {
            CacheAction::Stats => {
                println!("{}", serde_json::to_string_pretty(&service.cache().stats())?);
                Ok(())
            }
            CacheAction::Clear => {
                service.clear_cache().await?;
                println!("Cache cleared");
                Ok(())
            }
        },
        Commands::Settings { action } => match action {
            SettingsAction::Show => {
                let settings = Settings::load(storage).await;
                println!("{}", serde_json::to_string_pretty(&redacted(&settings)?)?);
                Ok(())
            }
            SettingsAction::Set { field, value } => {
                cmd_settings_set(service, storage, field, value).await
            }
        },
        Commands::Validate { .. } | Commands::Providers => Ok(()),
    }
}

fn load_rules(path: &Path) -> Result<RuleSet> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    );
    let rules = if is_yaml {
        RuleSet::from_yaml(&text)?
    } else {
        RuleSet::from_lines(&text)?
    };
    Ok(rules)
}

fn cmd_validate(rules: &[String], file: Option<&Path>) -> Result<()> {
    let mut invalid = 0;

    for rule in rules {
        match sieve_core::parse(rule) {
            Ok(parsed) => println!("ok     [{}] {}", parsed.kind(), parsed.rule_string),
            Err(e) => {
                invalid += 1;
                println!("error  {}: {}", rule, e);
            }
        }
    }

    if let Some(path) = file {
        let set = load_rules(path)?;
        for rule in set.rules() {
            let state = if rule.enabled { "ok" } else { "off" };
            println!("{:<6} {} [{}] {}", state, rule.id, rule.kind(), rule.rule_string);
        }
    }

    if invalid > 0 {
        bail!("{} invalid rule(s)", invalid);
    }
    Ok(())
}

async fn cmd_stream(service: &Arc<LlmService>, request: &Path, rules: &Path) -> Result<()> {
    let rules = load_rules(rules)?;
    let text = std::fs::read_to_string(request)
        .with_context(|| format!("reading {}", request.display()))?;
    let request: AnalysisRequest = serde_json::from_str(&text).context("parsing request")?;

    let (port, mut receiver) = stream_channel(32);
    let analyzer = BatchAnalyzer::new(service.clone());
    let task = tokio::spawn(async move { analyzer.analyze_stream(&rules, request, port).await });

    while let Some(message) = receiver.recv().await {
        println!("{}", serde_json::to_string(&message)?);
    }

    let summary = task.await.context("analyzer task panicked")?;
    tracing::info!(
        evaluated = summary.evaluated,
        matched = summary.matched,
        outcome = ?summary.outcome,
        "Stream finished"
    );
    Ok(())
}

async fn cmd_settings_set(
    service: &LlmService,
    storage: &FileStorage,
    field: String,
    raw: String,
) -> Result<()> {
    let settings = Settings::load(storage).await;
    let mut value = serde_json::to_value(&settings)?;
    let object = value
        .as_object_mut()
        .context("settings did not serialize to an object")?;
    if !object.contains_key(&field) {
        bail!("Unknown setting '{}'", field);
    }

    let parsed = serde_json::from_str(&raw).unwrap_or(JsonValue::String(raw));
    object.insert(field.clone(), parsed);
    let updated: Settings = serde_json::from_value(value)
        .with_context(|| format!("invalid value for '{}'", field))?;
    updated.normalized().save(storage).await?;

    let outcome = service.apply_settings_change().await?;
    if !outcome.models_changed.is_empty() {
        println!("Model changed for {:?}; cache cleared", outcome.models_changed);
    }
    println!("Updated {}", field);
    Ok(())
}

fn cmd_providers() {
    for provider in ProviderId::ALL {
        let capabilities: Vec<String> = [Capability::Embedding, Capability::Prompt, Capability::Vision]
            .into_iter()
            .filter(|c| provider.supports(*c))
            .map(|c| c.to_string())
            .collect();
        let credential = provider
            .credential()
            .map(|c| c.env_var)
            .unwrap_or("no key");
        println!(
            "{:<11} {:<16} {:<8} {}",
            provider.as_str(),
            provider.display_name(),
            credential,
            capabilities.join(", ")
        );
    }
}

fn redacted(settings: &Settings) -> Result<JsonValue> {
    let mut value = serde_json::to_value(settings)?;
    if let Some(object) = value.as_object_mut() {
        for (key, field) in object.iter_mut() {
            if key.ends_with("_api_key") && !field.is_null() {
                *field = JsonValue::String("[REDACTED]".to_string());
            }
        }
    }
    Ok(value)
}

fn log_usage(service: &LlmService, provider: ProviderId) {
    if let Some(usage) = service.provider_usage(provider) {
        tracing::info!(
            provider = %provider,
            calls = usage.calls,
            tokens = usage.total_tokens(),
            cost_usd = usage.cost_usd,
            "Provider usage"
        );
    }
}

fn mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}
