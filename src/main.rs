//! BucketSync CLI
//!
//! Synchronizes local directories with S3-compatible buckets.

use anyhow::{anyhow, Context};
use bucketsync::config::{ClientConfig, CliArgs, Commands, ObjectParams, OutputFormat, SyncOptions};
use bucketsync::core::{Observable, TaskHandle};
use bucketsync::progress::{ProgressReporter, ProgressView, Report, Unit};
use bucketsync::storage::{parse_s3_url, NativeS3Config, NativeS3Store};
use bucketsync::SyncClient;
use clap::Parser;
use serde::Serialize;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let default_level = match (args.quiet, args.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("bucketsync={}", default_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(args).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    let config = ClientConfig::from_cli(&args)?;
    if args.verbose > 0 {
        print_config(&config);
    }

    let store = NativeS3Store::new(NativeS3Config {
        region: args.region.clone(),
        endpoint_url: args.endpoint.clone(),
        force_path_style: args.path_style,
        ..Default::default()
    })
    .await
    .context("Failed to create S3 client")?;
    let client = SyncClient::new(Arc::new(store), config)?;

    match &args.command {
        Commands::Up {
            local_dir,
            remote,
            delete_removed,
            no_follow_symlinks,
            default_content_type,
        } => {
            let (bucket, prefix) = s3_location(remote)?;
            let mut options = SyncOptions::new()
                .delete_removed(*delete_removed)
                .follow_symlinks(!*no_follow_symlinks);
            if let Some(content_type) = default_content_type {
                options = options.default_content_type(content_type.clone());
            }
            let handle = client.sync_up(local_dir, &bucket, &prefix, options);
            let summary = track(&args, handle, Unit::Bytes).await?;
            emit(&args, &summary)
        }
        Commands::Down {
            remote,
            local_dir,
            delete_removed,
            no_follow_symlinks,
        } => {
            let (bucket, prefix) = s3_location(remote)?;
            let options = SyncOptions::new()
                .delete_removed(*delete_removed)
                .follow_symlinks(!*no_follow_symlinks);
            let handle = client.sync_down(local_dir, &bucket, &prefix, options);
            let summary = track(&args, handle, Unit::Bytes).await?;
            emit(&args, &summary)
        }
        Commands::Put {
            local_file,
            remote,
            content_type,
        } => {
            let (bucket, key) = s3_location(remote)?;
            let params = ObjectParams {
                content_type: content_type.clone(),
                ..Default::default()
            };
            let handle = client.upload_file(local_file, &bucket, &key, params);
            let outcome = track(&args, handle, Unit::Bytes).await?;
            emit(&args, &outcome)
        }
        Commands::Get { remote, local_file } => {
            let (bucket, key) = s3_location(remote)?;
            let handle = client.download_file(&bucket, &key, local_file);
            let outcome = track(&args, handle, Unit::Bytes).await?;
            emit(&args, &outcome)
        }
        Commands::Ls { remote, recursive } => {
            let (bucket, prefix) = s3_location(remote)?;
            list(&args, &client, &bucket, &prefix, *recursive).await
        }
        Commands::Rm { remote } => {
            let (bucket, prefix) = s3_location(remote)?;
            let handle = client.delete_tree(&bucket, &prefix);
            let summary = track(&args, handle, Unit::Keys).await?;
            emit(&args, &summary)
        }
    }
}

fn s3_location(url: &str) -> anyhow::Result<(String, String)> {
    parse_s3_url(url).ok_or_else(|| anyhow!("Expected s3://bucket/path, got '{}'", url))
}

async fn track<S, T>(args: &CliArgs, handle: TaskHandle<S, T>, unit: Unit) -> anyhow::Result<T>
where
    S: Observable,
    S::Snapshot: ProgressView,
    T: Send + 'static,
{
    let reporter = if args.progress && !args.quiet {
        ProgressReporter::new(unit)
    } else {
        ProgressReporter::disabled(unit)
    };

    let state = Arc::clone(handle.state());
    tokio::select! {
        result = reporter.track(handle) => Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, cancelling");
            state.cancel_flag().cancel();
            Err(anyhow!("Interrupted"))
        }
    }
}

fn emit<R: Report + Serialize>(args: &CliArgs, report: &R) -> anyhow::Result<()> {
    if args.quiet {
        return Ok(());
    }
    match args.output_format {
        OutputFormat::Text => println!("{}", report.render_text()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

async fn list(
    args: &CliArgs,
    client: &SyncClient,
    bucket: &str,
    prefix: &str,
    recursive: bool,
) -> anyhow::Result<()> {
    #[derive(Serialize)]
    struct Entry {
        key: String,
        size: Option<u64>,
        checksum: Option<String>,
        last_modified: Option<String>,
    }

    let mut listing = client.list_objects(bucket, prefix, recursive);
    let mut entries = Vec::new();
    while let Some(batch) = listing.next_batch().await {
        let batch = batch.with_context(|| format!("Listing s3://{}/{}", bucket, prefix))?;
        entries.extend(batch.common_prefixes.into_iter().map(|p| Entry {
            key: p,
            size: None,
            checksum: None,
            last_modified: None,
        }));
        entries.extend(batch.objects.into_iter().map(|o| Entry {
            key: o.full_key,
            size: Some(o.size),
            checksum: o.checksum,
            last_modified: o.last_modified.map(|t| t.to_rfc3339()),
        }));
    }

    match args.output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Text => {
            for entry in &entries {
                match entry.size {
                    Some(size) => println!(
                        "{:>25} {:>12} {}",
                        entry.last_modified.as_deref().unwrap_or("-"),
                        humansize::format_size(size, humansize::BINARY),
                        entry.key
                    ),
                    None => println!("{:>25} {:>12} {}", "", "PRE", entry.key),
                }
            }
        }
    }
    Ok(())
}

fn print_config(config: &ClientConfig) {
    eprintln!("=== Configuration ===");
    eprintln!("Max requests:       {}", config.max_concurrent_requests);
    eprintln!(
        "Retries:            {} (delay {})",
        config.retry_attempts,
        humantime::format_duration(config.retry_delay)
    );
    eprintln!(
        "Multipart:          at {} in {} parts",
        humansize::format_size(config.multipart_upload_threshold, humansize::BINARY),
        humansize::format_size(config.multipart_upload_size, humansize::BINARY)
    );
    eprintln!("Hash concurrency:   {}", config.hash_concurrency);
    eprintln!();
}
