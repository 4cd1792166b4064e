//! qiniu-uploader - resumable uploads to object storage from the command line

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use qiniu_uploader::config::{Config, ConfigOptions};
use qiniu_uploader::upload::{
    FileRecoveryStore, NoopRecoveryStore, RecoveryStore, ResumablePolicy, UploadDispatcher,
    UploadRequest, UploadSource,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(ValueEnum, Debug, Copy, Clone)]
enum PolicyArg {
    Auto,
    Always,
    Never,
}

impl From<PolicyArg> for ResumablePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Auto => ResumablePolicy::Auto,
            PolicyArg::Always => ResumablePolicy::Always,
            PolicyArg::Never => ResumablePolicy::Never,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "qiniu-uploader")]
#[command(about = "Resumable chunked uploads to object storage")]
struct Cli {
    #[command(flatten)]
    service: ServiceArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ServiceArgs {
    /// Primary upload endpoint
    #[arg(long)]
    up_url: String,

    /// Backup upload endpoints, tried in order
    #[arg(long = "backup-url")]
    backup_urls: Vec<String>,

    /// Force https (true) or http (false) for endpoints
    #[arg(long)]
    use_https: Option<bool>,

    /// Block size in bytes (multiple of 4 MiB)
    #[arg(long)]
    block_size: Option<u64>,

    /// Payloads above this many bytes use chunked upload
    #[arg(long)]
    upload_threshold: Option<u64>,

    /// Days a progress record stays usable
    #[arg(long)]
    record_freshness_days: Option<u64>,

    #[arg(long)]
    request_timeout_secs: Option<u64>,

    #[arg(long)]
    tries_per_url: Option<usize>,

    /// Base delay for exponential backoff between retries
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    /// Directory for progress records
    #[arg(long)]
    recorder_dir: Option<PathBuf>,

    /// Do not persist or reuse progress records
    #[arg(long)]
    no_resume: bool,
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Upload token
    #[arg(long)]
    token: String,

    /// Bucket (defaults to the token's scope)
    #[arg(long)]
    bucket: Option<String>,

    /// Object key (defaults to the key derived from the token)
    #[arg(long)]
    key: Option<String>,

    /// File to upload; stdin when omitted
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file or stdin
    Upload {
        #[command(flatten)]
        target: TargetArgs,

        /// Custom metadata, repeatable
        #[arg(long = "meta", value_parser = parse_meta)]
        meta: Vec<(String, String)>,

        #[arg(long)]
        mime_type: Option<String>,

        /// When to use chunked upload
        #[arg(long, value_enum, default_value = "auto")]
        policy: PolicyArg,

        /// Skip per-request checksums
        #[arg(long)]
        no_checksum: bool,

        /// Size of stdin input in bytes, when known
        #[arg(long)]
        size: Option<u64>,
    },
    /// Abort a persisted chunked upload
    Abort {
        #[command(flatten)]
        target: TargetArgs,
    },
}

fn parse_meta(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

fn build_dispatcher(args: &ServiceArgs) -> Result<UploadDispatcher> {
    let config = Config::new(
        args.up_url.clone(),
        ConfigOptions {
            backup_urls: args.backup_urls.clone(),
            use_https: args.use_https,
            block_size: args.block_size,
            upload_threshold: args.upload_threshold,
            record_freshness_days: args.record_freshness_days,
            request_timeout_secs: args.request_timeout_secs,
            tries_per_url: args.tries_per_url,
            retry_delay_ms: args.retry_delay_ms,
        },
    )?;

    let store: Arc<dyn RecoveryStore> = if args.no_resume {
        Arc::new(NoopRecoveryStore)
    } else {
        match &args.recorder_dir {
            Some(dir) => Arc::new(FileRecoveryStore::new(dir)?),
            None => Arc::new(FileRecoveryStore::in_temp_dir()?),
        }
    };

    Ok(UploadDispatcher::new(config, store)?)
}

fn base_request(target: &TargetArgs) -> UploadRequest {
    let mut request = UploadRequest::new(target.token.clone());
    request.bucket = target.bucket.clone();
    request.key = target.key.clone();
    request
}

async fn run(cli: Cli) -> Result<()> {
    let dispatcher = build_dispatcher(&cli.service)?;

    match cli.command {
        Command::Upload {
            target,
            meta,
            mime_type,
            policy,
            no_checksum,
            size,
        } => {
            let mut request = base_request(&target)
                .policy(policy.into())
                .disable_checksum(no_checksum);
            request.meta.extend(meta);
            request.mime_type = mime_type;

            let result = match &target.file {
                Some(path) => dispatcher.upload_file(path, request).await?,
                None => {
                    let source = UploadSource::sequential(tokio::io::stdin());
                    dispatcher.upload_stream(source, size, request).await?
                }
            };

            info!("Uploaded {} (hash {})", result.key, result.hash);
            println!("{}", serde_json::to_string(&result)?);
        }
        Command::Abort { target } => {
            let request = base_request(&target);
            if dispatcher.abort(&request, target.file.as_deref()).await? {
                info!("Upload session aborted");
            } else {
                return Err(anyhow!("no persisted upload session to abort"));
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr, stdout carries the upload result
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("Upload failed: {}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
