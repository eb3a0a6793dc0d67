//! extimg - external image builder.
//!
//! Splits a container image into:
//! - `metadata.tar`: a tiny image carrying only the original configuration
//! - `rootfs.tar`: every layer merged into one filesystem tree
//! - `config.json` / `sha256`: the identity tying the two together

use anyhow::Result;
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use std::ffi::OsString;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use extimg::config::Settings;
use extimg::fetch::ImageSource;
use extimg::preflight;
use extimg::tools::{Curl, HostLayerTools, Skopeo, Toolchain};
use extimg::workspace::BuildPaths;
use extimg::{BuildRequest, Pipeline, PipelineOptions};

#[derive(Parser, Debug)]
#[command(name = "extimg")]
#[command(about = "External image builder")]
#[command(
    after_help = "EXAMPLE:\n  extimg -ref registry.example.com/cilium/cilium:1.13.1\n\nREQUIREMENTS:\n  skopeo, curl, tar, mount/umount, cp, mknod, setfattr; root for the overlay mount.\n  The source image must be present in the local docker daemon unless -src says otherwise."
)]
struct Cli {
    /// Source image to convert
    #[arg(long = "ref", value_name = "IMAGE")]
    reference: String,

    /// Name of the generated metadata image (default: <ref>-meta)
    #[arg(long = "mref", value_name = "IMAGE")]
    meta_ref: Option<String>,

    /// Source transport prefix (default: docker-daemon:)
    #[arg(long = "src", value_name = "PREFIX")]
    source_prefix: Option<String>,

    /// Directory to create build/ in (default: current directory)
    #[arg(long = "workdir", value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Don't check for host tools before starting
    #[arg(long)]
    skip_preflight: bool,
}

/// Accept `-ref value` as well as `--ref value`.
///
/// Any single-dash argument longer than one letter is treated as a long flag.
fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .enumerate()
        .map(|(i, arg)| {
            if i == 0 {
                return arg;
            }
            match arg.to_str() {
                Some(s) if s.len() > 2 && s.starts_with('-') && !s.starts_with("--") => {
                    OsString::from(format!("-{}", s))
                }
                _ => arg,
            }
        })
        .collect()
}

fn main() {
    // Load .env if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse_from(normalize_args(std::env::args_os()));
    if cli.reference.trim().is_empty() {
        Cli::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "no image to convert: -ref must not be empty",
            )
            .exit();
    }

    if let Err(e) = run(cli) {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut settings = Settings::from_env();
    if let Some(prefix) = cli.source_prefix.filter(|p| !p.is_empty()) {
        settings.source_prefix = prefix;
    }
    if let Some(dir) = cli.work_dir {
        settings.work_dir = dir;
    }
    settings.log();

    if !cli.skip_preflight {
        preflight::run_preflight_or_fail(&settings)?;
    }

    let skopeo = Skopeo::new(settings.skopeo.clone());
    let curl = Curl::new(settings.curl.clone());
    let layers = HostLayerTools;
    let tools = Toolchain {
        transfer: &skopeo,
        downloader: &curl,
        layers: &layers,
    };

    let request = BuildRequest::new(
        ImageSource::new(cli.reference, settings.source_prefix.clone()),
        cli.meta_ref,
    );
    let mut pipeline = Pipeline::new(
        tools,
        BuildPaths::new(&settings.work_dir),
        PipelineOptions {
            meta_layer_url: settings.meta_layer_url.clone(),
            architecture: settings.architecture.clone(),
        },
    );

    let image = pipeline.run(&request)?;
    tracing::info!(
        id = %image.config.id,
        rootfs = %image.rootfs_archive.display(),
        metadata = %image.metadata_archive.display(),
        "External image ready"
    );
    Ok(())
}
