//! The fetch → metadata → rootfs → assemble pipeline.
//!
//! One run converts one image. Stages run strictly in sequence, the first
//! error ends the run, and scratch directories are removed whether the run
//! succeeded or not.

use anyhow::{Context, Result};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::assemble::{self, ArtifactConfig, AssemblyPaths};
use crate::fetch::{self, ImageSource};
use crate::image::{MetadataSource, RootfsSource};
use crate::metadata;
use crate::rootfs;
use crate::timing::{self, StageClock};
use crate::tools::Toolchain;
use crate::workspace::BuildPaths;

/// Suffix appended to the source reference when no metadata ref is given.
pub const META_REF_SUFFIX: &str = "-meta";

/// Lifecycle stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Fetching,
    BuildingMetadata,
    BuildingRootfs,
    Assembling,
    CleaningUp,
    Done,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::Fetching => "fetching",
            Stage::BuildingMetadata => "building metadata image",
            Stage::BuildingRootfs => "building rootfs",
            Stage::Assembling => "assembling",
            Stage::CleaningUp => "cleaning up",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What to convert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub source: ImageSource,
    /// Reference the metadata image is tagged with.
    pub meta_ref: String,
}

impl BuildRequest {
    /// `meta_ref` defaults to `<reference>-meta`.
    pub fn new(source: ImageSource, meta_ref: Option<String>) -> Self {
        let meta_ref = meta_ref
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| default_meta_ref(&source.reference));
        Self { source, meta_ref }
    }
}

pub fn default_meta_ref(reference: &str) -> String {
    format!("{}{}", reference, META_REF_SUFFIX)
}

/// Knobs that are not part of the request itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub meta_layer_url: String,
    pub architecture: String,
}

/// A finished external image.
#[derive(Debug, Clone)]
pub struct ExternalImage {
    pub config: ArtifactConfig,
    pub rootfs_archive: PathBuf,
    pub metadata_archive: PathBuf,
}

/// Drives one conversion.
pub struct Pipeline<'a> {
    tools: Toolchain<'a>,
    paths: BuildPaths,
    options: PipelineOptions,
    stage: Stage,
    history: Vec<Stage>,
    clock: StageClock,
}

impl<'a> Pipeline<'a> {
    pub fn new(tools: Toolchain<'a>, paths: BuildPaths, options: PipelineOptions) -> Self {
        Self {
            tools,
            paths,
            options,
            stage: Stage::Init,
            history: Vec::new(),
            clock: StageClock::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Every stage entered so far, in order.
    pub fn history(&self) -> &[Stage] {
        &self.history
    }

    /// How long each finished stage took, in the order they ran.
    pub fn timings(&self) -> &[(Stage, Duration)] {
        self.clock.durations()
    }

    pub fn paths(&self) -> &BuildPaths {
        &self.paths
    }

    fn enter(&mut self, stage: Stage) {
        if let Some((finished, spent)) = self.clock.enter(stage) {
            tracing::info!("[{}] {}", timing::format_elapsed(spent), finished);
        }
        tracing::info!("==> {}", stage);
        self.stage = stage;
        self.history.push(stage);
    }

    /// Run the whole conversion.
    pub fn run(&mut self, request: &BuildRequest) -> Result<ExternalImage> {
        self.enter(Stage::Init);
        let result = self
            .paths
            .prepare()
            .context("failed to prepare the work directory")
            .and_then(|()| self.convert(request));

        self.enter(Stage::CleaningUp);
        let failures = self.paths.cleanup_scratch();
        if failures > 0 {
            tracing::warn!("{} scratch directories could not be removed", failures);
        }

        match result {
            Ok(image) => {
                self.enter(Stage::Done);
                tracing::info!(
                    "External image built in {}",
                    timing::format_elapsed(self.clock.total())
                );
                Ok(image)
            }
            Err(e) => {
                let failed_in = self
                    .history
                    .iter()
                    .rev()
                    .nth(1)
                    .copied()
                    .unwrap_or(Stage::Init);
                self.enter(Stage::Failed);
                Err(e.context(format!("external image build failed while {}", failed_in)))
            }
        }
    }

    fn convert(&mut self, request: &BuildRequest) -> Result<ExternalImage> {
        self.enter(Stage::Fetching);
        let origin = fetch::fetch_origin(self.tools.transfer, &request.source, &self.paths.raw)?;
        let (metadata_source, rootfs_source) = origin.split();

        self.enter(Stage::BuildingMetadata);
        self.build_metadata(metadata_source, &request.meta_ref)?;

        self.enter(Stage::BuildingRootfs);
        let merged = self.build_rootfs(&rootfs_source)?;

        self.enter(Stage::Assembling);
        let metadata_archive = self.paths.metadata_tar();
        let config_path = self.paths.config_json();
        let identity_path = self.paths.identity_file();
        let config = assemble::assemble_artifact(
            &AssemblyPaths {
                metadata_archive: &metadata_archive,
                config: &config_path,
                identity: &identity_path,
            },
            &request.meta_ref,
            &merged.identity,
            &self.options.architecture,
        )?;

        Ok(ExternalImage {
            config,
            rootfs_archive: merged.archive,
            metadata_archive,
        })
    }

    fn build_metadata(&self, source: MetadataSource, meta_ref: &str) -> Result<()> {
        let image = metadata::build_metadata_image(
            self.tools.downloader,
            source,
            &self.paths.metadata,
            &self.options.meta_layer_url,
        )?;
        metadata::export_metadata_archive(
            self.tools.transfer,
            &image,
            &self.paths.metadata_tar(),
            meta_ref,
        )
    }

    fn build_rootfs(&self, source: &RootfsSource) -> Result<rootfs::MergedRootfs> {
        rootfs::merge_layers(self.tools.layers, source, &self.paths.merge_paths())
            .context("Failed to flatten layers")
    }
}
