//! extimg - external image builder.
//!
//! Converts a container image into a small metadata image plus a flattened
//! rootfs archive, and derives a stable identity for the pair.

pub mod assemble;
pub mod config;
pub mod digest;
pub mod fetch;
pub mod image;
pub mod metadata;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod rootfs;
pub mod timing;
pub mod tools;
pub mod workspace;

pub use pipeline::{BuildRequest, ExternalImage, Pipeline, PipelineOptions, Stage};
