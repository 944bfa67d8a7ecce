pub mod bag;
pub mod config;
pub mod domain;
pub mod error;
pub mod fasta;
pub mod format;
pub mod fs_util;
pub mod manifest;
pub mod media;
pub mod output;
pub mod pipeline;
pub mod provenance;
pub mod session;
pub mod store;
