//! Shared fixtures for layerbox tests.
//!
//! - [`MockRegistry`]: in-memory [`layerbox::Registry`] writing fixed files
//! - [`RecordingRunner`]: [`layerbox::Runner`] that records calls and writes
//!   a marker file instead of executing anything
//! - [`blob`]: tar / tar.gz layer and manifest builders for registry tests
//! - [`BuildContext`]: temporary build context plus layer store

pub mod blob;
mod context;
mod registry;
mod runner;

pub use context::{BuildContext, EntryState};
pub use registry::MockRegistry;
pub use runner::{RecordedRun, RecordingRunner};
