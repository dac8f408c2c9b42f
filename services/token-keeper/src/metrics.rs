//! Prometheus metrics exposition
//!
//! The libraries record through the `metrics` facade (see
//! `token_source::metrics`); this module installs the recorder that turns
//! those calls into the text served on `/metrics`.

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and return a handle for rendering.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Number of configured accounts, refreshed or not.
pub fn set_accounts(count: usize) {
    metrics::gauge!("token_keeper_accounts").set(count as f64);
}
