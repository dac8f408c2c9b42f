//! Metric recording helpers
//!
//! - `token_refresh_total` (counter): label `outcome`
//!   (`success`, `failed`, `timeout`, `missing_access_token`)
//! - `token_cache_entries` (gauge): shared token sources currently cached
//! - `token_background_giveups_total` (counter): background loops that stopped
//!
//! Without an installed recorder every call is a no-op.

/// Record the outcome of one refresh attempt.
pub fn record_refresh(outcome: &'static str) {
    ::metrics::counter!("token_refresh_total", "outcome" => outcome).increment(1);
}

pub fn set_cache_entries(entries: usize) {
    ::metrics::gauge!("token_cache_entries").set(entries as f64);
}

pub fn record_giveup() {
    ::metrics::counter!("token_background_giveups_total").increment(1);
}
