//! Counter helpers that compile to no-ops without the `metrics` feature.

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_event(name: &'static str, event_type: &crate::types::EventType) {
    metrics::increment_counter!(name, "event_type" => event_type.as_str().to_string());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_event(_name: &'static str, _event_type: &crate::types::EventType) {}
