//! Metrics for observability.
//!
//! All metrics are prefixed with `relay_`; counters end in `_total`. Without
//! an installed recorder every call is a no-op, so the library can be used
//! (and tested) without an exporter.

#![allow(clippy::cast_precision_loss)]

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Record items accepted into the queue for a kind.
pub fn record_items_submitted(kind: &str, count: usize) {
    counter!("relay_items_submitted_total", "kind" => kind.to_string()).increment(count as u64);
}

/// Record a rejected submission by gRPC status code.
pub fn record_submission_rejected(code: &str) {
    counter!("relay_submissions_rejected_total", "code" => code.to_string()).increment(1);
}

/// Record current queue depth.
pub fn record_queue_depth(depth: usize) {
    gauge!("relay_queue_depth").set(depth as f64);
}

/// Record a batch handed to the delivery channel.
pub fn record_batch_flushed(trigger: &str, items: usize, frame_bytes: usize) {
    counter!("relay_batches_flushed_total", "trigger" => trigger.to_string()).increment(1);
    counter!("relay_items_flushed_total").increment(items as u64);
    histogram!("relay_batch_items").record(items as f64);
    histogram!("relay_batch_frame_bytes").record(frame_bytes as f64);
}

/// Record a heartbeat frame sent.
pub fn record_heartbeat() {
    counter!("relay_heartbeats_total").increment(1);
}

/// Record the delivery channel state (0 disconnected, 1 connecting, 2 connected).
pub fn record_channel_state(state: u8) {
    gauge!("relay_channel_state").set(f64::from(state));
}

/// Record a connection attempt outcome.
pub fn record_connect_attempt(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("relay_connect_attempts_total", "status" => status).increment(1);
}

/// Record a session loss by reason.
pub fn record_disconnect(reason: &str) {
    counter!("relay_disconnects_total", "reason" => reason.to_string()).increment(1);
}

/// Record frames dropped because they did not fit the write buffer.
pub fn record_dropped(frames: usize, bytes: usize) {
    counter!("relay_dropped_frames_total").increment(frames as u64);
    counter!("relay_dropped_bytes_total").increment(bytes as u64);
}

/// Record bytes currently held in the write buffer.
pub fn record_buffered_bytes(bytes: usize) {
    gauge!("relay_write_buffer_bytes").set(bytes as f64);
}

/// Record the metadata lookup falling back to the placeholder.
pub fn record_metadata_fallback(reason: &str) {
    counter!("relay_metadata_fallbacks_total", "reason" => reason.to_string()).increment(1);
}

/// Record a credential refresh outcome.
pub fn record_credential_refresh(success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("relay_credential_refreshes_total", "status" => status).increment(1);
    histogram!("relay_credential_refresh_duration_seconds").record(duration.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_items_submitted("Pod", 3);
        record_submission_rejected("resource_exhausted");
        record_queue_depth(7);
        record_batch_flushed("count", 10, 1024);
        record_heartbeat();
        record_channel_state(2);
        record_connect_attempt(false);
        record_disconnect("io");
        record_dropped(1, 512);
        record_buffered_bytes(0);
        record_metadata_fallback("timeout");
        record_credential_refresh(true, Duration::from_millis(5));
    }
}
