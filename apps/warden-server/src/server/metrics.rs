use std::{collections::HashMap, fmt::Write as _};

use super::core::{MetricsState, METRICS_STATE};

pub(crate) fn metrics_state() -> &'static MetricsState {
    METRICS_STATE.get_or_init(MetricsState::default)
}

pub(crate) fn render_metrics() -> String {
    let auth_failures = metrics_state()
        .auth_failures
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let rate_limit_hits = metrics_state()
        .rate_limit_hits
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let stream_disconnects = metrics_state()
        .stream_disconnects
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let events_emitted = metrics_state()
        .events_emitted
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let events_dropped = metrics_state()
        .events_dropped
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let queries_executed = metrics_state()
        .queries_executed
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let slow_queries = metrics_state()
        .slow_queries
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());

    let mut output = String::new();
    output.push_str("# HELP warden_auth_failures_total Count of auth-related failures by reason\n");
    output.push_str("# TYPE warden_auth_failures_total counter\n");
    let mut auth_entries: Vec<_> = auth_failures.into_iter().collect();
    auth_entries.sort_by_key(|(reason, _)| *reason);
    for (reason, value) in auth_entries {
        let _ = writeln!(
            output,
            "warden_auth_failures_total{{reason=\"{reason}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP warden_rate_limit_hits_total Count of rate-limit rejections by surface\n",
    );
    output.push_str("# TYPE warden_rate_limit_hits_total counter\n");
    let mut rate_entries: Vec<_> = rate_limit_hits.into_iter().collect();
    rate_entries.sort_by_key(|((surface, reason), _)| (*surface, *reason));
    for ((surface, reason), value) in rate_entries {
        let _ = writeln!(
            output,
            "warden_rate_limit_hits_total{{surface=\"{surface}\",reason=\"{reason}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP warden_stream_disconnects_total Count of event-stream disconnects by reason\n",
    );
    output.push_str("# TYPE warden_stream_disconnects_total counter\n");
    let mut disconnect_entries: Vec<_> = stream_disconnects.into_iter().collect();
    disconnect_entries.sort_by_key(|(reason, _)| *reason);
    for (reason, value) in disconnect_entries {
        let _ = writeln!(
            output,
            "warden_stream_disconnects_total{{reason=\"{reason}\"}} {value}"
        );
    }

    output.push_str("# HELP warden_events_emitted_total Count of emitted stream events by type\n");
    output.push_str("# TYPE warden_events_emitted_total counter\n");
    let mut emitted_entries: Vec<_> = events_emitted.into_iter().collect();
    emitted_entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (event_type, value) in emitted_entries {
        let _ = writeln!(
            output,
            "warden_events_emitted_total{{event_type=\"{event_type}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP warden_events_dropped_total Count of dropped stream events by type and reason\n",
    );
    output.push_str("# TYPE warden_events_dropped_total counter\n");
    let mut dropped_entries: Vec<_> = events_dropped.into_iter().collect();
    dropped_entries.sort_by(|((a_event, a_reason), _), ((b_event, b_reason), _)| {
        a_event.cmp(b_event).then(a_reason.cmp(b_reason))
    });
    for ((event_type, reason), value) in dropped_entries {
        let _ = writeln!(
            output,
            "warden_events_dropped_total{{event_type=\"{event_type}\",reason=\"{reason}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP warden_queries_executed_total Count of gateway query executions by name and outcome\n",
    );
    output.push_str("# TYPE warden_queries_executed_total counter\n");
    let mut query_entries: Vec<_> = queries_executed.into_iter().collect();
    query_entries.sort_by_key(|((name, outcome), _)| (*name, *outcome));
    for ((name, outcome), value) in query_entries {
        let _ = writeln!(
            output,
            "warden_queries_executed_total{{query=\"{name}\",outcome=\"{outcome}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP warden_slow_queries_total Count of gateway queries past the slow threshold\n",
    );
    output.push_str("# TYPE warden_slow_queries_total counter\n");
    let mut slow_entries: Vec<_> = slow_queries.into_iter().collect();
    slow_entries.sort_by_key(|(name, _)| *name);
    for (name, value) in slow_entries {
        let _ = writeln!(output, "warden_slow_queries_total{{query=\"{name}\"}} {value}");
    }

    output
}

pub(crate) fn record_auth_failure(reason: &'static str) {
    if let Ok(mut counters) = metrics_state().auth_failures.lock() {
        let entry = counters.entry(reason).or_insert(0);
        *entry += 1;
    }
}

pub(crate) fn record_rate_limit_hit(surface: &'static str, reason: &'static str) {
    if let Ok(mut counters) = metrics_state().rate_limit_hits.lock() {
        let entry = counters.entry((surface, reason)).or_insert(0);
        *entry += 1;
    }
}

pub(crate) fn record_stream_disconnect(reason: &'static str) {
    if let Ok(mut counters) = metrics_state().stream_disconnects.lock() {
        let entry = counters.entry(reason).or_insert(0);
        *entry += 1;
    }
}

pub(crate) fn record_event_emitted(event_type: &str) {
    if let Ok(mut counters) = metrics_state().events_emitted.lock() {
        let entry = counters.entry(event_type.to_owned()).or_insert(0);
        *entry += 1;
    }
}

pub(crate) fn record_event_dropped(event_type: &str, reason: &'static str) {
    if let Ok(mut counters) = metrics_state().events_dropped.lock() {
        let entry = counters.entry((event_type.to_owned(), reason)).or_insert(0);
        *entry += 1;
    }
}

pub(crate) fn record_query_executed(name: &'static str, outcome: &'static str) {
    if let Ok(mut counters) = metrics_state().queries_executed.lock() {
        let entry = counters.entry((name, outcome)).or_insert(0);
        *entry += 1;
    }
}

pub(crate) fn record_slow_query(name: &'static str) {
    if let Ok(mut counters) = metrics_state().slow_queries.lock() {
        let entry = counters.entry(name).or_insert(0);
        *entry += 1;
    }
}
