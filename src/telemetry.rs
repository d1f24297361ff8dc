//! Metrics endpoint wiring.
//!
//! Recording itself happens at the call sites through the `metrics` crate's
//! macros; this module only owns the Prometheus recorder and the
//! human-readable descriptions of everything llamactl emits.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Set up the Prometheus recorder and describe all llamactl metrics.
///
/// A process can only hold one global recorder, so this returns `None` when
/// one is already installed (a test binary building the app repeatedly hits
/// this). Recording keeps working either way: the macros write to whichever
/// recorder won the race.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

fn describe() {
    // -- Lifecycle metrics --
    describe_counter!("llamactl_instance_starts_total", "Total instance starts");
    describe_counter!("llamactl_instance_stops_total", "Total instance stops");
    describe_counter!(
        "llamactl_instance_crashes_total",
        "Child processes that exited with an error"
    );
    describe_counter!(
        "llamactl_instance_restarts_total",
        "Automatic restarts after a crash"
    );
    describe_counter!(
        "llamactl_instance_evictions_total",
        "Instances stopped to admit another under the running cap"
    );
    describe_counter!(
        "llamactl_instance_idle_stops_total",
        "Instances stopped by the idle sweeper"
    );
    describe_gauge!(
        "llamactl_running_instances",
        "Currently running instances"
    );

    // -- Routing metrics --
    describe_counter!("llamactl_requests_total", "Inference requests routed");
    describe_histogram!(
        "llamactl_request_duration_seconds",
        "End-to-end routed request duration (time to first byte)"
    );
    describe_histogram!(
        "llamactl_time_to_ready_seconds",
        "Time from on-demand start until the child answered its readiness probe"
    );
}
