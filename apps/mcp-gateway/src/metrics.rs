use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("valid metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

pub static RUNNER_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "gateway_runner_connections",
        "runner interconnect sockets currently open",
    )
    .expect("valid metric definition");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static RUNNER_CLOSES: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "gateway_runner_closed_total",
        "runner connections torn down by reason",
        &["reason"],
    )
});

pub static RUNNER_AUTH_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "gateway_runner_auth_failures_total",
        "runner connection attempts with an unknown key",
    ))
    .expect("valid metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static IC_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "gateway_ic_requests_total",
        "interconnect requests issued to runners by name and outcome",
        &["name", "outcome"],
    )
});

pub static DISPATCH_JOBS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "gateway_dispatch_jobs_total",
        "dispatch queue jobs processed by name and result",
        &["job", "result"],
    )
});

pub static CLIENT_CONNECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "gateway_client_connections_total",
        "client exchanges accepted by transport",
        &["transport"],
    )
});

pub static ACTIVE_RUNS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new("gateway_active_runs", "open server runs per runner"),
        &["runner_id"],
    )
    .expect("valid metric definition");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static BROKER_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "gateway_broker_dropped_messages_total",
        "runner messages addressed to runs this gateway does not know",
    ))
    .expect("valid metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static LIVENESS_STALE: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "gateway_liveness_stale_runners_total",
        "runners found past their heartbeat deadline by the liveness sweep",
    ))
    .expect("valid metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %err, "metrics encode error");
    }
    buffer
}
