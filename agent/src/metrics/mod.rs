use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry};

/// Counters shared by the discovery and scrape coordinators.
#[derive(Clone)]
pub struct Metrics {
    pub scrapes: IntCounterVec,
    pub scrape_errors: IntCounterVec,
    pub convert_errors: IntCounterVec,
    pub samples: IntCounterVec,
    pub active_targets: IntGaugeVec,
    pub discovery_errors: IntCounterVec,
    pub sync_events: IntCounterVec,
    pub ingest_latency: Histogram,
}

impl Metrics {
    pub fn new(reg: &Registry) -> prometheus::Result<Metrics> {
        let scrapes = register_counter_vec(
            "goprofile_scrapes_total",
            "Total number of profile pulls attempted.",
            &["job"],
            reg,
        )?;
        let scrape_errors = register_counter_vec(
            "goprofile_scrape_errors_total",
            "Total number of failed profile pulls.",
            &["job", "instance"],
            reg,
        )?;
        let convert_errors = register_counter_vec(
            "goprofile_convert_errors_total",
            "Total number of pulled profiles that could not be decoded.",
            &["job"],
            reg,
        )?;
        let samples = register_counter_vec(
            "goprofile_samples_total",
            "Total number of profile samples handed to the collector.",
            &["job"],
            reg,
        )?;
        let active_targets = IntGaugeVec::new(
            Opts::new("goprofile_active_targets", "Number of targets with a running scrape loop."),
            &["job"],
        )?;
        reg.register(Box::new(active_targets.clone()))?;
        let discovery_errors = register_counter_vec(
            "goprofile_discovery_errors_total",
            "Total number of failed discovery refreshes.",
            &["job", "source"],
            reg,
        )?;
        let sync_events = register_counter_vec(
            "goprofile_sync_events_total",
            "Total number of target sets published to the scrape manager.",
            &["job"],
            reg,
        )?;
        let ingest_latency = Histogram::with_opts(HistogramOpts::new(
            "goprofile_ingest_latency_seconds",
            "Time spent converting a pulled profile and handing it to the collector.",
        ))?;
        reg.register(Box::new(ingest_latency.clone()))?;

        Ok(Metrics {
            scrapes,
            scrape_errors,
            convert_errors,
            samples,
            active_targets,
            discovery_errors,
            sync_events,
            ingest_latency,
        })
    }
}

fn register_counter_vec(
    name: &str,
    help: &str,
    labels: &[&str],
    reg: &Registry,
) -> prometheus::Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
    reg.register(Box::new(counter.clone()))?;
    Ok(counter)
}
