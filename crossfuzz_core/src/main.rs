use crossfuzz_core::driver::{DriverRegistry, SimulatedDriver};
use crossfuzz_core::event::Event;
use crossfuzz_core::payload::{PayloadGenerator, Profile, Seed};
use crossfuzz_core::protocol::Protocol;
use crossfuzz_core::scheduler::JobScheduler;
use crossfuzz_core::store::JobFilter;
use crossfuzz_core::{EngineConfig, JobConfig};

use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = EngineConfig::from_toml_str(
        r#"
        snapshot-interval-ms = 100

        [job-defaults]
        concurrency = 4
        "#,
    )?;
    info!(?config, "Engine configuration");

    let mut drivers = DriverRegistry::new();
    for protocol in Protocol::BUILTIN {
        let driver = SimulatedDriver::new(protocol.name(), Duration::from_millis(2));
        drivers.register(protocol, Arc::new(driver));
    }

    let mut job = JobConfig::with_defaults("127.0.0.1", &config.job_defaults);
    job.payload.seed = Seed::parse("0xBEEF")?;
    job.payload.profile = Profile::Hard;
    job.payload.count = Some(500);

    let generator = PayloadGenerator::new(job.payload.clone());
    println!("{:>6}  {:<24}  {:>5}", "index", "bytes", "size");
    for row in generator.preview(5) {
        println!("{:>6}  {:<24}  {:>5}", row.index, row.hex, row.size);
    }

    let scheduler = JobScheduler::new(config, drivers)?;
    let job_id = scheduler.create_job(Protocol::Tcp, job)?;
    let mut events = scheduler.subscribe(&job_id)?;
    scheduler.start_job(&job_id)?;

    while let Some(event) = events.recv().await {
        match event {
            Event::MetricsSnapshot(metrics) => {
                print!(
                    "\rProgress: {:5.1}%, Sent: {}, Packets/sec: {:.0}, Avg RTT: {:.2} ms, Findings: {}",
                    metrics.progress,
                    metrics.packets_sent,
                    metrics.packets_per_sec,
                    metrics.avg_rtt_ms,
                    metrics.finding_count
                );
            }
            Event::JobStateChanged { old, new } => println!("\nJob {old} -> {new}"),
            Event::LogLine { .. } => {}
        }
    }

    let summary = scheduler.wait(&job_id).await?;
    println!(
        "Job {} finished as {} after {} payloads with {} findings (peak severity: {:?}).",
        summary.job_id,
        summary.state,
        summary.metrics.packets_sent,
        summary.findings_count(),
        summary.peak_severity
    );
    for finding in summary.findings.iter().take(5) {
        println!("  [{}] {} ({})", finding.severity, finding.description, finding.signature);
    }

    let history = scheduler.query(&JobFilter::new().protocol(Protocol::Tcp))?;
    println!("Stored TCP runs: {}", history.len());
    Ok(())
}
