use console::style;
use log::{debug, info};
use safebox::{
    EventKind, ExecutionPolicy, ManagerConfig, ProcessEnumerator, ProcfsEnumerator, Report,
    ReportStatus, SandboxRegistry,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for one `run` invocation
pub struct RunConfig {
    pub id: Option<String>,
    pub program: String,
    pub args: Vec<String>,
    pub memory: Option<String>,
    pub cpu: Option<f64>,
    pub timeout: Option<u64>,
    pub max_processes: Option<u32>,
    pub strict: bool,
    pub interval_ms: Option<u64>,
    pub json: bool,
}

pub fn manager_config(storage: Option<PathBuf>, workspace: Option<PathBuf>) -> ManagerConfig {
    let mut config = ManagerConfig::from_env();
    if let Some(dir) = storage {
        config = config.storage_dir(dir);
    }
    if let Some(dir) = workspace {
        config = config.workspace_dir(dir);
    }
    config
}

fn build_policy(config: &RunConfig) -> safebox::Result<ExecutionPolicy> {
    let mut builder = ExecutionPolicy::builder().strict(config.strict);

    if let Some(m) = &config.memory {
        debug!("Overriding memory limit: {}", m);
        builder = builder.max_memory_str(m)?;
    }
    if let Some(c) = config.cpu {
        debug!("Overriding CPU limit: {}%", c);
        builder = builder.max_cpu_percent(c);
    }
    if let Some(t) = config.timeout {
        debug!("Overriding timeout: {}s", t);
        builder = builder.max_duration_seconds(t);
    }
    if let Some(p) = config.max_processes {
        debug!("Overriding process limit: {}", p);
        builder = builder.max_processes(p);
    }

    builder.build()
}

/// Run one target and return the exit code the CLI should use
pub fn run_sandbox(
    manager: ManagerConfig,
    config: RunConfig,
) -> Result<i32, Box<dyn std::error::Error>> {
    let mut manager = manager;
    if let Some(ms) = config.interval_ms {
        manager = manager.poll_interval(Duration::from_millis(ms));
    }

    let policy = build_policy(&config)?;
    let registry = SandboxRegistry::new(manager);
    let id = match &config.id {
        Some(id) => registry.create_with_id(id, policy)?,
        None => registry.create(policy)?,
    };

    info!("Executing in {}: {} {:?}", id, config.program, config.args);
    let report = registry.execute(&id, &config.program, &config.args)?;

    if config.json {
        println!("{}", report.to_json()?);
    } else {
        print_report(&report);
    }

    Ok(report.return_code.unwrap_or(1))
}

pub fn show_report(path: &Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let report = Report::load(path)?;
    if json {
        println!("{}", report.to_json()?);
    } else {
        print_report(&report);
    }
    Ok(())
}

pub fn quarantine(
    manager: ManagerConfig,
    file: &Path,
    reason: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = SandboxRegistry::new(manager);
    let moved = registry.quarantine(file, reason)?;
    println!(
        "{} {} -> {}",
        style("quarantined").yellow().bold(),
        file.display(),
        moved.display()
    );
    Ok(())
}

pub fn check_requirements(manager: &ManagerConfig) {
    info!("Checking monitoring requirements");
    println!("Checking monitoring requirements...\n");

    match ProcfsEnumerator::default().snapshot() {
        Ok(table) => println!("[✓] /proc readable ({} processes)", table.processes.len()),
        Err(e) => println!("[✗] /proc NOT readable: {}", e),
    }

    if Path::new("/proc/net/tcp").exists() {
        println!("[✓] /proc/net connection tables available");
    } else {
        println!("[✗] /proc/net connection tables NOT available");
    }

    match fs::create_dir_all(&manager.workspace_dir) {
        Ok(()) => println!("[✓] Workspace dir {}", manager.workspace_dir.display()),
        Err(e) => println!(
            "[✗] Workspace dir {} NOT writable: {}",
            manager.workspace_dir.display(),
            e
        ),
    }

    println!("\nConfiguration:");
    println!("  storage:       {}", manager.storage_dir.display());
    println!("  poll interval: {:?}", manager.poll_interval);
    println!("  grace period:  {:?}", manager.grace_period);
}

fn print_report(report: &Report) {
    let status = match report.status {
        ReportStatus::Completed => style("completed").green().bold(),
        ReportStatus::Running => style("running").cyan().bold(),
        ReportStatus::Terminated => style("terminated").yellow().bold(),
        ReportStatus::Error => style("error").red().bold(),
    };
    let code = match report.return_code {
        Some(0) => style("0".to_string()).green().bold(),
        Some(c) => style(c.to_string()).red().bold(),
        None => style("-".to_string()).dim(),
    };
    let duration = report.end_time - report.start_time;

    println!(
        "{}={} | {}={} | {}={} | {}={}ms",
        style("sandbox").dim(),
        style(&report.sandbox_id).bold(),
        style("status").dim(),
        status,
        style("return_code").dim(),
        code,
        style("duration").dim(),
        style(duration.num_milliseconds()).bold(),
    );
    println!(
        "{}={} | {}={:.1}% | {}={:.1}MB",
        style("processes").dim(),
        style(report.total_processes).bold(),
        style("cpu").dim(),
        report.total_cpu_used,
        style("memory").dim(),
        report.total_memory_used,
    );

    if let Some(error) = &report.error {
        println!("{} {}", style("error:").red().bold(), error);
    }
    if report
        .events
        .iter()
        .any(|e| matches!(e.kind, EventKind::TimeoutKill { .. }))
    {
        println!("{}", style("timed out").red().bold());
    }
    for anomaly in &report.anomalies_detected {
        println!(
            "{} {}: {}",
            style("anomaly").yellow().bold(),
            anomaly.kind,
            anomaly.message
        );
    }
    for endpoint in &report.network_activity {
        println!("{} {}", style("network").cyan(), endpoint);
    }
}
