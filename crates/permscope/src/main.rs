use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use permscope::report::ReportSink;
use permscope::{transport, Session};
use permscope_config::{PermscopeConfig, ReportMode};

/// Trace failing permission checks in a running JVM and propose policy fixes.
///
/// The target must be started with a JDWP socket agent, e.g.
/// `-agentlib:jdwp=transport=dt_socket,server=y,suspend=n,address=8000`.
#[derive(Debug, Parser)]
#[command(name = "permscope", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// Falls back to `PERMSCOPE_CONFIG`, then `permscope.toml` in the working
    /// directory, then built-in defaults.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Host of the target's JDWP agent.
    #[arg(long)]
    host: Option<String>,

    /// Port of the target's JDWP agent.
    #[arg(long, short)]
    port: Option<String>,

    /// Keep retrying until the target accepts the connection.
    #[arg(long)]
    wait: bool,

    /// Minutes to keep retrying with `--wait`.
    #[arg(long, value_name = "MINUTES")]
    wait_timeout: Option<u64>,

    /// Stop after the first reported failure.
    #[arg(long)]
    once: bool,

    /// Push single pure-grant fixes into the running target.
    #[arg(long)]
    auto_apply: bool,

    /// Also watch service-event permission checks.
    #[arg(long)]
    monitor_services: bool,

    /// Administrative mode: only propose grants, never code changes.
    #[arg(long)]
    admin: bool,

    #[arg(long, value_enum)]
    report_mode: Option<ReportModeArg>,

    /// Class publishing the in-target helper in its static `INSTANCE` field.
    #[arg(long, value_name = "CLASS")]
    helper_class: Option<String>,

    /// Let other target threads run while remote calls execute.
    #[arg(long)]
    multi_threaded_invoke: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReportModeArg {
    Modular,
    Classic,
}

impl Cli {
    fn apply(self, config: &mut PermscopeConfig) {
        let transport = &mut config.transport;
        if let Some(host) = self.host {
            transport.host = host;
        }
        if let Some(port) = self.port {
            transport.port = port;
        }
        transport.wait |= self.wait;
        if let Some(minutes) = self.wait_timeout {
            transport.wait_timeout_minutes = minutes;
        }

        let session = &mut config.session;
        if self.once {
            session.continuous = false;
        }
        session.auto_apply |= self.auto_apply;
        session.monitor_services |= self.monitor_services;
        if self.admin {
            session.allow_elevation = false;
        }
        if let Some(mode) = self.report_mode {
            session.report_mode = match mode {
                ReportModeArg::Modular => ReportMode::Modular,
                ReportModeArg::Classic => ReportMode::Classic,
            };
        }
        if let Some(class) = self.helper_class {
            session.helper_class = class;
        }
        if self.multi_threaded_invoke {
            session.invoke_single_threaded = false;
        }
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.clone())?;
    cli.apply(&mut config);
    let logs = permscope_config::init_tracing_with_config(&config);

    let result = trace(&config).await;
    if result.is_err() && !config.logging.stderr {
        // Logs went only to memory or a file; show what led up to the failure.
        for line in logs.last_lines(POST_MORTEM_LINES) {
            eprintln!("{line}");
        }
    }
    result
}

const POST_MORTEM_LINES: usize = 40;

async fn trace(config: &PermscopeConfig) -> anyhow::Result<()> {
    let jdwp = transport::connect(&config.transport)
        .await
        .with_context(|| format!("attaching to {}", transport::address(&config.transport)))?;
    let session = Session::new(config, jdwp, ReportSink::stdout());
    session.run().await.context("tracing session failed")?;
    Ok(())
}

fn load_config(cli_path: Option<PathBuf>) -> anyhow::Result<PermscopeConfig> {
    if let Some(path) = cli_path {
        return PermscopeConfig::load_from_path(&path)
            .with_context(|| format!("loading {}", path.display()));
    }
    let cwd = std::env::current_dir().context("reading the working directory")?;
    let (config, _path) = permscope_config::load_for_dir(&cwd)?;
    Ok(config)
}
