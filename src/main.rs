//! dap-bridge - Run a plan under a remote debugger
//!
//! Opens a Debug Adapter Protocol endpoint, waits for a client to configure
//! the session, then executes the plan while the client steps through it.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dap_bridge::common::config::{Config, TransportMode};
use dap_bridge::common::logging;
use dap_bridge::dap::Thread;
use dap_bridge::debugger::{Debugger, Evaluator};
use dap_bridge::runner::{Plan, PlanRunner, SimpleEvaluator};
use dap_bridge::server::Server;
use dap_bridge::{Error, Result};

/// Exit code when the run could not happen at all
const FATAL_EXIT_CODE: i32 = 255;

#[derive(Parser)]
#[command(name = "dap-bridge", about = "Run a plan under a Debug Adapter Protocol client")]
#[command(version, long_about = None)]
struct Cli {
    /// Plan file to execute
    plan: PathBuf,

    /// Configuration file (default: the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Speak DAP over stdin/stdout instead of TCP
    #[arg(long)]
    stdio: bool,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long, short)]
    port: Option<u16>,

    /// Seconds to wait for a client to connect
    #[arg(long)]
    wait_for_client: Option<f64>,

    /// Pause before the first suite
    #[arg(long)]
    stop_on_entry: bool,

    /// Run without pausing, only forward events
    #[arg(long)]
    no_debug: bool,

    /// Forward engine messages to the client
    #[arg(long)]
    output_messages: bool,

    /// Forward log messages to the client
    #[arg(long)]
    output_log: bool,

    /// Group client output by unit
    #[arg(long)]
    group_output: bool,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset (e.g. "dap_bridge=debug")
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Command line switches win over the configuration file
    fn apply(&self, config: &mut Config) {
        if self.stdio {
            config.server.mode = TransportMode::Stdio;
        }
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(secs) = self.wait_for_client {
            config.timeouts.wait_for_client_secs = secs;
        }

        let session = &mut config.session;
        session.stop_on_entry |= self.stop_on_entry;
        session.no_debug |= self.no_debug;
        session.output_messages |= self.output_messages;
        session.output_log |= self.output_log;
        session.group_output |= self.group_output;

        if self.log_file.is_some() {
            config.logging.file = self.log_file.clone();
        }
        if self.log_level.is_some() {
            config.logging.level = self.log_level.clone();
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(FATAL_EXIT_CODE);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    cli.apply(&mut config);

    let _log_guard = logging::init(config.logging.level.as_deref(), config.logging.file.as_deref());

    let plan = Plan::load(&cli.plan)?;
    let evaluator: Arc<dyn Evaluator> = Arc::new(SimpleEvaluator);
    let (debugger, events) = Debugger::new(config.session.clone(), Arc::clone(&evaluator));

    let server = Server::new(Arc::clone(&debugger), events);
    let serving = server.listen(&config.server).await?;

    let bootstrap = async {
        server.wait_for_client(config.timeouts.wait_for_client()?).await?;
        server.initialized();
        server
            .wait_for_configuration_done(config.timeouts.configuration_done()?)
            .await
    };
    if let Err(e) = bootstrap.await {
        server.close().await;
        return Err(e);
    }

    tracing::info!(plan = %cli.plan.display(), "Starting execution");
    let runner = PlanRunner::new(plan, &cli.plan, Arc::clone(&debugger), evaluator);
    let execution = Arc::clone(&debugger);
    let exit_code = tokio::task::spawn_blocking(move || {
        execution.set_main_thread(Thread {
            id: 1,
            name: "MainThread".to_string(),
        });
        execution.start();
        runner.run()
    })
    .await
    .map_err(|e| Error::Internal(format!("Execution thread failed: {}", e)))?;

    tracing::info!(exit_code, "Execution finished");
    debugger.execution_exited(exit_code);
    server.exited(exit_code);
    server.close().await;

    match serving.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Client connection ended with error: {}", e),
        Err(e) => tracing::warn!("Server task failed: {}", e),
    }

    Ok(exit_code)
}
