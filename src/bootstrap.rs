//! Startup and shutdown sequence of the coordinator.
//!
//! `keypool serve` is a [`fsm::Machine`](crate::fsm::Machine) walking these
//! states in order:
//!
//! ```text
//! Init → HandleArguments → ResolveAddress → StartRuntime → CreateSocket
//!      → BindSocket → Listen → SetupSignal → StartTimer → RunCoordinator
//!      → StopTimer → Cleanup → Exit
//! ```
//!
//! Any failing step diverts to Error, which prints one diagnostic, and then to
//! Cleanup, which releases whatever the earlier steps acquired.

use crate::db::{Database, NullSink, ResultSink};
use crate::fsm::{self, Machine, Outcome, StepError, Transition};
use crate::paths;
use crate::pool::event_loop;
use crate::pool::{Coordinator, Job, RunSummary, StopReason};
use crate::theme::{self, Themed};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Pending connections the kernel may queue.
pub const LISTEN_BACKLOG: u32 = 1024;

/// How long cleanup waits for runtime tasks to wind down.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything `keypool serve` needs to run.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub host: String,
    pub port: u16,
    pub job: Job,
    /// Results database; `None` disables recording.
    pub db_path: Option<PathBuf>,
}

/// Bootstrap states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Init,
    HandleArguments,
    ResolveAddress,
    StartRuntime,
    CreateSocket,
    BindSocket,
    Listen,
    SetupSignal,
    StartTimer,
    RunCoordinator,
    StopTimer,
    Error,
    Cleanup,
    Exit,
}

static TRANSITIONS: &[Transition<BootState>] = &[
    Transition::new(BootState::Init, BootState::HandleArguments),
    Transition::new(BootState::HandleArguments, BootState::ResolveAddress),
    Transition::new(BootState::ResolveAddress, BootState::StartRuntime),
    Transition::new(BootState::StartRuntime, BootState::CreateSocket),
    Transition::new(BootState::CreateSocket, BootState::BindSocket),
    Transition::new(BootState::BindSocket, BootState::Listen),
    Transition::new(BootState::Listen, BootState::SetupSignal),
    Transition::new(BootState::SetupSignal, BootState::StartTimer),
    Transition::new(BootState::StartTimer, BootState::RunCoordinator),
    Transition::new(BootState::RunCoordinator, BootState::StopTimer),
    Transition::new(BootState::StopTimer, BootState::Cleanup),
    Transition::new(BootState::Error, BootState::Cleanup),
    Transition::new(BootState::Cleanup, BootState::Exit),
];

/// Resources acquired along the way, released in Cleanup.
pub struct Bootstrap {
    config: ServeConfig,
    sink: Option<Box<dyn ResultSink>>,
    addr: Option<SocketAddr>,
    runtime: Option<Runtime>,
    socket: Option<TcpSocket>,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    signal_task: Option<JoinHandle<()>>,
    coordinator: Option<Coordinator>,
    summary: Option<RunSummary>,
}

/// Result of `keypool serve`.
#[derive(Debug)]
pub struct ServeReport {
    pub outcome: Outcome<BootState>,
    pub summary: Option<RunSummary>,
    /// Address the listener was bound to, once known.
    pub local_addr: Option<SocketAddr>,
}

impl ServeReport {
    /// Process exit code: 0 when the run completed, 1 on a bootstrap failure.
    pub fn exit_code(&self) -> i32 {
        if self.outcome.is_success() { 0 } else { 1 }
    }
}

/// Run the coordinator through the full bootstrap sequence.
pub fn serve(config: ServeConfig) -> ServeReport {
    serve_with_cancel(config, CancellationToken::new())
}

/// Like [`serve`], with a token that stops the run when cancelled.
pub fn serve_with_cancel(config: ServeConfig, cancel: CancellationToken) -> ServeReport {
    let mut machine = Bootstrap::new(config, cancel);
    let outcome = fsm::run(&mut machine);
    ServeReport {
        outcome,
        summary: machine.summary.take(),
        local_addr: machine.local_addr,
    }
}

impl Bootstrap {
    fn new(config: ServeConfig, cancel: CancellationToken) -> Self {
        Self {
            config,
            sink: None,
            addr: None,
            runtime: None,
            socket: None,
            listener: None,
            local_addr: None,
            cancel,
            signal_task: None,
            coordinator: None,
            summary: None,
        }
    }

    fn handle_arguments(&mut self) -> Result<BootState, StepError> {
        const STEP: &str = "handle_arguments";
        self.config
            .job
            .validate()
            .map_err(|e| StepError::new(STEP, e.to_string()))?;

        let sink: Box<dyn ResultSink> = match &self.config.db_path {
            Some(path) => {
                let path = paths::expand_tilde(path);
                match Database::open(&path) {
                    Ok(db) => {
                        info!(path = %path.display(), "Recording results");
                        Box::new(db)
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Results database unavailable, not recording");
                        Box::new(NullSink)
                    }
                }
            }
            None => Box::new(NullSink),
        };
        self.sink = Some(sink);
        Ok(BootState::ResolveAddress)
    }

    fn resolve_address(&mut self) -> Result<BootState, StepError> {
        const STEP: &str = "resolve_address";
        let host = self.config.host.as_str();
        let addr = (host, self.config.port)
            .to_socket_addrs()
            .map_err(|e| StepError::new(STEP, format!("{}: {}", host, e)))?
            .next()
            .ok_or_else(|| StepError::new(STEP, format!("{}: no addresses found", host)))?;
        self.addr = Some(addr);
        Ok(BootState::StartRuntime)
    }

    fn start_runtime(&mut self) -> Result<BootState, StepError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StepError::new("start_runtime", e.to_string()))?;
        self.runtime = Some(runtime);
        Ok(BootState::CreateSocket)
    }

    fn create_socket(&mut self) -> Result<BootState, StepError> {
        const STEP: &str = "create_socket";
        let addr = self.resolved(STEP)?;
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| StepError::new(STEP, "no runtime"))?;
        let _guard = runtime.enter();
        let socket = if addr.is_ipv6() {
            TcpSocket::new_v6()
        } else {
            TcpSocket::new_v4()
        }
        .map_err(|e| StepError::new(STEP, e.to_string()))?;
        #[cfg(unix)]
        socket
            .set_reuseaddr(true)
            .map_err(|e| StepError::new(STEP, e.to_string()))?;
        self.socket = Some(socket);
        Ok(BootState::BindSocket)
    }

    fn bind_socket(&mut self) -> Result<BootState, StepError> {
        const STEP: &str = "bind_socket";
        let addr = self.resolved(STEP)?;
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| StepError::new(STEP, "no socket"))?;
        socket
            .bind(addr)
            .map_err(|e| StepError::new(STEP, format!("{}: {}", addr, e)))?;
        Ok(BootState::Listen)
    }

    fn listen(&mut self) -> Result<BootState, StepError> {
        const STEP: &str = "listen";
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| StepError::new(STEP, "no runtime"))?;
        let socket = self
            .socket
            .take()
            .ok_or_else(|| StepError::new(STEP, "no socket"))?;
        let listener = {
            let _guard = runtime.enter();
            socket
                .listen(LISTEN_BACKLOG)
                .map_err(|e| StepError::new(STEP, e.to_string()))?
        };
        self.local_addr = listener.local_addr().ok();
        info!(addr = ?self.local_addr, "Listening for workers");
        self.listener = Some(listener);
        Ok(BootState::SetupSignal)
    }

    fn setup_signal(&mut self) -> Result<BootState, StepError> {
        const STEP: &str = "setup_signal";
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| StepError::new(STEP, "no runtime"))?;
        let _guard = runtime.enter();
        let cancel = self.cancel.clone();

        #[cfg(unix)]
        let task = {
            use tokio::signal::unix::{SignalKind, signal};
            let mut interrupt =
                signal(SignalKind::interrupt()).map_err(|e| StepError::new(STEP, e.to_string()))?;
            runtime.spawn(async move {
                if interrupt.recv().await.is_some() {
                    info!("Interrupt received, stopping workers");
                    cancel.cancel();
                }
            })
        };
        #[cfg(not(unix))]
        let task = runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, stopping workers");
                cancel.cancel();
            }
        });

        self.signal_task = Some(task);
        Ok(BootState::StartTimer)
    }

    fn start_timer(&mut self) -> Result<BootState, StepError> {
        let sink = self.sink.take().unwrap_or_else(|| Box::new(NullSink));
        self.coordinator = Some(Coordinator::new(
            self.config.job.clone(),
            sink,
            Instant::now(),
        ));
        Ok(BootState::RunCoordinator)
    }

    fn run_coordinator(&mut self) -> Result<BootState, StepError> {
        const STEP: &str = "run_coordinator";
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| StepError::new(STEP, "no runtime"))?;
        let listener = self
            .listener
            .take()
            .ok_or_else(|| StepError::new(STEP, "no listener"))?;
        let coordinator = self
            .coordinator
            .as_mut()
            .ok_or_else(|| StepError::new(STEP, "no coordinator"))?;

        let job = coordinator.job();
        info!(
            work_size = job.work_size,
            chunk_size = job.chunk_size,
            chunks = coordinator.allocator().total_chunks(),
            label = %job.label,
            "Run started"
        );
        let reason = runtime.block_on(event_loop::run(listener, coordinator, self.cancel.clone()));
        info!(%reason, "Run finished");
        Ok(BootState::StopTimer)
    }

    fn stop_timer(&mut self) -> Result<BootState, StepError> {
        let coordinator = self
            .coordinator
            .as_ref()
            .ok_or_else(|| StepError::new("stop_timer", "no coordinator"))?;
        let summary = coordinator.summary(Instant::now());
        print_summary(&summary);
        self.summary = Some(summary);
        Ok(BootState::Cleanup)
    }

    fn report_error(&self, error: Option<&StepError>) {
        let Some(error) = error else {
            return;
        };
        eprintln!(
            "{}: {} failed: {} {}",
            "error".failure(),
            error.step,
            error.message,
            format!("({}:{})", error.location.file(), error.location.line()).muted()
        );
    }

    fn cleanup(&mut self) -> Result<BootState, StepError> {
        self.cancel.cancel();
        if let Some(task) = self.signal_task.take() {
            task.abort();
        }
        self.listener = None;
        self.socket = None;
        self.coordinator = None;
        self.sink = None;
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        }
        Ok(BootState::Exit)
    }

    fn resolved(&self, step: &'static str) -> Result<SocketAddr, StepError> {
        self.addr
            .ok_or_else(|| StepError::new(step, "no resolved address"))
    }
}

impl Machine for Bootstrap {
    type State = BootState;

    const INITIAL: BootState = BootState::Init;
    const ERROR: BootState = BootState::Error;
    const CLEANUP: BootState = BootState::Cleanup;
    const EXIT: BootState = BootState::Exit;

    fn transitions(&self) -> &'static [Transition<BootState>] {
        TRANSITIONS
    }

    fn step(
        &mut self,
        state: BootState,
        error: Option<&StepError>,
    ) -> Result<BootState, StepError> {
        match state {
            BootState::Init => Ok(BootState::HandleArguments),
            BootState::HandleArguments => self.handle_arguments(),
            BootState::ResolveAddress => self.resolve_address(),
            BootState::StartRuntime => self.start_runtime(),
            BootState::CreateSocket => self.create_socket(),
            BootState::BindSocket => self.bind_socket(),
            BootState::Listen => self.listen(),
            BootState::SetupSignal => self.setup_signal(),
            BootState::StartTimer => self.start_timer(),
            BootState::RunCoordinator => self.run_coordinator(),
            BootState::StopTimer => self.stop_timer(),
            BootState::Error => {
                self.report_error(error);
                Ok(BootState::Cleanup)
            }
            BootState::Cleanup => self.cleanup(),
            BootState::Exit => Ok(BootState::Exit),
        }
    }
}

/// Print the end-of-run summary to stdout.
pub fn print_summary(summary: &RunSummary) {
    match (summary.reason, &summary.result) {
        (Some(StopReason::Found), Some(value)) => {
            println!("Result: {}", theme::display_value(value).success())
        }
        (Some(StopReason::Cancelled), _) => println!("Result: cancelled"),
        _ => println!("Result: not found"),
    }
    println!(
        "Total time workers spent: {:.3} seconds",
        summary.worker_time.as_secs_f64()
    );
    println!(
        "Coordinator ran for: {:.3} seconds",
        summary.elapsed.as_secs_f64()
    );
    println!(
        "Chunks searched: {}/{} by {} worker session(s)",
        summary.chunks_retired, summary.total_chunks, summary.sessions_served
    );
}
