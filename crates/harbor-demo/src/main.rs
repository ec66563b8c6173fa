//! Demo binary that runs a Harbor echo service.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p harbor-demo -- --run-secs 10` for a bounded run, or add
//! `--external-drive` to pump the service from this thread instead of its own.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use harbor_config::{CliArgs, Config};
use harbor_service::{
    DriveMode, Facade, FacadeResult, ServiceBuilder, ServiceError, ServiceHandle, SessionInfo,
    Timer,
};
use tracing::{error, info};

/// Opcode echoed back to the sender.
const OP_ECHO: u32 = 1;

/// How often the lobby facade reports the session count.
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Logs session churn and reports the session count periodically.
#[derive(Default)]
struct Lobby {
    report: Option<Timer>,
}

impl Facade for Lobby {
    fn name(&self) -> &str {
        "lobby"
    }

    fn on_start(&mut self, svc: &ServiceHandle) -> FacadeResult {
        let handle = svc.clone();
        let timer = Timer::new(
            svc.timers(),
            move || info!("{} sessions connected", handle.sessions().len()),
            || {},
        );
        timer.schedule(REPORT_INTERVAL, REPORT_INTERVAL);
        self.report = Some(timer);
        Ok(())
    }

    fn on_stop(&mut self, _svc: &ServiceHandle) -> FacadeResult {
        if let Some(timer) = self.report.take() {
            timer.cancel();
        }
        Ok(())
    }

    fn on_session_create(&mut self, _svc: &ServiceHandle, session: &SessionInfo) -> FacadeResult {
        info!("Session {} joined from {}", session.id, session.peer_addr);
        Ok(())
    }

    fn on_session_destroy(
        &mut self,
        _svc: &ServiceHandle,
        session: &SessionInfo,
        reason: &str,
    ) -> FacadeResult {
        info!("Session {} left: {reason}", session.id);
        Ok(())
    }
}

fn run(config: &Config, run_secs: Option<u64>) -> Result<(), ServiceError> {
    let mut server = ServiceBuilder::from_config(&config.service)
        .network(&config.network)
        .build()?;
    server.register_coder::<String>(OP_ECHO)?;
    server.register_facade(&|| Box::new(Lobby::default()) as Box<dyn Facade>)?;
    server.subscribe(OP_ECHO, |svc, packet| {
        if let Some(text) = packet.decoded::<String>()
            && let Err(e) = svc.send(packet.session_id, OP_ECHO, text, packet.status)
        {
            error!("Echo to session {} failed: {e}", packet.session_id);
        }
    })?;

    server.start(config.service.worker_count)?;
    let addr = server.listen(&config.network.listen_address, config.network.port)?;
    info!("Echo service {} listening on {addr}", server.id());

    // A self-driven client greets the server once so the echo path is visible.
    let mut client = ServiceBuilder::new("greeter").build()?;
    client.register_coder::<String>(OP_ECHO)?;
    client.subscribe(OP_ECHO, |_, packet| {
        if let Some(text) = packet.decoded::<String>() {
            info!("Greeter got echo: {text}");
        }
    })?;
    client.start(1)?;
    let session = client.connect(&addr.ip().to_string(), addr.port())?;
    client.send(session, OP_ECHO, &"hello from harbor".to_string(), 0)?;

    let deadline = run_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
    let running = || deadline.is_none_or(|deadline| Instant::now() < deadline);
    match server.drive_mode() {
        DriveMode::SelfDrive => {
            while running() {
                thread::sleep(Duration::from_millis(100));
            }
        }
        DriveMode::ExternalDrive => {
            while running() {
                server.on_svc(true)?;
                thread::sleep(server.frame_interval());
            }
        }
    }

    client.stop()?;
    server.stop()?;
    info!("Echo service {} shut down", server.id());
    Ok(())
}

fn main() {
    let args = CliArgs::parse();

    // Resolve config directory
    let config_dir = args.config.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("harbor")
    });

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    harbor_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    if let Err(e) = run(&config, args.run_secs) {
        error!("Harbor demo failed: {e}");
        std::process::exit(1);
    }
}
