use std::io::BufRead;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use loadforge::calibrator::{self, Calibration};
use loadforge::command::parse_trace_line;
use loadforge::config::{level_for_debug, Cli};
use loadforge::engine::Engine;
use loadforge::master::{run_master, Mailbox};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("startup failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    let builder = tracing_subscriber::fmt().with_max_level(level_for_debug(cli.debug));
    if let Some(path) = &cli.logfile {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                // "in addition to stderr": tee both writers.
                builder
                    .with_writer(std::io::stderr.and(std::sync::Mutex::new(file)))
                    .init();
                return;
            }
            Err(e) => {
                eprintln!("could not open log file {}: {e}", path.display());
            }
        }
    }
    builder.init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let calibration = resolve_calibration(&cli)?;
    if cli.calib_only {
        return Ok(());
    }

    let engine = Arc::new(Engine::new(calibration));
    let mailbox = Arc::new(Mailbox::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    let notify_mailbox = mailbox.clone();
    engine
        .after
        .set_notifier(Arc::new(move || notify_mailbox.notify_after_ready()));

    let reaper_handle = {
        let registry = engine.registry.clone();
        let reaper = engine.reaper.clone();
        let shutdown = shutdown.clone();
        std::thread::spawn(move || reaper.run_loop(registry, shutdown))
    };

    let input_handle = spawn_input_thread(&cli, mailbox.clone())?;

    let master_engine = engine.clone();
    let master_mailbox = mailbox.clone();
    run_master(master_mailbox, &master_engine);

    shutdown.store(true, Ordering::Relaxed);
    let _ = input_handle.join();
    let _ = reaper_handle.join();
    Ok(())
}

fn resolve_calibration(cli: &Cli) -> anyhow::Result<Calibration> {
    if !cli.bench_calib {
        if let Some(path) = &cli.load_calib {
            let loaded = Calibration::load(path)?;
            if !loaded.needs_calibration() {
                return Ok(loaded);
            }
            tracing::warn!(
                path = %path.display(),
                "calibration file has missing or zero values, recalibrating"
            );
        }
    }
    let measured = calibrator::calibrate(cli.calib_trials)?;
    if let Some(path) = &cli.save_calib {
        measured.save(path)?;
    }
    Ok(measured)
}

/// Spawns the thread that feeds the mailbox: either a trace-file reader
/// (honoring `-T`'s timestamp column) or a line-at-a-time stdin reader.
fn spawn_input_thread(cli: &Cli, mailbox: Arc<Mailbox>) -> anyhow::Result<std::thread::JoinHandle<()>> {
    if let Some(path) = cli.trace_file.clone() {
        let timestamped = cli.timestamps.as_bool();
        let file = std::fs::File::open(&path)?;
        return Ok(std::thread::spawn(move || {
            let reader = std::io::BufReader::new(file);
            let start = std::time::Instant::now();
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if loadforge::command::is_ignorable_line(&line) {
                    continue;
                }
                match parse_trace_line(&line, timestamped) {
                    Ok(tl) => {
                        if timestamped {
                            let target = Duration::from_secs_f64(tl.at);
                            let elapsed = start.elapsed();
                            if target > elapsed && target - elapsed >= Duration::from_millis(15) {
                                std::thread::sleep(target - elapsed);
                            }
                        }
                        mailbox.send_input(tl.command);
                    }
                    Err(e) => tracing::warn!(%line, error = %e, "bad trace line"),
                }
            }
            mailbox.send_exit();
        }));
    }

    Ok(std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if loadforge::command::is_ignorable_line(&line) {
                continue;
            }
            mailbox.send_input(line);
        }
        mailbox.send_exit();
    }))
}
