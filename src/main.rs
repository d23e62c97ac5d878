use std::io::{self, BufRead};
use std::path::PathBuf;
use std::thread;

use anyhow::{bail, Context, Result};

use kitbot_core::platform::create_device;
use kitbot_core::profile::Profile;
use kitbot_core::settings::Settings;
use kitbot_core::{goals, logger, RunOutcome, Runtime};

struct Args {
    profile: PathBuf,
    settings: PathBuf,
    replay: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut args = Args {
        profile: cwd.join("profile.json"),
        settings: cwd.join("settings.json"),
        replay: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--profile" => args.profile = it.next().map(PathBuf::from).context("--profile needs a path")?,
            "--settings" => args.settings = it.next().map(PathBuf::from).context("--settings needs a path")?,
            "--replay" => args.replay = Some(it.next().map(PathBuf::from).context("--replay needs a directory")?),
            // The stub device is what runs when no replay directory is given.
            "--stub" => args.replay = None,
            other => bail!("unknown argument '{}' (expected --profile, --settings, --replay or --stub)", other),
        }
    }
    Ok(args)
}

/// Blocks for one line; `true` only if one actually arrived.
fn stop_requested(mut input: impl BufRead) -> bool {
    let mut line = String::new();
    matches!(input.read_line(&mut line), Ok(n) if n > 0)
}

fn main() -> Result<()> {
    let args = parse_args()?;
    let settings = Settings::load(&args.settings)?;
    logger::init(&settings.logging.dir, &settings.logging.filter)?;
    if !args.settings.exists() {
        settings.save(&args.settings)?;
        tracing::info!(target: "runtime", path = %args.settings.display(), "wrote default settings");
    }

    let profile = Profile::load(&args.profile)?;
    let kit = profile.kit.clone();
    for (item, units) in kit.planned_units() {
        tracing::info!(target: "runtime", item = %item, units, "kit item");
    }
    let device = create_device(args.replay.as_deref())?;
    tracing::info!(target: "runtime", device = device.name(), "kitbot started");

    let mut runtime = Runtime::start(&settings, profile, device)?;
    let orchestrator = runtime.orchestrator();

    // Enter on stdin stops the run at the next step boundary. A closed
    // stdin (EOF) leaves the run alone.
    let cancel = orchestrator.cancel_token();
    thread::spawn(move || {
        if stop_requested(io::stdin().lock()) {
            cancel.request();
        }
    });
    println!("running kit '{}', press Enter to stop", kit.name);

    let result = orchestrator.start_orchestration(&kit, goals::no_empty_slots());
    let status = runtime.status();
    runtime.shutdown();

    println!(
        "state {} ({}), capture {:?}, last scan: {}",
        status.classifier.current,
        status.classifier.display_name,
        status.health,
        status.last_scan.as_deref().unwrap_or("none")
    );
    match result? {
        RunOutcome::Completed(summary) => println!("completed: {:?}", summary),
        RunOutcome::Cancelled(summary) => println!("cancelled: {:?}", summary),
    }
    Ok(())
}
