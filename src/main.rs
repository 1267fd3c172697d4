//! shutterd - window shutter control daemon
//!
//! Commands:
//!   --daemon         Run as daemon (default)
//!   --dry-run        Run the daemon against a simulated home
//!   --status         Show current status
//!   --check-config   Validate the parameter file
//!   --calibrate      Fit actuator calibration from three measurements
//!   --config DIR     Use DIR instead of ~/.config/shutterd
//!   --help           Show usage

use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context};

use shutterd::calibration::Calibration;
use shutterd::config::{self, Params, Paths};
use shutterd::solar::{self, Observer, SunState};
use shutterd::{daemon, local_time, logging, now_epoch};

enum Command {
    Daemon { dry_run: bool },
    Status,
    CheckConfig,
    Calibrate([(f64, f64); 3]),
}

struct Args {
    command: Command,
    config_dir: Option<PathBuf>,
}

fn print_usage() {
    eprintln!("shutterd - window shutter control daemon");
    eprintln!();
    eprintln!("Usage: shutterd [--config DIR] [COMMAND]");
    eprintln!();
    eprintln!("  --daemon              Run daemon (default)");
    eprintln!("  --dry-run             Run daemon against a simulated home");
    eprintln!("  --status              Show current status");
    eprintln!("  --check-config        Validate params.json and exit");
    eprintln!("  --calibrate N1 T1 N2 T2 N3 T3");
    eprintln!("                        Fit calibration from (nominal, true) pairs");
    eprintln!("  --config DIR          Configuration directory");
    eprintln!("  --help                Show this help");
}

fn parse_number(s: &str) -> anyhow::Result<f64> {
    let v: f64 = s.parse().with_context(|| format!("invalid number: {}", s))?;
    if !v.is_finite() {
        bail!("invalid number: {}", s);
    }
    Ok(v)
}

fn parse_args(args: &[String]) -> anyhow::Result<Args> {
    let mut command = None;
    let mut config_dir = None;
    let mut i = 0;
    while i < args.len() {
        let next = match args[i].as_str() {
            "--daemon" | "daemon" => Command::Daemon { dry_run: false },
            "--dry-run" | "dry-run" => Command::Daemon { dry_run: true },
            "--status" | "status" => Command::Status,
            "--check-config" | "check-config" => Command::CheckConfig,
            "--calibrate" | "calibrate" => {
                if args.len() < i + 7 {
                    bail!("--calibrate requires six numbers\n  Example: shutterd --calibrate 0.2 0.05 0.5 0.3 0.8 0.7");
                }
                let mut pairs = [(0.0, 0.0); 3];
                for (k, pair) in pairs.iter_mut().enumerate() {
                    *pair = (
                        parse_number(&args[i + 1 + 2 * k])?,
                        parse_number(&args[i + 2 + 2 * k])?,
                    );
                }
                i += 6;
                Command::Calibrate(pairs)
            }
            "--config" => {
                let Some(dir) = args.get(i + 1) else {
                    bail!("--config requires a directory");
                };
                config_dir = Some(PathBuf::from(dir));
                i += 2;
                continue;
            }
            "--help" | "-h" | "help" => {
                print_usage();
                process::exit(0);
            }
            other => bail!("Unknown command: {}", other),
        };
        if command.is_some() {
            bail!("more than one command given");
        }
        command = Some(next);
        i += 1;
    }
    Ok(Args {
        command: command.unwrap_or(Command::Daemon { dry_run: false }),
        config_dir,
    })
}

fn main() {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&argv) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{:#}", e);
            print_usage();
            process::exit(1);
        }
    };
    match run(args) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn run(args: Args) -> anyhow::Result<i32> {
    if let Command::Calibrate(pairs) = args.command {
        return cmd_calibrate(pairs);
    }

    let paths = match args.config_dir {
        Some(dir) => Paths::in_dir(dir),
        None => Paths::init(),
    }
    .context("failed to initialize paths")?;

    match args.command {
        Command::Daemon { dry_run } => {
            logging::init(1);
            if config::check_daemon_alive(&paths) {
                bail!("daemon already running (see {})", paths.pid_file.display());
            }
            daemon::run(&paths, dry_run)?;
            Ok(0)
        }
        Command::Status => cmd_status(&paths),
        Command::CheckConfig => cmd_check_config(&paths),
        Command::Calibrate(_) => Ok(0),
    }
}

fn cmd_calibrate(pairs: [(f64, f64); 3]) -> anyhow::Result<i32> {
    let cal = Calibration::fit(pairs).context("calibration failed")?;
    let [c0, c1, c2] = cal.coef;
    println!("\"calibration\": [{:.6}, {:.6}, {:.6}]", c0, c1, c2);
    for &(nominal, t) in &pairs {
        println!(
            "  true {:.3} -> nominal {:.3} (measured {:.3})",
            t,
            cal.true_to_nominal(t),
            nominal
        );
    }
    Ok(0)
}

fn cmd_check_config(paths: &Paths) -> anyhow::Result<i32> {
    let map = config::load_param_map(&paths.params_file)
        .with_context(|| format!("reading {}", paths.params_file.display()))?;
    let (params, problems) = Params::parse(&map);
    println!("{}", paths.params_file.display());
    println!("  {} windows, {} activities", params.windows.len(), params.activities.len());
    for w in &params.windows {
        println!("  window {} -> shutter {} ({})", w.name, w.shutter, w.room);
    }
    if problems.is_empty() {
        println!("OK");
        return Ok(0);
    }
    for p in &problems {
        println!("  {}", p);
    }
    println!("{} problem(s)", problems.len());
    Ok(1)
}

fn cmd_status(paths: &Paths) -> anyhow::Result<i32> {
    let map = config::load_param_map(&paths.params_file)
        .with_context(|| format!("reading {}", paths.params_file.display()))?;
    let (params, _) = Params::parse(&map);

    let now = now_epoch();
    let lt = local_time(now);
    println!(
        "Date: {:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        lt.year, lt.month, lt.day, lt.hour, lt.min, lt.sec
    );
    println!("Location: {:.4}, {:.4}", params.latitude, params.longitude);
    println!(
        "Daemon: {}",
        if config::check_daemon_alive(paths) {
            "running"
        } else {
            "not running"
        }
    );

    let sun = SunState::compute(
        now,
        Observer {
            lat: params.latitude,
            lon: params.longitude,
        },
        params.main_loop_sleep_time.round().max(1.0) as i64,
        solar::lookahead_count(params.lookahead_seconds, params.main_loop_sleep_time),
    );
    println!(
        "Sun: azimuth {:.1}, elevation {:.1}\n",
        sun.current.azimuth, sun.current.elevation
    );

    match config::load_state(paths) {
        Some(mut state) => {
            let t = &state.temperature;
            println!(
                "Temperature: {} (min {:.1}, max {:.1})",
                t.condition(&params.temperature).as_str(),
                t.min,
                t.max
            );
            // Drop samples that aged out while nobody was updating
            state.brightness.update(now, &[], &params.brightness);
            let brightness = state.brightness.condition(now, &params.brightness);
            match state.brightness.current {
                Some(v) => println!("Brightness: {} ({:.0} lx)", brightness.as_str(), v),
                None => println!("Brightness: {}", brightness.as_str()),
            }
        }
        None => println!("No saved state"),
    }
    println!();

    for w in &params.windows {
        match w.profile.classify(sun.current) {
            Ok(s) => println!("{:<20} {}", w.name, s.as_str()),
            Err(e) => println!("{:<20} {}", w.name, e),
        }
    }
    Ok(0)
}
