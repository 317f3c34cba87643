mod agent;
mod channel;
mod codec;
mod config;
mod error;
mod fallback;
mod infrastructure;
mod logging;
mod occupancy;
mod peers;
mod queue;
mod scheduler;
mod sim;
mod types;
mod zones;

use std::path::Path;

use config::Settings;
use logging::LogFormat;

fn parse_usize_list(arg: &str) -> Option<Vec<usize>> {
    if arg == "-" {
        return None;
    }
    let mut values = Vec::new();
    for part in arg.split(',') {
        if part.trim().is_empty() {
            return None;
        }
        values.push(part.trim().parse::<usize>().ok()?);
    }
    Some(values)
}

fn parse_f64_list(arg: &str) -> Option<Vec<f64>> {
    if arg == "-" {
        return None;
    }
    let mut values = Vec::new();
    for part in arg.split(',') {
        let value = part.trim().parse::<f64>().ok()?;
        if !value.is_finite() {
            return None;
        }
        values.push(value);
    }
    Some(values)
}

fn print_usage(program: &str) {
    println!("crossway: decentralized intersection coordination simulator");
    println!("Usage:");
    println!("  {program} [options] [demo]");
    println!("  {program} [options] bench [vehicles] [loss] [validate]");
    println!("  {program} [options] stress [vehicle_sets] [loss_sets] [validate]");
    println!("  {program} help");
    println!();
    println!("Options:");
    println!("  --config PATH   load settings from a TOML file");
    println!("  --pretty        multi-line log output (filter with RUST_LOG)");
    println!();
    println!("Sets are comma-separated lists (e.g., 2,4,8). Use \"-\" to keep a default set.");
    println!("Defaults:");
    println!("  bench  vehicles=8 loss=<[link].loss>");
    println!("  stress vehicles=2,4,8,12 loss=0,0.05,0.2");
    println!("Flags:");
    println!("  validate  report safety violations on stderr");
}

fn exit_with_usage(program: &str, message: &str) -> ! {
    eprintln!("{message}");
    print_usage(program);
    std::process::exit(2);
}

fn main() {
    let program = std::env::args()
        .next()
        .unwrap_or_else(|| "crossway".to_string());
    let mut args = std::env::args().skip(1).peekable();

    let mut config_path: Option<String> = None;
    let mut format = LogFormat::Compact;
    while let Some(option) = args.next_if(|arg| arg.starts_with("--")) {
        match option.as_str() {
            "--config" => match args.next() {
                Some(path) => config_path = Some(path),
                None => exit_with_usage(&program, "--config needs a path"),
            },
            "--pretty" => format = LogFormat::Pretty,
            "--help" => {
                print_usage(&program);
                return;
            }
            other => exit_with_usage(&program, &format!("unknown option: {other}")),
        }
    }
    logging::init_logging(format);

    let settings = match config_path {
        Some(path) => match Settings::load(Path::new(&path)) {
            Ok(settings) => settings,
            Err(err) => {
                eprintln!("config error: {err}");
                std::process::exit(2);
            }
        },
        None => Settings::default(),
    };

    match args.next().as_deref() {
        None | Some("demo") => sim::run_demo(&settings),
        Some("bench") => {
            let vehicles = args.next_if(|arg| arg != "validate").map(|arg| {
                arg.parse::<usize>().unwrap_or_else(|_| {
                    exit_with_usage(&program, &format!("bench: invalid vehicles value: {arg}"))
                })
            });
            let loss = args.next_if(|arg| arg != "validate").map(|arg| {
                arg.parse::<f64>().unwrap_or_else(|_| {
                    exit_with_usage(&program, &format!("bench: invalid loss value: {arg}"))
                })
            });
            let mut validate = false;
            for arg in args {
                match arg.as_str() {
                    "validate" => validate = true,
                    other => exit_with_usage(&program, &format!("bench: unexpected argument: {other}")),
                }
            }
            sim::run_benchmark(&settings, vehicles, loss, validate);
        }
        Some("stress") => {
            let mut vehicle_sets: Option<Vec<usize>> = None;
            let mut loss_sets: Option<Vec<f64>> = None;
            let mut positional = 0;
            let mut validate = false;

            for arg in args {
                if arg == "validate" {
                    validate = true;
                    continue;
                }
                match positional {
                    0 => {
                        if arg != "-" {
                            vehicle_sets = Some(parse_usize_list(&arg).unwrap_or_else(|| {
                                exit_with_usage(
                                    &program,
                                    &format!("stress: invalid vehicle_sets value: {arg}"),
                                )
                            }));
                        }
                    }
                    1 => {
                        if arg != "-" {
                            loss_sets = Some(parse_f64_list(&arg).unwrap_or_else(|| {
                                exit_with_usage(
                                    &program,
                                    &format!("stress: invalid loss_sets value: {arg}"),
                                )
                            }));
                        }
                    }
                    _ => exit_with_usage(&program, &format!("stress: unexpected argument: {arg}")),
                }
                positional += 1;
            }

            sim::run_stress(&settings, vehicle_sets, loss_sets, validate);
        }
        Some("help") | Some("-h") => print_usage(&program),
        Some(other) => exit_with_usage(&program, &format!("unknown command: {other}")),
    }
}
