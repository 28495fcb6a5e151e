use std::path::Path;

use sushi_supply::config::SimConfig;
use sushi_supply::{logging, sim};

fn parse_usize_list(arg: &str) -> Option<Vec<usize>> {
    if arg == "-" {
        return None;
    }
    let mut values = Vec::new();
    for part in arg.split(',') {
        if part.trim().is_empty() {
            return None;
        }
        let value = part.trim().parse::<usize>().ok()?;
        values.push(value);
    }
    Some(values)
}

fn print_usage(program: &str) {
    println!("Sushi supply engine CLI");
    println!("Usage:");
    println!("  {program} [--config <path>] (run demo)");
    println!("  {program} [--config <path>] bench [staff] [drones] [orders] [tick_ms] [validate]");
    println!("  {program} [--config <path>] stress [staff_sets] [drone_sets] [order_sets] [tick_ms] [validate]");
    println!("  {program} inspect <snapshot.json>");
    println!("  {program} --help");
    println!();
    println!("Sets are comma-separated lists (e.g., 1,2,4). Use \"-\" to keep defaults for staff/drone/order sets.");
    println!("Omit tick_ms to keep the config's value (1ms without a config file).");
    println!("Defaults:");
    println!("  bench  staff=3 drones=2 orders=20");
    println!("  stress staff=1,2,4 drones=1,2,4 orders=10,25");
    println!("Flags:");
    println!("  validate  check that no stock row overshoots its restock bound");
    println!("Environment:");
    println!("  SUSHI_LOG=off|error|warn|info|debug|trace");
}

fn exit_with_usage(program: &str, message: &str) -> ! {
    eprintln!("{message}");
    print_usage(program);
    std::process::exit(2);
}

/// Positional list argument for `stress`; `-` means the default.
fn next_set(
    program: &str,
    what: &str,
    arg: &str,
    slot: &mut Option<Vec<usize>>,
    skipped: &mut bool,
) -> bool {
    if slot.is_some() || *skipped {
        return false;
    }
    if arg == "-" {
        *skipped = true;
    } else if let Some(values) = parse_usize_list(arg) {
        *slot = Some(values);
    } else {
        exit_with_usage(program, &format!("stress: invalid {what} value: {arg}"));
    }
    true
}

fn main() {
    logging::init();
    let program = std::env::args()
        .next()
        .unwrap_or_else(|| "sushi_supply".to_string());
    let mut args = std::env::args().skip(1).peekable();

    let mut config: Option<SimConfig> = None;
    if args.peek().map(String::as_str) == Some("--config") {
        args.next();
        let Some(path) = args.next() else {
            exit_with_usage(&program, "--config needs a path");
        };
        match SimConfig::from_json_file(&path) {
            Ok(loaded) => config = Some(loaded),
            Err(err) => {
                eprintln!("could not read config {path}: {err}");
                std::process::exit(2);
            }
        }
    }

    let outcome = match args.next().as_deref() {
        Some("bench") => {
            let staff = args.next().and_then(|v| v.parse::<usize>().ok());
            let drones = args.next().and_then(|v| v.parse::<usize>().ok());
            let orders = args.next().and_then(|v| v.parse::<usize>().ok());
            let tick_ms = args.next().and_then(|v| v.parse::<u64>().ok());
            let validate = args.any(|arg| arg == "validate");
            sim::run_benchmark(config, staff, drones, orders, tick_ms, validate)
        }
        Some("stress") => {
            let mut staff_sets: Option<Vec<usize>> = None;
            let mut drone_sets: Option<Vec<usize>> = None;
            let mut order_sets: Option<Vec<usize>> = None;
            let mut tick_ms: Option<u64> = None;
            let mut staff_skipped = false;
            let mut drones_skipped = false;
            let mut orders_skipped = false;
            let mut validate = false;

            for arg in args {
                if arg == "validate" {
                    validate = true;
                    continue;
                }
                if next_set(&program, "staff_sets", &arg, &mut staff_sets, &mut staff_skipped)
                    || next_set(&program, "drone_sets", &arg, &mut drone_sets, &mut drones_skipped)
                    || next_set(&program, "order_sets", &arg, &mut order_sets, &mut orders_skipped)
                {
                    continue;
                }
                if tick_ms.is_none() {
                    match arg.parse::<u64>() {
                        Ok(value) => tick_ms = Some(value),
                        Err(_) => {
                            exit_with_usage(&program, &format!("stress: invalid tick_ms value: {arg}"))
                        }
                    }
                    continue;
                }
                exit_with_usage(&program, &format!("stress: unexpected argument: {arg}"));
            }

            sim::run_stress(config, staff_sets, drone_sets, order_sets, tick_ms, validate)
        }
        Some("inspect") => {
            let Some(path) = args.next() else {
                exit_with_usage(&program, "inspect needs a snapshot path");
            };
            sim::run_inspect(Path::new(&path))
        }
        Some("--help") | Some("-h") | Some("help") => {
            print_usage(&program);
            Ok(())
        }
        Some(other) => {
            exit_with_usage(&program, &format!("unknown command: {other}"));
        }
        None => sim::run_demo(config),
    };

    if let Err(err) = outcome {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
