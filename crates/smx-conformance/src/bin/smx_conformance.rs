#![forbid(unsafe_code)]

use smx_backend_cpu::{CpuFault, FAULT_FORMS};
use smx_conformance::matrix::{ParameterAxes, TestMatrix, read_axes};
use smx_conformance::report::{
    case_logs, emit_suite_json, emit_suite_markdown, render_case_line, write_case_logs,
};
use smx_conformance::{CaseSelector, Harness, HarnessConfig, OutputInit, ShapePolicy};
use std::path::PathBuf;

fn main() {
    init_tracing();
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Returns whether the suite gate is green.
fn run() -> Result<bool, String> {
    let mut args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.is_empty() {
        return Err(usage());
    }

    let command = args.remove(0);
    match command.as_str() {
        "list" => cmd_list(&args).map(|()| true),
        "run" => cmd_run(&args),
        "--help" | "-h" | "help" => {
            println!("{}", usage());
            Ok(true)
        }
        _ => Err(usage()),
    }
}

fn config_from_args(args: &[String]) -> Result<HarnessConfig, String> {
    let mut config = HarnessConfig::from_env().map_err(|err| err.to_string())?;
    if let Some(seed) = optional_parsed_flag::<u64>(args, "--seed")? {
        config.seed = seed;
    }
    if let Some(devices) = optional_parsed_flag::<u32>(args, "--devices")? {
        config.device_count = devices;
    }
    if let Some(filter) = optional_string_flag(args, "--filter")? {
        config.case_filter = Some(filter);
    }
    if let Some(case) = optional_string_flag(args, "--case")? {
        config.case = Some(CaseSelector::parse(&case));
    }
    if let Some(policy) = optional_string_flag(args, "--shape-policy")? {
        config.shape_policy = ShapePolicy::parse(&policy)?;
    }
    if let Some(ceiling) = optional_parsed_flag::<usize>(args, "--max-elements")? {
        config.max_fixture_elements = Some(ceiling);
    }
    if has_flag(args, "--parallel") {
        config.parallel = true;
    }
    if has_flag(args, "--no-backward") {
        config.backward = false;
    }
    if has_flag(args, "--poison-outputs") {
        config.output_init = OutputInit::Poison;
    }
    Ok(config)
}

fn load_axes(args: &[String], config: &HarnessConfig) -> Result<ParameterAxes, String> {
    match optional_string_flag(args, "--axes")? {
        Some(path) => read_axes(&PathBuf::from(path)).map_err(|err| err.to_string()),
        None => {
            let path = config.axes_path();
            if path.exists() {
                read_axes(&path).map_err(|err| err.to_string())
            } else {
                Ok(ParameterAxes::smoke())
            }
        }
    }
}

fn cmd_list(args: &[String]) -> Result<(), String> {
    let config = config_from_args(args)?;
    let axes = load_axes(args, &config)?;
    let matrix = TestMatrix::build(&axes, &config).map_err(|err| err.to_string())?;
    for case in matrix.cases() {
        println!("{:>5}  {}", case.index, case.name());
        if has_flag(args, "--verbose") {
            println!("       {}", render_case_line(case));
        }
    }
    println!(
        "{} of {} cases selected",
        matrix.len(),
        matrix.total_combinations()
    );
    Ok(())
}

fn cmd_run(args: &[String]) -> Result<bool, String> {
    let config = config_from_args(args)?;
    let axes = load_axes(args, &config)?;
    let harness = match optional_string_flag(args, "--inject-fault")? {
        Some(raw) => Harness::cpu_with_fault(config, CpuFault::parse(&raw)?),
        None => Harness::cpu(config),
    };

    let report = harness.run(&axes);

    let mut artifacts = Vec::new();
    if let Some(path) = optional_string_flag(args, "--report")? {
        let path = PathBuf::from(path);
        emit_suite_json(&path, &report)
            .map_err(|err| format!("writing {}: {err}", path.display()))?;
        println!("suite report: {}", path.display());
        artifacts.push(path.display().to_string());
    }
    if let Some(path) = optional_string_flag(args, "--markdown")? {
        let path = PathBuf::from(path);
        std::fs::write(&path, emit_suite_markdown(&report))
            .map_err(|err| format!("writing {}: {err}", path.display()))?;
        artifacts.push(path.display().to_string());
    }
    if let Some(path) = optional_string_flag(args, "--log")? {
        let path = PathBuf::from(path);
        write_case_logs(&path, &case_logs(&report, &artifacts))
            .map_err(|err| format!("writing {}: {err}", path.display()))?;
    }

    println!("{}", report.summary_line());
    Ok(report.is_green())
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|arg| arg == flag)
}

fn optional_parsed_flag<T>(args: &[String], flag: &str) -> Result<Option<T>, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_string_flag(args, flag)?
        .map(|value| {
            value
                .parse::<T>()
                .map_err(|err| format!("invalid {flag}: {err}"))
        })
        .transpose()
}

fn optional_string_flag(args: &[String], flag: &str) -> Result<Option<String>, String> {
    for idx in 0..args.len() {
        if args[idx] == flag {
            if let Some(value) = args.get(idx + 1) {
                return Ok(Some(value.clone()));
            }
            return Err(format!("missing value for {flag}"));
        }
    }
    Ok(None)
}

fn usage() -> String {
    let faults = format!("faults: {FAULT_FORMS}");
    [
        "usage:",
        "  smx_conformance list [--axes <path>] [--shape-policy tied|independent]",
        "                       [--filter <substring>] [--case <index|name>] [--verbose]",
        "  smx_conformance run [--axes <path>] [--seed <u64>] [--devices <u32>] [--parallel]",
        "                      [--no-backward] [--shape-policy tied|independent]",
        "                      [--poison-outputs] [--max-elements <usize>]",
        "                      [--filter <substring>] [--case <index|name>]",
        "                      [--report <path>] [--markdown <path>] [--log <path>]",
        "                      [--inject-fault <fault>]",
        "",
        faults.as_str(),
        "environment: SMX_SEED, SMX_DEVICES, SMX_BACKWARD, SMX_CASE_FILTER, SMX_CASE, RUST_LOG",
    ]
    .join("\n")
}
