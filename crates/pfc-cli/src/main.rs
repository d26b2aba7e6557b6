use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use pfc_runner::RunMode;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pfc", version = "0.3.0", about = "Phase-field-crystal interface workflow")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// YAML configuration file
    #[arg(short = 'c', long)]
    config: PathBuf,
    /// Compute without writing anything under the data directory
    #[arg(short = 'd', long, conflicts_with = "overwrite")]
    dry: bool,
    /// Allow writing into a directory that already holds data
    #[arg(short = 'O', long)]
    overwrite: bool,
    /// Log the series that would be plotted
    #[arg(short = 'p', long)]
    plot: bool,
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn mode(&self) -> RunMode {
        RunMode {
            dry: self.dry,
            overwrite: self.overwrite,
            plot: self.plot,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Search for the solid/liquid coexistence chemical potential
    #[command(alias = "unit_cell")]
    UnitCell(RunArgs),
    /// Build and relax the initial interface field
    #[command(alias = "gen_interface")]
    GenInterface(RunArgs),
    /// Grow the interface until interrupted
    #[command(alias = "run_interface")]
    RunInterface(RunArgs),
    /// Interfacial energies of the checkpointed interfaces
    #[command(alias = "calc_gamma")]
    CalcGamma(RunArgs),
    /// Interface widths of the checkpointed interfaces
    #[command(alias = "calc_width")]
    CalcWidth(RunArgs),
    /// List directories currently held by a run
    Status {
        #[arg(long, default_value = pfc_runner::config::DEFAULT_DATA_DIR)]
        data_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Merge every calc.json below ROOT into one document
    Collect {
        root: PathBuf,
        #[arg(long, default_value = pfc_runner::config::DEFAULT_DATA_DIR)]
        data_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) if pfc_runner::is_already_running(&err) => {
            warn!("{}. Aborted.", err);
            if json_mode {
                emit_json(&json!({
                    "ok": true,
                    "aborted": "already_running",
                    "message": err.to_string()
                }));
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::UnitCell(args) => {
            let report = pfc_runner::unit_cell_from_config(&args.config, args.mode())?;
            if args.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "unit-cell",
                    "report": serde_json::to_value(&report)?
                })));
            }
            println!("dir: {}", report.dir.display());
            println!("mu: {}", report.mu);
            println!("attempts: {}", report.attempts);
            println!("saved: {}", report.saved);
        }
        Commands::GenInterface(args) => {
            let report = pfc_runner::gen_interface_from_config(&args.config, args.mode())?;
            if args.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "gen-interface",
                    "report": serde_json::to_value(&report)?
                })));
            }
            println!("dir: {}", report.dir.display());
            println!("mu: {}", report.mu);
            println!("width: {}", report.width);
            println!("shape: {}x{}", report.shape.0, report.shape.1);
            println!("saved: {}", report.saved);
        }
        Commands::RunInterface(args) => {
            let keep_going = Arc::new(AtomicBool::new(true));
            let flag = Arc::clone(&keep_going);
            ctrlc::set_handler(move || {
                flag.store(false, Ordering::SeqCst);
            })?;
            let report =
                pfc_runner::run_interface_from_config(&args.config, args.mode(), &keep_going)?;
            if args.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run-interface",
                    "report": serde_json::to_value(&report)?
                })));
            }
            println!("dir: {}", report.dir.display());
            println!("first_index: {}", report.first_index);
            println!("next_index: {}", report.next_index);
        }
        Commands::CalcGamma(args) => {
            let report = pfc_runner::calc_gamma_from_config(&args.config, args.mode())?;
            if args.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "calc-gamma",
                    "report": serde_json::to_value(&report)?
                })));
            }
            println!("mu: {}", report.mu);
            println!("omega_l: {}", report.omega_l);
            println!("omega_s: {}", report.omega_s);
            println!("gamma: {:?}", report.gamma);
            println!("saved: {}", report.saved);
        }
        Commands::CalcWidth(args) => {
            let report = pfc_runner::calc_width_from_config(&args.config, args.mode())?;
            if args.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "calc-width",
                    "report": serde_json::to_value(&report)?
                })));
            }
            println!("uc_factor: {}", report.uc_factor);
            for w in &report.widths {
                println!("widths: {:?}", w);
            }
            println!("saved: {}", report.saved);
        }
        Commands::Status { data_dir, json } => {
            let running = pfc_runner::running_markers(&data_dir)?;
            if json {
                let dirs: Vec<String> = running.iter().map(|p| p.display().to_string()).collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "running": dirs
                })));
            }
            println!("{} running:", running.len());
            for dir in &running {
                println!("    {}", dir.display());
            }
        }
        Commands::Collect {
            root,
            data_dir,
            json,
        } => {
            let merged = pfc_runner::collect(&data_dir, &root)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "collect",
                    "data": merged
                })));
            }
            println!("{}", serde_json::to_string_pretty(&merged)?);
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    use pfc_runner::PfcError;
    match err.downcast_ref::<PfcError>() {
        Some(PfcError::MissingKey { .. }) | Some(PfcError::InvalidConfig { .. }) => "invalid_config",
        Some(PfcError::AlreadyRunning { .. }) => "already_running",
        Some(PfcError::DataExists(_)) => "data_exists",
        Some(PfcError::PersistentLiquefaction { .. }) => "persistent_liquefaction",
        Some(PfcError::InvalidRoot { .. }) => "invalid_root",
        Some(PfcError::CorruptCheckpoints { .. }) => "corrupt_checkpoints",
        Some(PfcError::Engine { .. }) => "engine_failed",
        None => "command_failed",
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::UnitCell(args)
        | Commands::GenInterface(args)
        | Commands::RunInterface(args)
        | Commands::CalcGamma(args)
        | Commands::CalcWidth(args) => args.json,
        Commands::Status { json, .. } | Commands::Collect { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_and_overwrite_are_mutually_exclusive() {
        let parsed = Cli::try_parse_from(["pfc", "unit-cell", "-c", "cfg.yaml", "-d", "-O"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn run_flags_map_onto_run_mode() {
        let cli = Cli::try_parse_from(["pfc", "run_interface", "-c", "cfg.yaml", "-O", "-p"])
            .expect("parse");
        match cli.command {
            Commands::RunInterface(args) => {
                assert_eq!(
                    args.mode(),
                    RunMode {
                        dry: false,
                        overwrite: true,
                        plot: true
                    }
                );
                assert_eq!(args.config, PathBuf::from("cfg.yaml"));
            }
            _ => panic!("expected run-interface"),
        }
    }

    #[test]
    fn config_is_required() {
        assert!(Cli::try_parse_from(["pfc", "calc-gamma"]).is_err());
    }

    #[test]
    fn collect_defaults_data_dir() {
        let cli = Cli::try_parse_from(["pfc", "collect", "data/64x64", "--json"]).expect("parse");
        assert!(command_json_mode(&cli.command));
        match cli.command {
            Commands::Collect { root, data_dir, .. } => {
                assert_eq!(root, PathBuf::from("data/64x64"));
                assert_eq!(data_dir, PathBuf::from("data"));
            }
            _ => panic!("expected collect"),
        }
    }
}
