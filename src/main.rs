use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use docrag::{
    DataDir,
    Pipeline,
    Settings,
    error,
    mcp,
    model_manager,
    output,
    settings::ModelBackend,
};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("DOCRAG_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

/// `--model hashing` selects the offline backend; anything else names a
/// ColBERT checkpoint.
fn apply_model_override(settings: &mut Settings, model: Option<&str>) {
    match model {
        Some(m) if m.eq_ignore_ascii_case("hashing") => {
            settings.model.backend = ModelBackend::Hashing;
        }
        Some(m) => {
            settings.model.backend = ModelBackend::Colbert;
            settings.model.model_id = m.to_string();
        }
        None => {}
    }
}

fn resolve_root(cli_root: Option<PathBuf>, settings: &Settings) -> error::Result<PathBuf> {
    let root = match cli_root.or_else(|| settings.ingestion.root.clone()) {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    if !root.is_dir() {
        return Err(error::Error::Config(format!(
            "document root is not a directory: {}",
            root.display()
        )));
    }
    root.canonicalize().map_err(|e| {
        error::Error::Config(format!("cannot resolve root {}: {e}", root.display()))
    })
}

fn open_pipeline(cli: &Cli) -> error::Result<Pipeline> {
    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let mut settings = Settings::load(&data_dir.settings_file())?;
    apply_model_override(&mut settings, cli.model.as_deref());
    let root = resolve_root(cli.root.clone(), &settings)?;

    let (embedder, scorer) = model_manager::load_models(&settings.model);
    tracing::debug!(
        root = %root.display(),
        embedder = embedder.model_id(),
        scorer = scorer.model_id(),
        "resolved configuration"
    );
    Pipeline::open(&data_dir, settings, root, embedder, scorer)
}

fn run(cli: Cli) -> error::Result<()> {
    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let pipeline = open_pipeline(&cli)?;

    match cli.command {
        Command::Reindex(args) => {
            let report = pipeline.reindex(args.clear_cache)?;
            if args.json {
                println!("{}", output::to_json(&report)?);
            } else {
                println!("{}", output::reindex_human(&report));
            }
        }
        Command::Retrieve(args) => {
            let retrieval = pipeline.retrieve_passages(&args.query)?;
            if args.json {
                println!("{}", output::to_json(&retrieval)?);
            } else {
                println!("{}", output::retrieval_human(&retrieval));
            }
        }
        Command::Status(args) => {
            let status = pipeline.status()?;
            if args.json {
                println!("{}", output::to_json(&status)?);
            } else {
                println!("{}", output::status_human(&status));
            }
        }
        Command::Mcp => mcp::run_mcp(pipeline)?,
        Command::Completions(_) => {}
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = ?e, "command failed");
            eprintln!("error: {}", e.user_message());
            ExitCode::FAILURE
        }
    }
}
