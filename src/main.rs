//! geoingest CLI entry point

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use geoingest::{
    app::App,
    commands::{
        cmd_analyze, cmd_ingest, cmd_init, cmd_list_analyses, cmd_list_jobs, cmd_show_job,
        cmd_status, print_analyses, print_analyze_result, print_ingest_run, print_job, print_jobs,
        print_status, prompt_confirm, IngestOptions, InitOptions, JobListOptions,
    },
    config::Config,
    error::{Error, Result},
    progress::LogWriterFactory,
};
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing::{debug, error};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "geoingest")]
#[command(version, about = "Manifest-driven geospatial ingestion and job tracking", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize geoingest configuration and catalog
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,

        /// Write defaults without prompting
        #[arg(long)]
        non_interactive: bool,

        /// Accept defaults for every prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Ingest a manifest of projects, datasets and charts
    Ingest {
        /// Manifest path, relative to the data directory
        manifest: PathBuf,

        /// Replace items that already exist
        #[arg(long)]
        replace: bool,

        /// Delete all projects, datasets and charts before ingesting
        #[arg(long)]
        clear: bool,

        /// Download remote files again even if cached
        #[arg(long)]
        skip_cache: bool,

        /// Answer yes to the --clear confirmation
        #[arg(short, long)]
        yes: bool,

        /// Owner assigned to created projects and datasets
        #[arg(long, env = "GEOINGEST_OWNER")]
        owner: Option<String>,
    },

    /// List job records
    Jobs {
        /// Only jobs of this project
        #[arg(long)]
        project: Option<String>,

        /// Only jobs of this type
        #[arg(long = "type")]
        job_type: Option<String>,

        /// Maximum number of jobs
        #[arg(short, long)]
        limit: Option<i64>,
    },

    /// Show one job record
    Job {
        /// Job ID
        id: String,
    },

    /// List enabled analysis types
    Analyses,

    /// Run an analysis against a project
    Analyze {
        /// Project name
        project: String,

        /// Analysis type identifier
        analysis: String,

        /// Analysis input as key=value (repeatable)
        #[arg(short, long = "input")]
        inputs: Vec<String>,

        /// Print the job ID without waiting for the result
        #[arg(long)]
        detach: bool,
    },

    /// Show configuration paths and catalog counts
    Status,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(LogWriterFactory::default()))
        .with(filter)
        .init();

    // Handle init command specially (doesn't need existing config)
    if matches!(cli.command, Commands::Init { .. }) {
        return handle_init(cli).await;
    }

    // Handle completions command (doesn't need config/catalog)
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "geoingest", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let app = App::open(config).await?;

    match cli.command {
        Commands::Init { .. } | Commands::Completions { .. } => unreachable!(),

        Commands::Ingest {
            manifest,
            replace,
            clear,
            skip_cache,
            yes,
            owner,
        } => {
            let options = IngestOptions {
                replace,
                clear,
                skip_cache,
                owner,
            };
            let run = cmd_ingest(&app, &manifest, &options, |label| {
                if yes {
                    return Ok(true);
                }
                if !std::io::stdin().is_terminal() {
                    return Err(Error::Config(
                        "--clear needs confirmation; pass --yes when not running in a terminal"
                            .to_string(),
                    ));
                }
                prompt_confirm(label, false, false)
            })
            .await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                print_ingest_run(&run);
            }
        }

        Commands::Jobs {
            project,
            job_type,
            limit,
        } => {
            let options = JobListOptions {
                project,
                job_type,
                limit,
            };
            let jobs = cmd_list_jobs(&app, options).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                print_jobs(&jobs);
            }
        }

        Commands::Job { id } => {
            let job = cmd_show_job(&app, &id).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                print_job(&job);
            }
        }

        Commands::Analyses => {
            let analyses = cmd_list_analyses(&app);

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&analyses)?);
            } else {
                print_analyses(&analyses);
            }
        }

        Commands::Analyze {
            project,
            analysis,
            inputs,
            detach,
        } => {
            let result = cmd_analyze(&app, &project, &analysis, &inputs, detach).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_analyze_result(&result);
            }
        }

        Commands::Status => {
            let status = cmd_status(&app).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
    }

    // Detached jobs still need the runtime to reach their terminal state
    let drained = app.queue.drain().await;
    if drained > 0 {
        debug!(jobs = drained, "Waited for detached jobs");
    }

    Ok(())
}

async fn handle_init(cli: Cli) -> Result<()> {
    let Commands::Init {
        force,
        non_interactive,
        yes,
    } = cli.command
    else {
        unreachable!()
    };

    // A config path names its base directory; otherwise use ~/.geoingest
    let (base_dir, config_path) = match cli.config {
        Some(path) => {
            let base = path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(Config::default_base_dir);
            (base, path)
        }
        None => (Config::default_base_dir(), Config::default_config_path()),
    };

    cmd_init(InitOptions {
        base_dir,
        config_path,
        force,
        non_interactive,
        yes,
    })
    .await
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => Config::load_from(None),
    }
}
