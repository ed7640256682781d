use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use repowiki_agent::{AskAgent, AskOptions};
use repowiki_core::AppConfig;
use repowiki_index::IndexService;
use repowiki_llm::OpenAiCompatClient;
use repowiki_observe::Observer;
use repowiki_tools::{builtin_registry, ToolContext};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "repowiki")]
#[command(about = "Ask questions about a repository; every answer is backed by verified file citations", long_about = None)]
struct Cli {
    /// Repository root.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,
    /// Emit machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question about the repository.
    Ask(AskArgs),
    /// Manage the full-text index.
    Index {
        #[command(subcommand)]
        command: IndexCmd,
    },
    /// Print a repository overview.
    Summary,
    /// List the registered tools and their argument schemas.
    Tools,
}

#[derive(Args)]
struct AskArgs {
    question: String,
    /// Write the step log (JSON array) to this path.
    #[arg(long)]
    steps: Option<PathBuf>,
    #[arg(long)]
    max_steps: Option<u32>,
    #[arg(long)]
    model: Option<String>,
    /// Mirror step-by-step progress to stderr.
    #[arg(long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum IndexCmd {
    /// Walk the repository and (re)build the index.
    Build,
    /// Report row count, database size, and staleness.
    Status,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("repowiki error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let repo_root = fs::canonicalize(&cli.repo)
        .map_err(|_| anyhow!("repository root not found: {}", cli.repo.display()))?;

    match cli.command {
        Commands::Ask(args) => ask(&repo_root, cli.json, args),
        Commands::Index { command } => index(&repo_root, cli.json, command),
        Commands::Summary => summary(&repo_root, cli.json),
        Commands::Tools => tools(&repo_root, cli.json),
    }
}

fn ask(repo_root: &Path, json: bool, args: AskArgs) -> Result<()> {
    let cfg = AppConfig::load(repo_root)?;
    let mut options = AskOptions::from_config(&cfg);
    if let Some(max_steps) = args.max_steps {
        options.max_steps = max_steps;
    }
    if let Some(model) = args.model {
        options.model = model;
    }

    let mut index = IndexService::open(repo_root)?
        .with_extra_skip_dirs(cfg.index.extra_skip_dirs.clone());
    if index.file_count()? == 0 {
        let stats = index.index_repository()?;
        eprintln!(
            "[repowiki] built index: {} file(s), {} skipped",
            stats.indexed, stats.skipped
        );
    }
    let registry = builtin_registry(ToolContext {
        repo_root: repo_root.to_path_buf(),
        index,
        max_excerpt_lines: options.max_excerpt_lines,
    });

    let mut observer = Observer::new(repo_root)?;
    observer.set_verbose(args.verbose);
    let _ = observer.record(&format!("ask: {}", args.question));

    let llm = OpenAiCompatClient::new(cfg.llm.clone())?;
    let agent = AskAgent::new(&llm, registry, options).with_observer(&observer);
    let result = agent.ask(&args.question);

    if let Some(path) = &args.steps {
        fs::write(path, serde_json::to_vec_pretty(&result.steps)?)?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result.answer_markdown);
        if result.verified {
            eprintln!(
                "[repowiki] verified with {} citation(s) in {} step(s), {} ms",
                result.verified_citations.len(),
                result.steps.len(),
                result.total_ms
            );
        } else {
            eprintln!(
                "[repowiki] unverified answer ({})",
                result.error.as_deref().unwrap_or("unknown reason")
            );
        }
    }

    if result.error.is_some() {
        std::process::exit(1);
    }
    Ok(())
}

fn index(repo_root: &Path, json: bool, command: IndexCmd) -> Result<()> {
    let cfg = AppConfig::load(repo_root)?;
    let mut index = IndexService::open(repo_root)?
        .with_extra_skip_dirs(cfg.index.extra_skip_dirs.clone());
    match command {
        IndexCmd::Build => {
            let stats = index.index_repository()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("indexed {} file(s), skipped {}", stats.indexed, stats.skipped);
            }
        }
        IndexCmd::Status => {
            let status = index.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!(
                    "{} file(s) indexed, {} stale, database {} bytes",
                    status.files, status.stale, status.db_bytes
                );
            }
        }
    }
    Ok(())
}

fn summary(repo_root: &Path, json: bool) -> Result<()> {
    let mut index = IndexService::open(repo_root)?;
    if index.file_count()? == 0 {
        index.index_repository()?;
    }
    let cfg = AppConfig::load(repo_root)?;
    let registry = builtin_registry(ToolContext {
        repo_root: repo_root.to_path_buf(),
        index,
        max_excerpt_lines: cfg.agent.max_excerpt_lines,
    });
    let result = registry.execute_call("get_repo_summary", "{}");
    if !result.success {
        return Err(anyhow!(
            "summary failed: {}",
            result.error.unwrap_or_default()
        ));
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&result.data)?);
    } else {
        println!("{}", result.output_summary);
    }
    Ok(())
}

fn tools(repo_root: &Path, json: bool) -> Result<()> {
    let cfg = AppConfig::load(repo_root)?;
    let index = IndexService::open(repo_root)?;
    let registry = builtin_registry(ToolContext {
        repo_root: repo_root.to_path_buf(),
        index,
        max_excerpt_lines: cfg.agent.max_excerpt_lines,
    });
    if json {
        println!("{}", serde_json::to_string_pretty(&registry.tool_schemas())?);
    } else {
        for (name, description) in registry.descriptions() {
            println!("{name}: {description}");
        }
    }
    Ok(())
}
