use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_provisioner::app::{App, Selection};
use kira_provisioner::command::LocalExecutor;
use kira_provisioner::config::{ConfigLoader, ProvisionConfig, ResolvedCatalog};
use kira_provisioner::domain::AcquisitionMode;
use kira_provisioner::error::KiraError;
use kira_provisioner::fetch::{HttpFetcher, NetworkRetriever};
use kira_provisioner::output::{JsonOutput, OutputMode, TextOutput};

#[derive(Parser)]
#[command(name = "kira-prov")]
#[command(about = "Provision bioinformatics tools and reference genomes onto a host")]
#[command(version, author)]
struct Cli {
    /// Print machine-readable JSON instead of a summary
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Catalog file (default: ./kira-prov.json)
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    dry_run: bool,

    /// Name used for this host in logs and scratch directories
    #[arg(long, global = true)]
    host: Option<String>,

    #[arg(long, global = true)]
    install_root: Option<Utf8PathBuf>,

    #[arg(long, global = true)]
    data_root: Option<Utf8PathBuf>,

    /// Scratch space for downloads (default: system temp dir)
    #[arg(long, global = true)]
    work_root: Option<Utf8PathBuf>,

    #[arg(long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Install resources from their upstream sources")]
    Install(SelectArgs),
    #[command(about = "Install resources from pre-built snapshots")]
    InstallFromSnapshot(SelectArgs),
    #[command(about = "Pack installed resources and upload them as snapshots")]
    UploadSnapshot(SelectArgs),
    #[command(about = "Download, normalize and index reference genomes")]
    Genomes(GenomeArgs),
    #[command(about = "List installed resources and genomes")]
    List,
}

#[derive(Args, Clone)]
struct SelectArgs {
    /// Resource name, optionally pinned as name@version (repeatable)
    #[arg(long = "resource")]
    resources: Vec<String>,

    #[arg(long)]
    category: Option<String>,
}

#[derive(Args, Clone)]
struct GenomeArgs {
    /// Genome id (repeatable; default: every genome in the catalog)
    #[arg(long = "genome")]
    genomes: Vec<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::MissingConfig
        | KiraError::ConfigRead(_)
        | KiraError::ConfigParse(_)
        | KiraError::InvalidCatalog(_)
        | KiraError::InvalidTemplate { .. }
        | KiraError::InvalidVersion(_)
        | KiraError::InvalidResourceName(_)
        | KiraError::UnknownResource(_)
        | KiraError::UnknownVersion { .. }
        | KiraError::UnknownGenome(_)
        | KiraError::UnknownIndexKind(_) => 2,
        KiraError::BatchFailed { .. } | KiraError::Exhausted { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let mut config = ProvisionConfig::new()?;
    if let Some(root) = &cli.install_root {
        config.install_root = root.clone();
    }
    if let Some(root) = &cli.data_root {
        config.data_root = root.clone();
    }
    if let Some(root) = &cli.work_root {
        config.work_root = root.clone();
    }
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(threads) = cli.threads {
        config.threads = threads.max(1);
    }
    config.dry_run = cli.dry_run;
    if matches!(cli.command, Commands::InstallFromSnapshot(_)) {
        config.mode = AcquisitionMode::Snapshot;
    }

    if let Commands::List = cli.command {
        let app = build_app(config)?;
        return run_list(&app, output_mode);
    }

    let catalog = ConfigLoader::resolve(cli.config.as_deref())?;
    tracing::debug!(
        schema = catalog.schema_version,
        resources = catalog.resources.len(),
        genomes = catalog.genomes.len(),
        "catalog loaded"
    );
    let app = build_app(config)?;

    match cli.command {
        Commands::Install(args) | Commands::InstallFromSnapshot(args) => {
            run_install(&app, &catalog, selection(args), output_mode)
        }
        Commands::UploadSnapshot(args) => run_upload(&app, &catalog, selection(args), output_mode),
        Commands::Genomes(args) => run_genomes(&app, &catalog, &args.genomes, output_mode),
        Commands::List => run_list(&app, output_mode),
    }
}

type ProdApp = App<NetworkRetriever<LocalExecutor>, LocalExecutor, HttpFetcher>;

fn build_app(config: ProvisionConfig) -> miette::Result<ProdApp> {
    let http = HttpFetcher::new()?;
    let executor = LocalExecutor::new();
    let retriever = NetworkRetriever::new(http.clone(), executor);
    Ok(App::new(config, retriever, executor, http))
}

fn selection(args: SelectArgs) -> Selection {
    Selection {
        names: args.resources,
        category: args.category,
    }
}

fn run_install(
    app: &ProdApp,
    catalog: &ResolvedCatalog,
    selection: Selection,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let result = match output_mode {
        OutputMode::NonInteractive => {
            let result = app.install(catalog, &selection, &JsonOutput)?;
            JsonOutput::print_install(&result).into_diagnostic()?;
            result
        }
        OutputMode::Interactive => {
            let result = app.install(catalog, &selection, &TextOutput)?;
            TextOutput::print_install(&result);
            result
        }
    };
    result.check()?;
    Ok(())
}

fn run_upload(
    app: &ProdApp,
    catalog: &ResolvedCatalog,
    selection: Selection,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let result = match output_mode {
        OutputMode::NonInteractive => {
            let result = app.upload_snapshots(catalog, &selection, &JsonOutput)?;
            JsonOutput::print_upload(&result).into_diagnostic()?;
            result
        }
        OutputMode::Interactive => {
            let result = app.upload_snapshots(catalog, &selection, &TextOutput)?;
            TextOutput::print_upload(&result);
            result
        }
    };
    if result.failed > 0 {
        return Err(miette::Report::msg(format!(
            "{} snapshot upload(s) failed",
            result.failed
        )));
    }
    Ok(())
}

fn run_genomes(
    app: &ProdApp,
    catalog: &ResolvedCatalog,
    genomes: &[String],
    output_mode: OutputMode,
) -> miette::Result<()> {
    let result = match output_mode {
        OutputMode::NonInteractive => {
            let result = app.prepare_genomes(catalog, genomes, &JsonOutput)?;
            JsonOutput::print_genomes(&result).into_diagnostic()?;
            result
        }
        OutputMode::Interactive => {
            let result = app.prepare_genomes(catalog, genomes, &TextOutput)?;
            TextOutput::print_genomes(&result);
            result
        }
    };
    result.check()?;
    Ok(())
}

fn run_list(app: &ProdApp, output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.list(&JsonOutput)?;
            JsonOutput::print_list(&result).into_diagnostic()?;
        }
        OutputMode::Interactive => {
            let result = app.list(&TextOutput)?;
            TextOutput::print_list(&result);
        }
    }
    Ok(())
}
