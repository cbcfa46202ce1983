use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use chrono::Local;
use clap::{Args, CommandFactory, Parser, Subcommand};
use wikidump_core::alternate::RstConverter;
use wikidump_core::config::{DEFAULT_CONFIG_FILENAME, load_config, resolve_credentials};
use wikidump_core::editor::write_editor;
use wikidump_core::layout::{ExportLayout, REPORT_JSON, run_folder_name, run_title, sanitize_filename};
use wikidump_core::nav::UnwrapOutcome;
use wikidump_core::patch::{PatchOptions, patch_site};
use wikidump_core::pipeline::{ExportOptions, ExportReport, run_export};
use wikidump_core::remote::{ConfluenceClient, ConfluenceClientConfig, CorpusApi};
use wikidump_core::scan::{ScanRules, Strategy, list_collections};

#[derive(Debug, Parser)]
#[command(
    name = "wikidump",
    version,
    about = "Export Confluence pages into a browsable offline HTML site"
)]
struct Cli {
    #[arg(short = 'o', long, global = true, value_name = "DIR", default_value = ".")]
    outdir: PathBuf,
    #[arg(long, global = true, value_name = "URL", help = "Site URL (falls back to CONFLUENCE_BASE_URL)")]
    base_url: Option<String>,
    #[arg(long, global = true, value_name = "NAME", default_value = "cloud")]
    profile: String,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH", help = "Data Center context path, e.g. /confluence")]
    context_path: Option<String>,
    #[arg(long, global = true, value_name = "PATH", help = "Extra stylesheet copied into styles/")]
    css_file: Option<PathBuf>,
    #[arg(short = 'R', long, global = true, help = "Also write reStructuredText via pandoc")]
    rst: bool,
    #[arg(short = 't', long, global = true, value_name = "N", default_value_t = 1)]
    threads: usize,
    #[arg(long = "exclude-page-id", global = true, value_name = "ID", help = "Prune this page and its subtree (repeatable)")]
    exclude_page_ids: Vec<String>,
    #[arg(long, global = true, help = "Skip failed pages instead of writing a placeholder")]
    skip_failed: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    outdir: PathBuf,
    base_url: Option<String>,
    profile: String,
    config: PathBuf,
    context_path: Option<String>,
    css_file: Option<PathBuf>,
    rst: bool,
    threads: usize,
    exclude_page_ids: Vec<String>,
    skip_failed: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            outdir: cli.outdir.clone(),
            base_url: cli.base_url.clone(),
            profile: cli.profile.clone(),
            config: cli
                .config
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILENAME)),
            context_path: cli.context_path.clone(),
            css_file: cli.css_file.clone(),
            rst: cli.rst,
            threads: cli.threads,
            exclude_page_ids: cli.exclude_page_ids.clone(),
            skip_failed: cli.skip_failed,
        }
    }

    fn scan_rules(&self, exclude_label: Option<String>) -> ScanRules {
        ScanRules {
            exclude_ids: self
                .exclude_page_ids
                .iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
            exclude_label,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Export one page")]
    Single(PageArgs),
    #[command(about = "Export a page and all of its descendants")]
    Tree(PageArgs),
    #[command(about = "Export a whole space")]
    Space(SpaceArgs),
    #[command(about = "Export every page carrying a label, with descendants")]
    Label(LabelArgs),
    #[command(name = "all-spaces", about = "Export every space into its own folder")]
    AllSpaces,
    #[command(about = "Rework the navigation of an existing export")]
    Sidebar(SidebarArgs),
}

#[derive(Debug, Args)]
struct PageArgs {
    #[arg(short = 'p', long = "pageid", value_name = "ID")]
    page_id: String,
}

#[derive(Debug, Args)]
struct SpaceArgs {
    #[arg(short = 's', long, value_name = "KEY")]
    space_key: String,
}

#[derive(Debug, Args)]
struct LabelArgs {
    #[arg(short = 'l', long, value_name = "LABEL")]
    label: String,
    #[arg(long, value_name = "LABEL", help = "Prune descendants carrying this label")]
    exclude_label: Option<String>,
}

#[derive(Debug, Args)]
struct SidebarArgs {
    #[command(subcommand)]
    command: SidebarSubcommand,
}

#[derive(Debug, Subcommand)]
enum SidebarSubcommand {
    #[command(about = "Rewrite every page's sidebar from the outline text")]
    Patch(PatchArgs),
    #[command(about = "Generate the drag-and-drop outline editor page")]
    Editor(SiteArgs),
}

#[derive(Debug, Args)]
struct PatchArgs {
    #[arg(long, value_name = "DIR")]
    site_dir: PathBuf,
    #[arg(long, help = "Use sidebar_orig.md instead of the edited outline")]
    restore_original: bool,
    #[arg(long, help = "Promote the children of a single top-level entry")]
    unwrap: bool,
}

#[derive(Debug, Args)]
struct SiteArgs {
    #[arg(long, value_name = "DIR")]
    site_dir: PathBuf,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Single(PageArgs { page_id })) => run_export_command(
            &runtime,
            Strategy::Single { id: page_id },
            runtime.scan_rules(None),
        ),
        Some(Commands::Tree(PageArgs { page_id })) => run_export_command(
            &runtime,
            Strategy::Tree { root_id: page_id },
            runtime.scan_rules(None),
        ),
        Some(Commands::Space(SpaceArgs { space_key })) => run_export_command(
            &runtime,
            Strategy::Collection { key: space_key },
            runtime.scan_rules(None),
        ),
        Some(Commands::Label(LabelArgs {
            label,
            exclude_label,
        })) => run_export_command(
            &runtime,
            Strategy::LabelForest { label },
            runtime.scan_rules(exclude_label),
        ),
        Some(Commands::AllSpaces) => run_all_spaces(&runtime),
        Some(Commands::Sidebar(SidebarArgs { command })) => match command {
            SidebarSubcommand::Patch(args) => run_sidebar_patch(args),
            SidebarSubcommand::Editor(SiteArgs { site_dir }) => run_sidebar_editor(&site_dir),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_export_command(runtime: &RuntimeOptions, strategy: Strategy, rules: ScanRules) -> Result<()> {
    let (client, base_url) = connect(runtime)?;
    let title = run_title(&client, &strategy);
    let run_dir = runtime.outdir.join(run_folder_name(Local::now(), &title));
    println!("export {}", strategy.describe());
    println!("output_dir: {}", normalize_path(&run_dir));

    let report = export_into(runtime, &client, &base_url, &run_dir, &strategy, &rules)?;
    print_export_report("export", &report);
    finish(&report)
}

fn run_all_spaces(runtime: &RuntimeOptions) -> Result<()> {
    let (client, base_url) = connect(runtime)?;
    let keys = list_collections(&client);
    if keys.is_empty() {
        bail!("no spaces visible to the configured credentials");
    }
    let run_dir = runtime.outdir.join(run_folder_name(Local::now(), "all spaces"));
    println!("export all-spaces");
    println!("output_dir: {}", normalize_path(&run_dir));
    println!("spaces.count: {}", keys.len());

    let rules = runtime.scan_rules(None);
    let mut failed_spaces = Vec::new();
    for key in keys {
        let folder = sanitize_filename(&key);
        let folder = if folder.is_empty() { "space".to_string() } else { folder };
        let strategy = Strategy::Collection { key: key.clone() };
        match export_into(runtime, &client, &base_url, &run_dir.join(folder), &strategy, &rules) {
            Ok(report) => print_export_report(&format!("space.{key}"), &report),
            Err(error) => {
                tracing::warn!("space {key} failed: {error:#}");
                failed_spaces.push(key);
            }
        }
    }
    if !failed_spaces.is_empty() {
        bail!("{} space(s) failed: {}", failed_spaces.len(), failed_spaces.join(", "));
    }
    println!("requests: {}", client.request_count());
    Ok(())
}

fn export_into(
    runtime: &RuntimeOptions,
    client: &ConfluenceClient,
    base_url: &str,
    run_dir: &Path,
    strategy: &Strategy,
    rules: &ScanRules,
) -> Result<ExportReport> {
    let layout = ExportLayout::create(run_dir)?;
    let stylesheets = layout.install_styles(runtime.css_file.as_deref())?;
    let rst = if runtime.rst {
        let converter = RstConverter::discover();
        match &converter {
            Some(converter) => {
                tracing::info!("using pandoc at {}", converter.pandoc_path().display());
            }
            None => {
                tracing::warn!(
                    "pandoc not found (set PANDOC_PATH); skipping reStructuredText output"
                );
            }
        }
        converter
    } else {
        None
    };
    let options = ExportOptions {
        base_url: base_url.to_string(),
        threads: runtime.threads,
        stylesheets,
        rst,
        skip_failed: runtime.skip_failed,
    };
    run_export(client, &layout, strategy, rules, &options)
}

fn connect(runtime: &RuntimeOptions) -> Result<(ConfluenceClient, String)> {
    let base_url = match runtime
        .base_url
        .clone()
        .or_else(|| env::var("CONFLUENCE_BASE_URL").ok())
        .map(|url| url.trim().trim_end_matches('/').to_string())
        .filter(|url| !url.is_empty())
    {
        Some(url) => url,
        None => bail!("exports require --base-url or CONFLUENCE_BASE_URL"),
    };
    let config = load_config(&runtime.config)?;
    let profile = config.profile(&runtime.profile)?;
    let credentials = resolve_credentials(profile.auth_method())?;
    let client_config = ConfluenceClientConfig::from_profile(
        &config,
        &profile,
        &base_url,
        runtime.context_path.as_deref(),
        credentials,
    );
    tracing::info!("using profile {} against {}", runtime.profile, client_config.api_root);
    let client = ConfluenceClient::new(client_config)?;
    Ok((client, base_url))
}

fn finish(report: &ExportReport) -> Result<()> {
    if report.scanned == 0 {
        tracing::warn!("nothing exported: the inventory is empty");
    } else if report.exported == 0 {
        bail!("every page failed to export ({} scanned)", report.scanned);
    }
    Ok(())
}

fn print_export_report(prefix: &str, report: &ExportReport) {
    println!("{prefix}.strategy: {}", report.strategy);
    println!("{prefix}.output_dir: {}", report.output_dir.replace('\\', "/"));
    println!("{prefix}.workers: {}", report.workers);
    println!("{prefix}.scanned: {}", report.scanned);
    println!("{prefix}.exported: {}", report.exported);
    println!("{prefix}.placeholders: {}", report.placeholders);
    println!("{prefix}.skipped: {}", report.skipped);
    println!("{prefix}.attachments_saved: {}", report.attachments_saved);
    println!("{prefix}.attachments_failed: {}", report.attachments_failed);
    println!("{prefix}.rst_written: {}", report.rst_written);
    println!("{prefix}.requests: {}", report.requests);
    println!("{prefix}.report: logs/{REPORT_JSON}");
    if report.failures.is_empty() {
        println!("{prefix}.failures: <none>");
    } else {
        for failure in &report.failures {
            println!("{prefix}.failure.{}: {}", failure.id, failure.reason);
        }
    }
}

fn run_sidebar_patch(args: PatchArgs) -> Result<()> {
    let report = patch_site(
        &args.site_dir,
        PatchOptions {
            restore_original: args.restore_original,
            unwrap: args.unwrap,
        },
    )?;
    println!("sidebar patch");
    println!("site_dir: {}", normalize_path(&args.site_dir));
    println!("source: {}", normalize_path(&report.source));
    println!(
        "unwrap: {}",
        match report.unwrap {
            None => "not requested".to_string(),
            Some(UnwrapOutcome::Unwrapped { promoted }) => format!("promoted {promoted}"),
            Some(UnwrapOutcome::Skipped { top_level }) => {
                format!("skipped ({top_level} top-level entries)")
            }
        }
    );
    println!("nav_nodes: {}", report.nav_nodes);
    println!("patched: {}", report.patched);
    println!("untouched: {}", report.untouched);
    if report.failed.is_empty() {
        println!("failed: <none>");
    } else {
        for path in &report.failed {
            println!("failed.path: {}", normalize_path(path));
        }
        bail!("{} page(s) could not be patched", report.failed.len());
    }
    Ok(())
}

fn run_sidebar_editor(site_dir: &Path) -> Result<()> {
    let report = write_editor(site_dir)?;
    println!("sidebar editor");
    println!("source: {}", normalize_path(&report.source));
    println!("created_working_copy: {}", format_flag(report.created_working_copy));
    println!("nodes: {}", report.nodes);
    println!("output: {}", normalize_path(&report.output));
    Ok(())
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
