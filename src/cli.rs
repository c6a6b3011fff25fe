use crate::{
    config::{self, AppConfig},
    download::{self, CancelToken, DownloadProgress, ProgressCallback},
    error,
    importer::{InstallReport, InstalledMod},
    layout::GameLayout,
    library::{self, ModRecord},
    logging,
    modpack::{self, ModPackBuilder},
    update::{self, UpdateCheck},
};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::{
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{Arc, Mutex},
};
use tracing::{debug, warn};

#[derive(Debug, Parser)]
#[command(name = "rigsmith", version, about = "Mod manager for Brick Rigs")]
pub struct Cli {
    /// Show debug output on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List installed mods and their state.
    List {
        #[arg(long)]
        json: bool,
    },
    Enable {
        name: String,
    },
    Disable {
        name: String,
    },
    Toggle {
        name: String,
    },
    /// Remove a mod from disk.
    Delete {
        name: String,
        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },
    /// Install archives, paks or mod folders.
    Install {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Download a mod and install it.
    InstallUrl {
        url: String,
    },
    #[command(subcommand)]
    Pack(PackCommand),
    #[command(subcommand)]
    Update(UpdateCommand),
    /// Show the directories in use.
    Paths {
        #[arg(long)]
        json: bool,
    },
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
enum PackCommand {
    /// Bundle installed mods (by name) or mod paths into a pack.
    Create(PackCreateArgs),
    Inspect { archive: PathBuf },
    Install { archive: PathBuf },
}

#[derive(Debug, Args)]
struct PackCreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    author: String,
    #[arg(long = "version")]
    pack_version: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long)]
    thumbnail: Option<PathBuf>,
    #[arg(short, long)]
    output: PathBuf,
    #[arg(required = true)]
    mods: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum UpdateCommand {
    Check {
        #[arg(long)]
        feed: Option<String>,
    },
    Download {
        #[arg(long)]
        feed: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show,
    SetGame { path: PathBuf },
    SetFeed { url: String },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let data_dir = match config::base_data_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    let _log_guard = match logging::init(&data_dir, cli.verbose) {
        Ok(guard) => Some(guard),
        Err(err) => {
            eprintln!("warning: logging disabled: {err:#}");
            None
        }
    };

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || handler_token.cancel()) {
        warn!(error = %err, "could not install Ctrl-C handler");
    }

    let session = Session {
        data_dir,
        cancel,
    };
    match run_command(&session, cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if error::is_canceled(&err) => {
            println!("Canceled.");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

struct Session {
    data_dir: PathBuf,
    cancel: CancelToken,
}

impl Session {
    fn config(&self) -> Result<AppConfig> {
        AppConfig::load_or_create_in(&self.data_dir)
    }

    fn layout(&self) -> Result<GameLayout> {
        let root = self.config()?.resolved_game_root()?;
        Ok(GameLayout::resolve(&root))
    }
}

fn run_command(session: &Session, command: Command) -> Result<()> {
    match command {
        Command::List { json } => list_mods(session, json),
        Command::Enable { name } => change_state(session, &name, Some(true)),
        Command::Disable { name } => change_state(session, &name, Some(false)),
        Command::Toggle { name } => change_state(session, &name, None),
        Command::Delete { name, yes } => delete_mod(session, &name, yes),
        Command::Install { paths } => install_paths(session, &paths),
        Command::InstallUrl { url } => install_url(session, &url),
        Command::Pack(command) => run_pack(session, command),
        Command::Update(command) => run_update(session, command),
        Command::Paths { json } => list_paths(session, json),
        Command::Config(command) => run_config(session, command),
    }
}

#[derive(Serialize)]
struct ModListItem<'a> {
    name: &'a str,
    internal_name: &'a str,
    kind: &'static str,
    enabled: bool,
    author: &'a str,
    version: &'a str,
    category: &'a str,
    description: &'a str,
    path: PathBuf,
}

fn list_mods(session: &Session, json: bool) -> Result<()> {
    let layout = session.layout()?;
    let records = library::scan(&layout)?;
    let items: Vec<ModListItem> = records
        .iter()
        .map(|record| ModListItem {
            name: &record.display_name,
            internal_name: &record.internal_name,
            kind: record.kind.label(),
            enabled: record.is_enabled,
            author: &record.metadata.author,
            version: &record.metadata.version,
            category: &record.metadata.category,
            description: &record.metadata.description,
            path: record.source_path(),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }
    if items.is_empty() {
        println!("No mods installed.");
        return Ok(());
    }
    for item in items {
        let enabled = if item.enabled { "x" } else { " " };
        println!(
            "[{enabled}] {kind:<6} {name} ({version}, {author})",
            kind = item.kind,
            name = item.name,
            version = item.version,
            author = item.author
        );
    }
    Ok(())
}

fn find_record(layout: &GameLayout, name: &str) -> Result<ModRecord> {
    let records = library::scan(layout)?;
    library::find(&records, name)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Unknown mod: {name}"))
}

fn change_state(session: &Session, name: &str, enabled: Option<bool>) -> Result<()> {
    let layout = session.layout()?;
    let record = find_record(&layout, name)?;
    let updated = match enabled {
        Some(enabled) => library::set_enabled(&record, enabled)?,
        None => library::toggle(&record)?,
    };
    let state = if updated.is_enabled { "enabled" } else { "disabled" };
    println!("{} is now {state}.", updated.display_name);
    Ok(())
}

fn delete_mod(session: &Session, name: &str, yes: bool) -> Result<()> {
    let config = session.config()?;
    let layout = GameLayout::resolve(&config.resolved_game_root()?);
    let record = find_record(&layout, name)?;
    if config.confirm_mod_delete && !yes && !confirm(&format!("Delete {}?", record.display_name))? {
        println!("Kept {}.", record.display_name);
        return Ok(());
    }
    library::delete(&record)?;
    println!("Deleted {}.", record.display_name);
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    io::stdout().flush().context("flush prompt")?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("read answer")?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes" | "Yes"))
}

fn print_report(source: &str, report: &InstallReport) {
    if report.is_empty() {
        println!("No mods installed from {source}");
        return;
    }
    println!("Installed {} mod(s) from {source}", report.len());
    for InstalledMod { name, kind, path } in &report.installed {
        println!("  {:<6} {name} -> {}", kind.label(), path.display());
    }
}

fn install_paths(session: &Session, paths: &[PathBuf]) -> Result<()> {
    let mut layout = session.layout()?;
    for path in paths {
        let report = crate::importer::install_path(path, &mut layout, &session.data_dir)
            .with_context(|| format!("install {}", path.display()))?;
        print_report(&path.display().to_string(), &report);
    }
    Ok(())
}

fn progress_printer() -> ProgressCallback {
    let last = Arc::new(Mutex::new(None::<u8>));
    Arc::new(move |update: DownloadProgress| {
        let Ok(mut last) = last.lock() else {
            return;
        };
        if *last == Some(update.percent) {
            return;
        }
        *last = Some(update.percent);
        eprintln!("[{:>3}%] {}", update.percent, update.status);
    })
}

fn install_url(session: &Session, url: &str) -> Result<()> {
    let mut layout = session.layout()?;
    let progress = progress_printer();
    let report = download::install_from_url(
        url,
        &mut layout,
        &session.data_dir,
        Some(&progress),
        &session.cancel,
    )?;
    print_report(url, &report);
    Ok(())
}

fn run_pack(session: &Session, command: PackCommand) -> Result<()> {
    match command {
        PackCommand::Create(args) => create_pack(session, args),
        PackCommand::Inspect { archive } => {
            let loaded = modpack::load(&archive, &session.data_dir)?;
            let manifest = &loaded.manifest;
            println!("{} {} by {}", manifest.name, manifest.version, manifest.author);
            if !manifest.description.is_empty() {
                println!("{}", manifest.description);
            }
            if let Some(created) = manifest.created_at() {
                println!("Created {}", created.date());
            }
            if loaded.thumbnail.is_some() {
                println!("Has thumbnail");
            }
            for entry in &manifest.mods {
                println!(
                    "  {:<9} {} ({}, {})",
                    entry.kind.label(),
                    entry.name,
                    entry.version,
                    entry.author
                );
            }
            loaded.cleanup()
        }
        PackCommand::Install { archive } => {
            let mut layout = session.layout()?;
            let loaded = modpack::load(&archive, &session.data_dir)?;
            let result = modpack::install(&loaded, &mut layout, &session.data_dir);
            if let Err(err) = loaded.cleanup() {
                warn!(error = %err, "could not clean up mod pack scratch dir");
            }
            print_report(&archive.display().to_string(), &result?);
            Ok(())
        }
    }
}

fn create_pack(session: &Session, args: PackCreateArgs) -> Result<()> {
    let records = session
        .layout()
        .and_then(|layout| library::scan(&layout))
        .unwrap_or_else(|err| {
            debug!(error = %err, "no installed mods to resolve names against");
            Vec::new()
        });

    let mut builder = ModPackBuilder::new(&args.name, &args.author, &args.pack_version, &args.description);
    if let Some(thumbnail) = &args.thumbnail {
        builder = builder.thumbnail(thumbnail);
    }
    for query in &args.mods {
        let entry = match library::find(&records, query) {
            Some(record) => builder.add_record(record)?,
            None if Path::new(query).exists() => builder.add_path(Path::new(query))?,
            None => bail!("Unknown mod: {query}"),
        };
        debug!(name = %entry.name, "queued for pack");
    }

    let output = if args.output.extension().is_none() {
        args.output.with_extension(modpack::PACK_EXTENSION)
    } else {
        args.output.clone()
    };
    let written = builder.save(&output, &session.data_dir)?;
    println!(
        "Wrote {} with {} mod(s).",
        written.display(),
        builder.entries().count()
    );
    Ok(())
}

fn feed_url(session: &Session, feed: Option<String>) -> Result<String> {
    feed.or(session.config()?.update_feed_url)
        .context("no update feed configured; run `rigsmith config set-feed <url>`")
}

fn run_update(session: &Session, command: UpdateCommand) -> Result<()> {
    match command {
        UpdateCommand::Check { feed } => {
            let feed = feed_url(session, feed)?;
            match update::check_for_updates(&feed, update::CURRENT_VERSION)? {
                UpdateCheck::UpToDate => println!("RigSmith v{} is up to date.", update::CURRENT_VERSION),
                UpdateCheck::Available(info) => {
                    let critical = if info.is_critical_update { " (critical)" } else { "" };
                    println!("Update available: {}{critical}", info.version);
                    for line in &info.whats_new {
                        println!("  - {line}");
                    }
                }
            }
            Ok(())
        }
        UpdateCommand::Download { feed } => {
            let feed = feed_url(session, feed)?;
            let UpdateCheck::Available(info) = update::check_for_updates(&feed, update::CURRENT_VERSION)? else {
                println!("RigSmith v{} is up to date.", update::CURRENT_VERSION);
                return Ok(());
            };
            let dir = update::update_cache_dir()?;
            let progress = progress_printer();
            let path = update::download_update(&info, &dir, Some(&progress), &session.cancel)?;
            println!("Downloaded {} to {}", info.version, path.display());
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct PathsOutput {
    game_root: Option<PathBuf>,
    mods_dir: Option<PathBuf>,
    pak_dirs: Vec<PathBuf>,
    data_dir: PathBuf,
    log_file: PathBuf,
    error: Option<String>,
}

fn list_paths(session: &Session, json: bool) -> Result<()> {
    let mut output = PathsOutput {
        game_root: None,
        mods_dir: None,
        pak_dirs: Vec::new(),
        data_dir: session.data_dir.clone(),
        log_file: session.data_dir.join(logging::LOG_FILE_NAME),
        error: None,
    };
    match session.layout() {
        Ok(layout) => {
            output.game_root = Some(layout.game_root.clone());
            output.mods_dir = layout.mods_dir.clone();
            output.pak_dirs = layout.pak_roots.clone();
        }
        Err(err) => output.error = Some(format!("{err:#}")),
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }
    let show = |path: &Option<PathBuf>| {
        path.as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "-".to_string())
    };
    println!("Game root: {}", show(&output.game_root));
    println!("Mods dir:  {}", show(&output.mods_dir));
    for dir in &output.pak_dirs {
        println!("Pak dir:   {}", dir.display());
    }
    println!("Data dir:  {}", output.data_dir.display());
    println!("Log file:  {}", output.log_file.display());
    if let Some(error) = &output.error {
        println!("Error:     {error}");
    }
    Ok(())
}

fn run_config(session: &Session, command: ConfigCommand) -> Result<()> {
    let mut config = session.config()?;
    match command {
        ConfigCommand::Show => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            return Ok(());
        }
        ConfigCommand::SetGame { path } => {
            if !path.is_dir() {
                return Err(error::ModError::GameRootNotFound(path).into());
            }
            if !crate::game::looks_like_game_root(&path) {
                warn!(path = %path.display(), "directory does not look like a Brick Rigs install");
            }
            println!("Game directory set to {}", path.display());
            config.game_root = Some(path);
        }
        ConfigCommand::SetFeed { url } => {
            println!("Update feed set to {url}");
            config.update_feed_url = Some(url);
        }
    }
    config.save_in(&session.data_dir)
}
