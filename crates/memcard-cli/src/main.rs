use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use argh::FromArgs;
use colored::Colorize;
use log::{Level, LevelFilter, Log, Metadata, Record};

use memcard::{
    format_image, CheckReport, Config, DirectoryEntry, EntryKind, Error, FormatOptions, ImageCard,
    Session, CONFIG_FILE_NAME,
};

#[derive(FromArgs)]
/// Read and modify PS2 memory card images.
struct Args {
    /// card image to operate on
    #[argh(option, short = 'i')]
    image: PathBuf,

    /// configuration file (defaults to memcard.toml in the current directory)
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// log every card operation
    #[argh(switch, short = 'v')]
    verbose: bool,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    List(ListArgs),
    Extract(ExtractArgs),
    Inject(InjectArgs),
    Mkdir(MkdirArgs),
    Remove(RemoveArgs),
    Rmdir(RmdirArgs),
    Info(InfoArgs),
    Check(CheckArgs),
    Format(FormatArgs),
    Dump(DumpArgs),
}

#[derive(FromArgs)]
/// List a directory.
#[argh(subcommand, name = "list")]
struct ListArgs {
    #[argh(positional, default = "String::from(\"/\")")]
    path: String,
}

#[derive(FromArgs)]
/// Copy a card file to the host.
#[argh(subcommand, name = "extract")]
struct ExtractArgs {
    #[argh(positional)]
    card_path: String,
    #[argh(positional)]
    local_path: PathBuf,
}

#[derive(FromArgs)]
/// Copy a host file onto the card, replacing any file at that path.
#[argh(subcommand, name = "inject")]
struct InjectArgs {
    #[argh(positional)]
    local_path: PathBuf,
    #[argh(positional)]
    card_path: String,
}

#[derive(FromArgs)]
/// Create an empty directory.
#[argh(subcommand, name = "mkdir")]
struct MkdirArgs {
    #[argh(positional)]
    path: String,
}

#[derive(FromArgs)]
/// Delete a file.
#[argh(subcommand, name = "remove")]
struct RemoveArgs {
    #[argh(positional)]
    path: String,
}

#[derive(FromArgs)]
/// Delete an empty directory.
#[argh(subcommand, name = "rmdir")]
struct RmdirArgs {
    #[argh(positional)]
    path: String,
}

#[derive(FromArgs)]
/// Show the card geometry and free space.
#[argh(subcommand, name = "info")]
struct InfoArgs {}

#[derive(FromArgs)]
/// Walk the whole card looking for inconsistencies.
#[argh(subcommand, name = "check")]
struct CheckArgs {}

#[derive(FromArgs)]
/// Write a freshly formatted 8 MB image.
#[argh(subcommand, name = "format")]
struct FormatArgs {
    /// replace an existing image
    #[argh(switch)]
    force: bool,
}

#[derive(FromArgs)]
/// Write every raw page, spare area included, to a file.
#[argh(subcommand, name = "dump")]
struct DumpArgs {
    #[argh(positional)]
    output: PathBuf,
}

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = format!("[{}]", record.level());
        let level = match record.level() {
            Level::Error => level.red().bold(),
            Level::Warn => level.yellow(),
            Level::Info => level.blue(),
            Level::Debug => level.cyan(),
            Level::Trace => level.magenta(),
        };
        eprintln!("{level} {}", record.args());
    }

    fn flush(&self) {}
}

fn init_logging(verbose: bool, config: &Config) -> memcard::Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        config.log.level_filter()?
    };
    log::set_logger(&LOGGER)
        .map_err(|err| Error::Config(format!("cannot install the logger: {err}")))?;
    log::set_max_level(level);
    Ok(())
}

fn load_config(path: Option<&Path>) -> memcard::Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(Path::new(CONFIG_FILE_NAME)),
    }
}

/// The image is served by a virtual reader holding the configured keys, so
/// writes go through the same handshake as a physical card.
fn open_card(image: &Path, config: &Config) -> memcard::Result<Session<ImageCard>> {
    let mut card = ImageCard::open(image)?.require_auth(true);
    if let Ok(keys) = config.auth.keys() {
        card = card.with_keys(keys);
    }
    Session::open(card, config)
}

fn kind_label(entry: &DirectoryEntry) -> &'static str {
    match entry.kind() {
        EntryKind::Directory => "dir",
        EntryKind::File => "file",
        _ => "?",
    }
}

fn print_listing(path: &str, entries: &[DirectoryEntry]) {
    println!("{}", path.bold());
    for entry in entries {
        let modified = entry
            .modified
            .to_datetime()
            .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|_| "-".to_string());
        let display: &str = &entry.display_name();
        let name = if entry.is_dir() {
            display.blue().bold()
        } else {
            display.normal()
        };
        println!(
            "  {:<4} {:>9}  {}  {}",
            kind_label(entry),
            entry.size,
            modified.dimmed(),
            name
        );
    }
}

fn print_report(report: &CheckReport) {
    println!(
        "{} files, {} directories, {} clusters in use",
        report.files, report.directories, report.used_clusters
    );
    if report.is_clean() {
        println!("{}", "No problems found".green());
    }
    for problem in &report.problems {
        println!("{} {problem}", "!".red().bold());
    }
}

fn format_card(image: &Path, force: bool) -> memcard::Result<()> {
    if image.exists() && !force {
        return Err(Error::AlreadyExists(image.display().to_string()));
    }
    let bytes = format_image(&FormatOptions::default())?;
    std::fs::write(image, bytes)?;
    println!("{} {}", "Formatted".green(), image.display());
    Ok(())
}

fn run(args: Args) -> memcard::Result<()> {
    let config = load_config(args.config.as_deref())?;
    init_logging(args.verbose, &config)?;

    if let Command::Format(format) = &args.command {
        return format_card(&args.image, format.force);
    }

    let mut session = open_card(&args.image, &config)?;
    let mutating = matches!(
        args.command,
        Command::Inject(_) | Command::Mkdir(_) | Command::Remove(_) | Command::Rmdir(_)
    );
    if mutating {
        session.authenticate()?;
    }

    match args.command {
        Command::List(list) => {
            let entries = session.list(&list.path)?;
            print_listing(&list.path, &entries);
        }
        Command::Extract(extract) => {
            let bytes = session.extract(&extract.card_path, &extract.local_path)?;
            println!(
                "{} {} -> {} ({bytes} bytes)",
                "Extracted".green(),
                extract.card_path,
                extract.local_path.display()
            );
        }
        Command::Inject(inject) => {
            let bytes = session.inject(&inject.local_path, &inject.card_path)?;
            println!(
                "{} {} -> {} ({bytes} bytes)",
                "Injected".green(),
                inject.local_path.display(),
                inject.card_path
            );
        }
        Command::Mkdir(mkdir) => {
            session.mkdir(&mkdir.path)?;
            println!("{} {}", "Created".green(), mkdir.path);
        }
        Command::Remove(remove) => {
            session.remove(&remove.path)?;
            println!("{} {}", "Removed".green(), remove.path);
        }
        Command::Rmdir(rmdir) => {
            session.rmdir(&rmdir.path)?;
            println!("{} {}", "Removed".green(), rmdir.path);
        }
        Command::Info(_) => {
            let info = session.info()?;
            println!("{}", args.image.display().to_string().bold());
            println!("  version          {}", info.version);
            println!(
                "  geometry         {} B pages, {} pages/cluster, {} pages/block, {} clusters",
                info.page_len, info.pages_per_cluster, info.pages_per_block, info.clusters_per_card
            );
            println!("  flags            {:#04x}", info.card_flags);
            println!(
                "  free             {} of {} clusters ({} KB)",
                info.free_clusters,
                info.allocatable_clusters,
                info.free_bytes() / 1024
            );
            if !info.bad_blocks.is_empty() {
                println!("  bad blocks       {:?}", info.bad_blocks);
            }
            if info.soft_errors > 0 {
                println!(
                    "  {}",
                    format!("corrected ECC errors: {}", info.soft_errors).yellow()
                );
            }
        }
        Command::Check(_) => {
            let report = session.check()?;
            print_report(&report);
        }
        Command::Dump(dump) => {
            let out = BufWriter::new(File::create(&dump.output)?);
            let pages = session.dump(out)?;
            println!(
                "{} {pages} pages to {}",
                "Dumped".green(),
                dump.output.display()
            );
        }
        Command::Format(_) => {}
    }

    if mutating {
        session.device().save(&args.image)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    let args: Args = argh::from_env();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err}", "Error:".red().bold());
            ExitCode::from(err.code().unsigned_abs().min(255) as u8)
        }
    }
}
