//! savestate-inspect: offline views of snapshots and live memory layouts.

use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use ss_common::{Error, OutputFormat, Result, SNAPSHOT_FORMAT_VERSION};
use ss_config::{resolve_settings, validate_settings, SavestateSettings};
use ss_core::codec::CodecError;
use ss_core::logging::init_logging;
use ss_core::page::PageCounts;
use ss_core::{Area, ProcMaps, SavedState, SkipPolicy};

#[derive(Parser, Debug)]
#[command(name = "savestate-inspect", author, version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to SAVESTATE_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the threads, areas and page tags of a stored snapshot
    Inspect {
        /// Snapshot path stem; `.pm` and `.p` are appended
        stem: PathBuf,
    },
    /// Parse a process's memory map the way a save would see it
    Maps {
        /// Process to read (defaults to this one)
        #[arg(long)]
        pid: Option<u32>,
    },
    /// Show the resolved engine settings and any validation findings
    Settings,
}

#[derive(Debug, Serialize)]
struct ThreadReport {
    handle: u64,
    tid: u32,
    state: String,
}

#[derive(Debug, Serialize)]
struct AreaReport {
    start: String,
    end: String,
    prot: String,
    flags: String,
    name: String,
    skip: bool,
    uncommitted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pages: Option<PageCounts>,
}

impl AreaReport {
    fn new(area: &Area, pages: Option<PageCounts>) -> Self {
        AreaReport {
            start: format!("{:#x}", area.start),
            end: format!("{:#x}", area.end),
            prot: String::from_utf8_lossy(&area.prot.as_rwx()).into_owned(),
            flags: format!("{:?}", area.flags),
            name: area.name.to_string(),
            skip: area.skip,
            uncommitted: area.uncommitted,
            pages,
        }
    }
}

#[derive(Debug, Serialize)]
struct SnapshotReport {
    threads: Vec<ThreadReport>,
    areas: Vec<AreaReport>,
    totals: PageCounts,
}

fn with_suffix(stem: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(stem.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn format_error(e: CodecError) -> Error {
    match e {
        CodecError::Version(found) => Error::IncompatibleFormat {
            found,
            expected: SNAPSHOT_FORMAT_VERSION,
        },
        CodecError::Io(e) => Error::Io(e),
        other => Error::Format(other.to_string()),
    }
}

fn report_error(format: OutputFormat, e: &Error) {
    if format.is_machine_readable() {
        println!("{}", serde_json::json!({ "error": e.to_string(), "code": e.code() }));
    } else {
        eprintln!("savestate-inspect: {e}");
    }
}

fn inspect(stem: &Path) -> Result<SnapshotReport> {
    let tags = File::open(with_suffix(stem, ".pm"))?;
    let content = File::open(with_suffix(stem, ".p"))?;
    let (header, mut state) = SavedState::open(&tags, &content, None).map_err(format_error)?;

    let threads = header
        .threads()
        .iter()
        .map(|t| ThreadReport {
            handle: t.handle.0,
            tid: t.tid.0,
            state: format!("{:?}", t.state),
        })
        .collect();

    let mut areas = Vec::new();
    let mut totals = PageCounts::default();
    loop {
        let area = *state.area();
        if area.is_sentinel() {
            break;
        }
        let pages = if area.has_pages() {
            let mut counts = PageCounts::default();
            for _ in 0..area.page_count() {
                counts.record(state.next_page_tag().map_err(format_error)?);
            }
            totals.merge(&counts);
            Some(counts)
        } else {
            None
        };
        areas.push(AreaReport::new(&area, pages));
        state.next_area().map_err(format_error)?;
    }
    Ok(SnapshotReport { threads, areas, totals })
}

fn live_maps(pid: Option<u32>) -> Result<Vec<AreaReport>> {
    let path = match pid {
        Some(pid) => format!("/proc/{pid}/maps"),
        None => "/proc/self/maps".to_string(),
    };
    let text = std::fs::read(&path)?;
    ProcMaps::new(&text, SkipPolicy::default())
        .map(|area| {
            area.map(|area| AreaReport::new(&area, None))
                .map_err(|e| Error::Format(format!("{path}: {e}")))
        })
        .collect()
}

fn print_areas(areas: &[AreaReport]) {
    for area in areas {
        let mut line = format!("{:>18}-{:<18} {} {:<28}", area.start, area.end, area.prot, area.flags);
        if area.skip {
            line.push_str(" skip");
        }
        if area.uncommitted {
            line.push_str(" uncommitted");
        }
        if let Some(pages) = &area.pages {
            line.push_str(&format!(
                " full={} zero={} none={} base={} compressed={}",
                pages.full_page, pages.zero_page, pages.no_page, pages.base_page, pages.compressed_page
            ));
        }
        if !area.name.is_empty() {
            line.push(' ');
            line.push_str(&area.name);
        }
        println!("{line}");
    }
}

fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(cli: &Cli, settings: &SavestateSettings) -> Result<()> {
    match &cli.command {
        Command::Inspect { stem } => {
            let report = inspect(stem)?;
            if cli.format.is_machine_readable() {
                return emit_json(&report);
            }
            println!("threads: {}", report.threads.len());
            for thread in &report.threads {
                println!("  handle={:#x} tid={} state={}", thread.handle, thread.tid, thread.state);
            }
            println!("areas: {}", report.areas.len());
            print_areas(&report.areas);
            println!(
                "pages: total={} full={} zero={} none={} base={} compressed={}",
                report.totals.total(),
                report.totals.full_page,
                report.totals.zero_page,
                report.totals.no_page,
                report.totals.base_page,
                report.totals.compressed_page
            );
            Ok(())
        }
        Command::Maps { pid } => {
            let areas = live_maps(*pid)?;
            if cli.format.is_machine_readable() {
                return emit_json(&areas);
            }
            print_areas(&areas);
            Ok(())
        }
        Command::Settings => {
            let validation = validate_settings(settings);
            if cli.format.is_machine_readable() {
                return emit_json(&serde_json::json!({
                    "settings": settings,
                    "savestate_dir": settings.savestate_dir(),
                    "warnings": validation.warnings,
                }));
            }
            println!("incremental:      {}", settings.incremental);
            println!("in_ram:           {}", settings.in_ram);
            println!("compressed:       {}", settings.compressed);
            println!("fork_to_save:     {}", settings.fork_to_save);
            println!("present_tracking: {}", settings.present_tracking);
            println!("strictness:       {:?}", settings.strictness);
            println!("slot_count:       {}", settings.slot_count);
            println!("savestate_dir:    {}", settings.savestate_dir().display());
            for warning in &validation.warnings {
                println!("warning: {warning}");
            }
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = match resolve_settings(cli.config.as_deref()) {
        Ok(resolved) => resolved.settings,
        Err(e) => {
            report_error(cli.format, &Error::from(e));
            return ExitCode::from(2);
        }
    };
    if let Err(e) = init_logging(&settings.log) {
        eprintln!("savestate-inspect: {e}");
    }

    match run(&cli, &settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(cli.format, &e);
            ExitCode::FAILURE
        }
    }
}
