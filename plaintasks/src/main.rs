use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime};
use clap::{Args, Parser, Subcommand};
use plaintasks::dates::{expand_short_date, format_timestamp};
use plaintasks::engine::{DueEntry, DueStatus};
use plaintasks::grammar::{Tag, scan_tags};
use plaintasks::model::Notice;
use plaintasks::{Action, Cursor, Document, Engine, LineKind, Report, Settings};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "plaintasks",
    about = "Edit plain-text to-do outlines from the command line",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Settings file (TOML). Defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Reference time (`YYYY-MM-DD HH:MM`, `YYYY-MM-DDTHH:MM:SS` or `YYYY-MM-DD`).
    #[arg(long, global = true, value_parser = parse_now)]
    now: Option<NaiveDateTime>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Complete tasks or headers, or reopen completed ones.
    Complete(ToggleArgs),

    /// Cancel tasks or headers, or reopen cancelled ones.
    Cancel(ToggleArgs),

    /// Start (or toggle) the timer of open tasks.
    Start(LinesArgs),

    /// Open a new task at a line.
    New(NewArgs),

    /// Recompute `@total` of one header, or of every header.
    Total(TotalArgs),

    /// Move finished tasks into the archive section.
    Archive(OutputArgs),

    /// Expand short date expressions inside date tags.
    Expand(ExpandArgs),

    /// List `@due` dates of open tasks.
    Due(ReadArgs),

    /// Print the project path of a line.
    Project(ProjectArgs),

    /// Print the kind and tags of every line.
    Parse(ReadArgs),

    /// Resolve a short date expression.
    Date(DateArgs),
}

#[derive(Debug, Args)]
struct OutputArgs {
    /// Outline file.
    input: PathBuf,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct ReadArgs {
    /// Outline file.
    input: PathBuf,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ToggleArgs {
    #[command(flatten)]
    output: OutputArgs,
    /// 1-based line to act on; repeatable.
    #[arg(long = "line", required = true, value_parser = line_number)]
    lines: Vec<usize>,
    /// Print the report as JSON (zero-based line indices) instead of the document.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct LinesArgs {
    #[command(flatten)]
    output: OutputArgs,
    /// 1-based line to act on; repeatable.
    #[arg(long = "line", required = true, value_parser = line_number)]
    lines: Vec<usize>,
}

#[derive(Debug, Args)]
struct NewArgs {
    #[command(flatten)]
    output: OutputArgs,
    /// 1-based line holding the cursor.
    #[arg(long, value_parser = line_number)]
    line: usize,
}

#[derive(Debug, Args)]
struct TotalArgs {
    #[command(flatten)]
    output: OutputArgs,
    /// 1-based header line; every header when omitted.
    #[arg(long, value_parser = line_number)]
    line: Option<usize>,
}

#[derive(Debug, Args)]
struct ExpandArgs {
    #[command(flatten)]
    output: OutputArgs,
    /// 1-based line to expand; every line when omitted.
    #[arg(long = "line", value_parser = line_number)]
    lines: Vec<usize>,
    /// Print the report as JSON (zero-based line indices) instead of the document.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ProjectArgs {
    /// Outline file.
    input: PathBuf,
    /// 1-based line.
    #[arg(long, value_parser = line_number)]
    line: usize,
}

#[derive(Debug, Args)]
struct DateArgs {
    /// Expression such as `+3d`, `1-1`, `23:` or `++2w`.
    expression: String,
    /// Line the expression sits on; `++` reads its `@created(...)`.
    #[arg(long)]
    context: Option<String>,
    /// Emit JSON instead of the formatted stamp.
    #[arg(long)]
    json: bool,
}

/// Settings and reference time shared by every command of one invocation.
struct Session {
    settings: Settings,
    now: NaiveDateTime,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let session = Session {
        settings: load_settings(cli.config.as_deref())?,
        now: cli.now.unwrap_or_else(|| Local::now().naive_local()),
    };
    match cli.command {
        Commands::Complete(args) => handle_toggle(args, Action::Complete, &session),
        Commands::Cancel(args) => handle_toggle(args, Action::Cancel, &session),
        Commands::Start(args) => handle_start(args, &session),
        Commands::New(args) => handle_new(args, &session),
        Commands::Total(args) => handle_total(args, &session),
        Commands::Archive(args) => handle_archive(args, &session),
        Commands::Expand(args) => handle_expand(args, &session),
        Commands::Due(args) => handle_due(args, &session),
        Commands::Project(args) => handle_project(args, &session),
        Commands::Parse(args) => handle_parse(args, &session),
        Commands::Date(args) => handle_date(args, &session),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => {
            tracing::debug!(?path, "loading settings");
            Settings::load(path)
        }
        None => Ok(Settings::default()),
    }
}

fn parse_now(value: &str) -> Result<NaiveDateTime, String> {
    const FORMATS: &[&str] = &["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"];
    FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| format!("unrecognized time {value:?}"))
}

/// 1-based on the command line, zero-based inside.
fn line_number(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) | Err(_) => Err(format!("expected a line number starting at 1, got {value:?}")),
        Ok(n) => Ok(n - 1),
    }
}

fn read_document(path: &Path) -> Result<Document> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    Ok(Document::parse(&text))
}

fn emit_document(doc: &Document, output: &OutputArgs) -> Result<()> {
    let text = doc.render();
    if output.in_place {
        fs::write(&output.input, text.as_bytes())
            .with_context(|| format!("writing {:?}", output.input))?;
    } else {
        print!("{text}");
    }
    Ok(())
}

fn print_report(report: &Report) {
    for entry in &report.notices {
        eprintln!("line {}: {}", entry.line + 1, entry.notice);
    }
    for entry in &report.errors {
        eprintln!("line {}: error: {}", entry.line + 1, entry.error);
    }
}

/// Report on stderr, document on stdout (or back to the file); `--json` swaps the
/// document for the report.
fn finish(doc: &Document, report: &Report, output: &OutputArgs, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        if output.in_place {
            emit_document(doc, output)?;
        }
        return Ok(());
    }
    print_report(report);
    emit_document(doc, output)
}

fn handle_toggle(args: ToggleArgs, action: Action, session: &Session) -> Result<()> {
    let ToggleArgs {
        output,
        lines,
        json,
    } = args;
    let mut doc = read_document(&output.input)?;
    let engine = Engine::outline(&session.settings);
    let mut cursors: Vec<Cursor> = lines
        .iter()
        .map(|&line| Cursor { line, column: 0 })
        .collect();
    let report = engine.toggle(&mut doc, &mut cursors, action, session.now);
    tracing::debug!(changed = report.changed.len(), ?action, "toggled");
    finish(&doc, &report, &output, json)
}

fn handle_start(args: LinesArgs, session: &Session) -> Result<()> {
    let LinesArgs { output, lines } = args;
    let mut doc = read_document(&output.input)?;
    let engine = Engine::outline(&session.settings);
    let report = engine.start_timer(&mut doc, &lines, session.now);
    if report.changed.len() < lines.len() {
        eprintln!("warning: timers only start on open tasks");
    }
    emit_document(&doc, &output)
}

fn handle_new(args: NewArgs, session: &Session) -> Result<()> {
    let NewArgs { output, line } = args;
    let mut doc = read_document(&output.input)?;
    let engine = Engine::outline(&session.settings);
    let cursor = engine.new_task(&mut doc, Cursor { line, column: 0 });
    tracing::debug!(line = cursor.line + 1, column = cursor.column, "new task");
    emit_document(&doc, &output)
}

fn handle_total(args: TotalArgs, session: &Session) -> Result<()> {
    let TotalArgs { output, line } = args;
    let mut doc = read_document(&output.input)?;
    let engine = Engine::outline(&session.settings);
    refresh_totals(&engine, &mut doc, line)?;
    emit_document(&doc, &output)
}

/// Innermost headers first, so an outer total reads fresh inner ones.
fn refresh_totals<C: plaintasks::Classifier>(
    engine: &Engine<'_, C>,
    doc: &mut Document,
    line: Option<usize>,
) -> Result<()> {
    let kinds = engine.kinds(doc);
    let headers: Vec<usize> = match line {
        Some(line) => {
            if kinds.get(line) != Some(&LineKind::Header) {
                anyhow::bail!("line {} is not a header", line + 1);
            }
            vec![line]
        }
        None => kinds
            .iter()
            .enumerate()
            .filter(|(_, kind)| **kind == LineKind::Header)
            .map(|(idx, _)| idx)
            .rev()
            .collect(),
    };
    for header in headers {
        engine.refresh_total(doc, header);
    }
    Ok(())
}

fn handle_archive(args: OutputArgs, session: &Session) -> Result<()> {
    let mut doc = read_document(&args.input)?;
    let engine = Engine::outline(&session.settings);
    let report = engine.archive(&mut doc);
    if report.changed.is_empty() {
        eprintln!("Nothing to archive.");
    }
    emit_document(&doc, &args)
}

fn handle_expand(args: ExpandArgs, session: &Session) -> Result<()> {
    let ExpandArgs {
        output,
        lines,
        json,
    } = args;
    let mut doc = read_document(&output.input)?;
    let engine = Engine::outline(&session.settings);
    let selection = (!lines.is_empty()).then_some(lines.as_slice());
    let report = engine.expand_short_dates(&mut doc, selection, session.now);
    finish(&doc, &report, &output, json)
}

fn due_label(status: DueStatus) -> &'static str {
    match status {
        DueStatus::Overdue => "OVERDUE",
        DueStatus::DueSoon => "SOON",
        DueStatus::Upcoming => "DUE",
        DueStatus::Misformatted => "INVALID",
    }
}

fn handle_due(args: ReadArgs, session: &Session) -> Result<()> {
    let ReadArgs { input, json } = args;
    let doc = read_document(&input)?;
    let engine = Engine::outline(&session.settings);
    let mut entries = engine.due_report(&doc, session.now);
    entries.sort_by_key(|entry| (entry.due.is_none(), entry.due, entry.line));

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        eprintln!("No due dates found.");
        return Ok(());
    }
    for DueEntry {
        line,
        status,
        due,
        text,
    } in entries
    {
        let when = due.map_or_else(|| "?".to_string(), |due| due.format("%Y-%m-%d %H:%M").to_string());
        println!("{:>5} {:<8} {:<16} {}", line + 1, due_label(status), when, text);
    }
    Ok(())
}

fn handle_project(args: ProjectArgs, session: &Session) -> Result<()> {
    let ProjectArgs { input, line } = args;
    let doc = read_document(&input)?;
    if line >= doc.len() {
        anyhow::bail!("{:?} has only {} lines", input, doc.len());
    }
    let engine = Engine::outline(&session.settings);
    println!("{}", engine.project_path(&doc, line));
    Ok(())
}

#[derive(Serialize)]
struct LineView<'a> {
    line: usize,
    kind: LineKind,
    tags: Vec<Tag<'a>>,
}

fn handle_parse(args: ReadArgs, session: &Session) -> Result<()> {
    let ReadArgs { input, json } = args;
    let doc = read_document(&input)?;
    let engine = Engine::outline(&session.settings);
    let kinds = engine.kinds(&doc);

    if json {
        let payload: Vec<LineView<'_>> = doc
            .lines()
            .zip(kinds)
            .enumerate()
            .map(|(idx, (text, kind))| LineView {
                line: idx + 1,
                kind,
                tags: scan_tags(text),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (text, kind)) in doc.lines().zip(kinds).enumerate() {
            let kind = serde_json::to_value(kind)?;
            println!("{:>5} {:<10} {}", idx + 1, kind.as_str().unwrap_or("?"), text.trim());
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct DateView {
    date: NaiveDateTime,
    stamp: String,
    notice: Option<Notice>,
}

fn handle_date(args: DateArgs, session: &Session) -> Result<()> {
    let DateArgs {
        expression,
        context,
        json,
    } = args;
    let settings = &session.settings;
    let expansion = expand_short_date(
        &expression,
        session.now,
        context.as_deref().unwrap_or(""),
        &settings.date_format,
        &settings.locale,
    )
    .with_context(|| format!("resolving {expression:?}"))?;
    let view = DateView {
        date: expansion.date,
        stamp: format_timestamp(expansion.date, &settings.date_format, &settings.locale),
        notice: expansion.notice,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        if let Some(notice) = &view.notice {
            eprintln!("note: {notice}");
        }
        println!("{}", view.stamp);
    }
    Ok(())
}
