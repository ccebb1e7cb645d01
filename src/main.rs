use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{DynamicImage, ImageBuffer, Rgba, RgbaImage};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::fmt;
use std::fs;
use std::io::{self, Read as _};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use wait_timeout::ChildExt;

const ELEMENT_DELIMITER: char = '*';
const SUB_ELEMENT_DELIMITER: char = ':';
const SEGMENT_TERMINATOR: char = '~';
const HIGHLIGHT_THICKNESS: u32 = 3;

const JOBS_HELP: &str = r##"Jobs file format (one job per line):
  <display name><TAB><field code>
  <display name>,<field code>
  <field code>

Lines starting with # and blank lines are skipped. A one-column line reuses the
field code as the display name. Field codes follow the TAG+NN[-SUB] grammar:
BHT03, CLM05-1, SV101-1.

Viewport metrics JSON (accepted by --viewport and expected on stdout from
--viewport-cmd):
{
  "origin_x": 120, "origin_y": 240,
  "cell_width": 8, "cell_height": 16,
  "first_visible_line": 0, "visible_lines": 48,
  "scroll_columns": 0, "padding": 3
}

origin_x/origin_y, first_visible_line and scroll_columns default to 0 when
omitted; padding defaults to 3.
"##;

#[derive(Parser, Debug)]
#[command(
    name = "edi-locate",
    version,
    about = "Locate EDI field codes in flat files and capture highlight-annotated screenshots"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse field codes into structured segment/element references
    Parse(ParseArgs),
    /// Resolve field codes against an EDI file and print text positions
    Locate(LocateArgs),
    /// Draw a highlight rectangle (and label) on an existing screenshot
    Annotate(AnnotateArgs),
    /// Run a batch of field lookups with viewport/capture collaborators
    Batch(BatchArgs),
}

#[derive(Args, Debug)]
struct ParseArgs {
    /// Field codes to parse (e.g. BHT03 CLM05-1 SV101-1)
    #[arg(required = true)]
    codes: Vec<String>,
    /// Print parsed references as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Args, Debug)]
struct LocateArgs {
    /// Path to the EDI file
    file: PathBuf,
    /// Field codes to resolve
    #[arg(required = true)]
    codes: Vec<String>,
    /// Print match results as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Args, Debug)]
struct AnnotateArgs {
    /// Input PNG path
    input: PathBuf,
    /// Output PNG path
    output: PathBuf,
    /// Left edge of the highlight rectangle in image pixels
    #[arg(long, allow_hyphen_values = true)]
    left: i64,
    /// Top edge of the highlight rectangle in image pixels
    #[arg(long, allow_hyphen_values = true)]
    top: i64,
    /// Right edge of the highlight rectangle in image pixels
    #[arg(long, allow_hyphen_values = true)]
    right: i64,
    /// Bottom edge of the highlight rectangle in image pixels
    #[arg(long, allow_hyphen_values = true)]
    bottom: i64,
    /// Label text stamped next to the rectangle
    #[arg(long)]
    label: Option<String>,
    /// Outline thickness in pixels
    #[arg(long, default_value_t = HIGHLIGHT_THICKNESS)]
    thickness: u32,
}

#[derive(Args, Debug)]
struct BatchArgs {
    /// Path to the EDI file
    file: PathBuf,
    /// Jobs file path (or - for stdin)
    #[arg(long)]
    jobs: Option<String>,
    /// Inline job entry NAME=CODE (repeatable)
    #[arg(long = "job", action = ArgAction::Append)]
    job: Vec<String>,
    /// 1-based row range applied to the job list (e.g. 1-10, 5-, -20, 7)
    #[arg(long)]
    rows: Option<String>,
    /// Command that prints current viewport metrics JSON on stdout
    #[arg(long)]
    viewport_cmd: Option<String>,
    /// Static viewport metrics JSON, inline or @path (used without --viewport-cmd)
    #[arg(long)]
    viewport: Option<String>,
    /// Command invoked with a 0-based line number appended to scroll the editor
    #[arg(long)]
    scroll_cmd: Option<String>,
    /// Settle delay after a scroll command completes, in milliseconds
    #[arg(long, default_value_t = 100)]
    scroll_settle_ms: u64,
    /// Command that captures the screen to the PNG path appended as its argument
    #[arg(long)]
    capture_cmd: Option<String>,
    /// Per-request collaborator timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    viewport_timeout_ms: u64,
    /// Scroll-and-retry ceiling per job
    #[arg(long, default_value_t = 3)]
    max_scroll_retries: u32,
    /// Output directory for annotated screenshots (default: EDI_SHOT_DIR or .edi-locate/shots)
    #[arg(long)]
    out_dir: Option<PathBuf>,
    /// Not-found log path (default: <out-dir>/not_found.txt)
    #[arg(long)]
    not_found_log: Option<PathBuf>,
    /// Compute highlight rectangles but skip screenshot capture
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,
    /// Print the batch report JSON to stdout
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
    /// Print the jobs-file and viewport JSON formats and exit
    #[arg(long, action = ArgAction::SetTrue)]
    jobs_help: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct FieldReference {
    segment_tag: String,
    element_index: usize,
    sub_element_index: Option<usize>,
}

impl FieldReference {
    fn search_pattern(&self) -> String {
        format!("{}{}", self.segment_tag, ELEMENT_DELIMITER)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed field code {code:?}: expected TAG (3-4 alphanumerics) + two-digit element + optional -sub")]
struct FieldCodeError {
    code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DocumentLine {
    index: usize,
    text: String,
}

impl DocumentLine {
    fn content(&self) -> &str {
        self.text.trim_end().trim_end_matches(SEGMENT_TERMINATOR)
    }

    fn segment_tag(&self) -> &str {
        self.content().split(ELEMENT_DELIMITER).next().unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
struct TextSpan {
    line_index: usize,
    start_column: usize,
    end_column: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MatchResult {
    Found(TextSpan),
    NotFound {
        reference: FieldReference,
        pattern: String,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
enum LocateError {
    #[error("no line starts with {pattern}")]
    NoMatchingLine { pattern: String },
    #[error("element {element_index} not present on line {line_index}")]
    ElementOutOfRange {
        line_index: usize,
        element_index: usize,
    },
    #[error("sub-element {sub_element_index} not present in element {element_index} on line {line_index}")]
    SubElementOutOfRange {
        line_index: usize,
        element_index: usize,
        sub_element_index: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct ViewportMetrics {
    #[serde(default)]
    origin_x: i64,
    #[serde(default)]
    origin_y: i64,
    cell_width: u32,
    cell_height: u32,
    #[serde(default)]
    first_visible_line: usize,
    visible_lines: usize,
    #[serde(default)]
    scroll_columns: usize,
    #[serde(default = "default_padding")]
    padding: u32,
}

fn default_padding() -> u32 {
    3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
struct HighlightRectangle {
    left: i64,
    top: i64,
    right: i64,
    bottom: i64,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("line {line_index} is outside the visible range starting at {first_visible_line} ({visible_lines} lines shown)")]
struct LineNotVisible {
    line_index: usize,
    first_visible_line: usize,
    visible_lines: usize,
}

#[derive(Debug, Error)]
enum ViewportError {
    #[error("viewport unavailable: {0}")]
    Unavailable(String),
    #[error("editor window lost: {0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
enum BatchError {
    #[error("editor collaborator failed: {0}")]
    Collaborator(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct LookupJob {
    display_name: String,
    field_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum FailureReason {
    MalformedCode,
    NotFound,
    NotVisible { retries: u32 },
    ViewportUnavailable { detail: String },
    CaptureFailed { detail: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedCode => write!(f, "malformed field code"),
            Self::NotFound => write!(f, "segment not found"),
            Self::NotVisible { retries } => {
                write!(f, "line never became visible after {retries} scroll retries")
            }
            Self::ViewportUnavailable { detail } => write!(f, "viewport unavailable: {detail}"),
            Self::CaptureFailed { detail } => write!(f, "screenshot capture failed: {detail}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct BatchOutcome {
    job: LookupJob,
    span: TextSpan,
    rectangle: HighlightRectangle,
    screenshot: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
struct BatchFailure {
    job: LookupJob,
    pattern: Option<String>,
    reason: FailureReason,
}

#[derive(Debug)]
struct BatchResult {
    successes: Vec<BatchOutcome>,
    failures: Vec<BatchFailure>,
    cancelled: bool,
}

impl BatchResult {
    fn not_found_log(&self) -> String {
        let mut out = format!("NOT FOUND ({}):\n", timestamp_iso());
        for failure in &self.failures {
            match &failure.pattern {
                Some(pattern) => {
                    out.push_str(&format!(
                        "{} (searched: {})\n",
                        failure.job.field_code, pattern
                    ));
                }
                None => {
                    out.push_str(&format!(
                        "{} (malformed field code)\n",
                        failure.job.field_code
                    ));
                }
            }
        }
        out
    }
}

trait ViewportProvider {
    fn metrics(&mut self) -> Result<ViewportMetrics, ViewportError>;
    fn scroll_to_line(&mut self, line_index: usize) -> Result<(), ViewportError>;
}

trait HighlightSink {
    fn capture(
        &mut self,
        display_name: &str,
        rect: &HighlightRectangle,
    ) -> Result<Option<PathBuf>>;
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Parse(args) => command_parse(args),
        Commands::Locate(args) => command_locate(args),
        Commands::Annotate(args) => command_annotate(args),
        Commands::Batch(args) => command_batch(args),
    }
}

fn command_parse(args: ParseArgs) -> Result<()> {
    let mut rows = Vec::new();
    let mut bad = 0usize;

    for code in &args.codes {
        match parse_field_code(code) {
            Ok(reference) => {
                if args.json {
                    rows.push(json!({"code": code, "reference": reference}));
                } else {
                    match reference.sub_element_index {
                        Some(sub) => println!(
                            "{code} -> {} element {} sub-element {sub}",
                            reference.segment_tag, reference.element_index
                        ),
                        None => println!(
                            "{code} -> {} element {}",
                            reference.segment_tag, reference.element_index
                        ),
                    }
                }
            }
            Err(err) => {
                bad += 1;
                if args.json {
                    rows.push(json!({"code": code, "error": err.to_string()}));
                } else {
                    eprintln!("{err}");
                }
            }
        }
    }

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "codes": rows }))?
        );
    }
    if bad > 0 {
        bail!("{bad} field code(s) failed to parse");
    }
    Ok(())
}

fn command_locate(args: LocateArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read EDI file: {}", args.file.display()))?;
    let lines = document_lines(&raw);
    let mut rows = Vec::new();

    for code in &args.codes {
        let reference = match parse_field_code(code) {
            Ok(reference) => reference,
            Err(err) => {
                if args.json {
                    rows.push(json!({"code": code, "error": err.to_string()}));
                } else {
                    eprintln!("{err}");
                }
                continue;
            }
        };

        match locate(&reference, &lines) {
            MatchResult::Found(span) => {
                let matched = span_text(&lines, span);
                if args.json {
                    rows.push(json!({
                        "code": code,
                        "found": true,
                        "reference": reference,
                        "line_index": span.line_index,
                        "start_column": span.start_column,
                        "end_column": span.end_column,
                        "text": matched,
                    }));
                } else {
                    println!(
                        "{code}: line {}, columns {}..{}: {matched:?}",
                        span.line_index, span.start_column, span.end_column
                    );
                }
            }
            MatchResult::NotFound { reference, pattern } => {
                if args.json {
                    rows.push(json!({
                        "code": code,
                        "found": false,
                        "reference": reference,
                        "pattern": pattern,
                    }));
                } else {
                    println!("{code}: not found (searched: {pattern})");
                }
            }
        }
    }

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "matches": rows }))?
        );
    }
    Ok(())
}

fn command_annotate(args: AnnotateArgs) -> Result<()> {
    if !args.input.exists() {
        bail!("input not found: {}", args.input.display());
    }
    let rect = HighlightRectangle {
        left: args.left,
        top: args.top,
        right: args.right,
        bottom: args.bottom,
    };
    if rect.right <= rect.left || rect.bottom <= rect.top {
        bail!(
            "empty rectangle: left/top must be less than right/bottom (got {} {} {} {})",
            rect.left,
            rect.top,
            rect.right,
            rect.bottom
        );
    }

    let input = image::open(&args.input)
        .with_context(|| format!("failed to open input image: {}", args.input.display()))?;
    let mut rendered = input.to_rgba8();
    draw_highlight_rect(&mut rendered, &rect, Rgba([255, 0, 0, 255]), args.thickness);
    if let Some(label) = args.label.as_deref() {
        draw_rect_label(&mut rendered, &rect, label);
    }

    ensure_parent_dir(&args.output)?;
    DynamicImage::ImageRgba8(rendered)
        .save(&args.output)
        .with_context(|| format!("failed to save annotated image: {}", args.output.display()))?;
    println!("{}", args.output.display());
    Ok(())
}

fn command_batch(args: BatchArgs) -> Result<()> {
    if args.jobs_help {
        println!("{}", JOBS_HELP.trim());
        return Ok(());
    }

    let raw = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read EDI file: {}", args.file.display()))?;
    let lines = document_lines(&raw);

    let mut jobs = Vec::new();
    if let Some(path) = args.jobs.as_deref() {
        let text = if path == "-" {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read jobs from stdin")?;
            buf
        } else {
            fs::read_to_string(path)
                .with_context(|| format!("failed to read jobs file: {path}"))?
        };
        jobs.extend(parse_jobs_text(&text));
    }
    for raw_job in &args.job {
        jobs.push(parse_inline_job(raw_job)?);
    }
    if jobs.is_empty() {
        bail!("no jobs to run: provide --jobs or --job (see --jobs-help)");
    }
    if let Some(rows) = args.rows.as_deref() {
        let (start, end) = parse_row_range(rows, jobs.len())?;
        jobs = jobs[start..end].to_vec();
    }

    let timeout = Duration::from_millis(args.viewport_timeout_ms);
    let mut command_provider;
    let mut fixed_provider;
    let provider: &mut dyn ViewportProvider =
        match (args.viewport_cmd.as_deref(), args.viewport.as_deref()) {
            (Some(command), _) => {
                command_provider = CommandViewportProvider {
                    metrics_command: command.to_string(),
                    scroll_command: args.scroll_cmd.clone(),
                    settle_ms: args.scroll_settle_ms,
                    timeout,
                };
                &mut command_provider
            }
            (None, Some(spec)) => {
                fixed_provider = FixedViewportProvider {
                    metrics: load_viewport_metrics(spec)?,
                };
                &mut fixed_provider
            }
            (None, None) => bail!("provide --viewport-cmd or --viewport (see --jobs-help)"),
        };

    let out_dir = args.out_dir.clone().unwrap_or_else(shots_root);
    let mut recording_sink = RecordingSink::default();
    let mut screenshot_sink;

    let result = {
        let sink: &mut dyn HighlightSink = if args.dry_run {
            &mut recording_sink
        } else {
            screenshot_sink = ScreenshotSink {
                capture_command: args.capture_cmd.clone(),
                out_dir: out_dir.clone(),
                thickness: HIGHLIGHT_THICKNESS,
                timeout,
            };
            &mut screenshot_sink
        };

        let mut orchestrator = BatchOrchestrator {
            document: &lines,
            viewport: provider,
            sink,
            max_scroll_retries: args.max_scroll_retries,
            cancel: None,
        };
        orchestrator.run(&jobs)?
    };

    let log_path = args
        .not_found_log
        .clone()
        .unwrap_or_else(|| out_dir.join("not_found.txt"));
    if !result.failures.is_empty() {
        ensure_parent_dir(&log_path)?;
        fs::write(&log_path, result.not_found_log())
            .with_context(|| format!("failed to write not-found log: {}", log_path.display()))?;
    }

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "file": abs_path(&args.file).display().to_string(),
                "found": result.successes.len(),
                "not_found": result.failures.len(),
                "cancelled": result.cancelled,
                "successes": result.successes,
                "failures": result.failures,
                "not_found_log": if result.failures.is_empty() {
                    Value::Null
                } else {
                    json!(abs_path(&log_path).display().to_string())
                },
            }))?
        );
    } else {
        for outcome in &result.successes {
            match &outcome.screenshot {
                Some(path) => println!("{}: {}", outcome.job.display_name, path.display()),
                None => println!(
                    "{}: line {} rect [{}, {}, {}, {}]",
                    outcome.job.display_name,
                    outcome.span.line_index,
                    outcome.rectangle.left,
                    outcome.rectangle.top,
                    outcome.rectangle.right,
                    outcome.rectangle.bottom
                ),
            }
        }
        println!("Found: {}", result.successes.len());
        println!("Not found: {}", result.failures.len());
        for failure in &result.failures {
            println!("  {}: {}", failure.job.field_code, failure.reason);
        }
        if !result.failures.is_empty() {
            println!("Not-found log: {}", log_path.display());
        }
        if args.dry_run {
            println!(
                "Dry run: {} capture request(s) skipped",
                recording_sink.requests.len()
            );
        }
        if result.cancelled {
            println!("Cancelled before completion.");
        }
    }
    Ok(())
}

fn parse_field_code(code: &str) -> Result<FieldReference, FieldCodeError> {
    let malformed = || FieldCodeError {
        code: code.to_string(),
    };
    let trimmed = code.trim();
    if trimmed.is_empty() || !trimmed.is_ascii() {
        return Err(malformed());
    }

    let (body, sub_element_index) = match trimmed.split_once('-') {
        Some((body, sub_raw)) => {
            if sub_raw.is_empty() || !sub_raw.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            let sub: usize = sub_raw.parse().map_err(|_| malformed())?;
            if sub == 0 {
                return Err(malformed());
            }
            (body, Some(sub))
        }
        None => (trimmed, None),
    };

    if body.len() < 5 || body.len() > 6 {
        return Err(malformed());
    }
    let (tag_raw, digits) = body.split_at(body.len() - 2);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let element_index: usize = digits.parse().map_err(|_| malformed())?;
    if element_index == 0 {
        return Err(malformed());
    }

    let mut tag_bytes = tag_raw.bytes();
    match tag_bytes.next() {
        Some(b) if b.is_ascii_alphabetic() => {}
        _ => return Err(malformed()),
    }
    if !tag_bytes.all(|b| b.is_ascii_alphanumeric()) {
        return Err(malformed());
    }

    Ok(FieldReference {
        segment_tag: tag_raw.to_ascii_uppercase(),
        element_index,
        sub_element_index,
    })
}

fn document_lines(raw: &str) -> Vec<DocumentLine> {
    raw.lines()
        .enumerate()
        .map(|(index, line)| DocumentLine {
            index,
            text: line.to_string(),
        })
        .collect()
}

fn locate(reference: &FieldReference, lines: &[DocumentLine]) -> MatchResult {
    match locate_span(reference, lines) {
        Ok(span) => MatchResult::Found(span),
        Err(_) => MatchResult::NotFound {
            reference: reference.clone(),
            pattern: reference.search_pattern(),
        },
    }
}

fn locate_span(reference: &FieldReference, lines: &[DocumentLine]) -> Result<TextSpan, LocateError> {
    let line = lines
        .iter()
        .find(|line| line.segment_tag() == reference.segment_tag)
        .ok_or_else(|| LocateError::NoMatchingLine {
            pattern: reference.search_pattern(),
        })?;

    let content = line.content();
    let tokens: Vec<&str> = content.split(ELEMENT_DELIMITER).collect();
    if reference.element_index >= tokens.len() {
        return Err(LocateError::ElementOutOfRange {
            line_index: line.index,
            element_index: reference.element_index,
        });
    }

    // Column of element k = lengths of tokens 0..k plus one delimiter each.
    let mut start = 0usize;
    for token in &tokens[..reference.element_index] {
        start += token.chars().count() + 1;
    }
    let element = tokens[reference.element_index];

    match reference.sub_element_index {
        None => Ok(TextSpan {
            line_index: line.index,
            start_column: start,
            end_column: start + element.chars().count(),
        }),
        Some(sub_element_index) => {
            let parts: Vec<&str> = element.split(SUB_ELEMENT_DELIMITER).collect();
            if sub_element_index > parts.len() {
                return Err(LocateError::SubElementOutOfRange {
                    line_index: line.index,
                    element_index: reference.element_index,
                    sub_element_index,
                });
            }
            for part in &parts[..sub_element_index - 1] {
                start += part.chars().count() + 1;
            }
            let part = parts[sub_element_index - 1];
            Ok(TextSpan {
                line_index: line.index,
                start_column: start,
                end_column: start + part.chars().count(),
            })
        }
    }
}

fn span_text(lines: &[DocumentLine], span: TextSpan) -> String {
    lines
        .get(span.line_index)
        .map(|line| {
            line.text
                .chars()
                .skip(span.start_column)
                .take(span.end_column - span.start_column)
                .collect()
        })
        .unwrap_or_default()
}

fn map_to_screen(
    span: TextSpan,
    viewport: &ViewportMetrics,
) -> Result<HighlightRectangle, LineNotVisible> {
    let visible_end = viewport.first_visible_line + viewport.visible_lines;
    if span.line_index < viewport.first_visible_line || span.line_index >= visible_end {
        return Err(LineNotVisible {
            line_index: span.line_index,
            first_visible_line: viewport.first_visible_line,
            visible_lines: viewport.visible_lines,
        });
    }

    let row = (span.line_index - viewport.first_visible_line) as i64;
    let top = viewport.origin_y + row * i64::from(viewport.cell_height);
    let bottom = top + i64::from(viewport.cell_height);
    let cell_w = i64::from(viewport.cell_width);
    let left =
        viewport.origin_x + (span.start_column as i64 - viewport.scroll_columns as i64) * cell_w;
    let right =
        viewport.origin_x + (span.end_column as i64 - viewport.scroll_columns as i64) * cell_w;

    let pad = i64::from(viewport.padding);
    Ok(HighlightRectangle {
        left: left - pad,
        top: top - pad,
        right: right + pad,
        bottom: bottom + pad,
    })
}

struct BatchOrchestrator<'a> {
    document: &'a [DocumentLine],
    viewport: &'a mut dyn ViewportProvider,
    sink: &'a mut dyn HighlightSink,
    max_scroll_retries: u32,
    cancel: Option<&'a AtomicBool>,
}

impl BatchOrchestrator<'_> {
    fn run(&mut self, jobs: &[LookupJob]) -> Result<BatchResult, BatchError> {
        let mut result = BatchResult {
            successes: Vec::new(),
            failures: Vec::new(),
            cancelled: false,
        };

        for job in jobs {
            if self
                .cancel
                .is_some_and(|flag| flag.load(Ordering::Relaxed))
            {
                result.cancelled = true;
                break;
            }
            match self.run_job(job)? {
                Ok(outcome) => result.successes.push(outcome),
                Err(failure) => result.failures.push(failure),
            }
        }

        Ok(result)
    }

    fn run_job(
        &mut self,
        job: &LookupJob,
    ) -> Result<Result<BatchOutcome, BatchFailure>, BatchError> {
        let fail = |pattern: Option<String>, reason: FailureReason| BatchFailure {
            job: job.clone(),
            pattern,
            reason,
        };

        let reference = match parse_field_code(&job.field_code) {
            Ok(reference) => reference,
            Err(_) => return Ok(Err(fail(None, FailureReason::MalformedCode))),
        };
        let pattern = reference.search_pattern();

        let span = match locate(&reference, self.document) {
            MatchResult::Found(span) => span,
            MatchResult::NotFound { .. } => {
                return Ok(Err(fail(Some(pattern), FailureReason::NotFound)))
            }
        };

        let mut retries = 0u32;
        let rectangle = loop {
            let metrics = match self.viewport.metrics() {
                Ok(metrics) => metrics,
                Err(ViewportError::Unavailable(detail)) => {
                    return Ok(Err(fail(
                        Some(pattern.clone()),
                        FailureReason::ViewportUnavailable { detail },
                    )))
                }
                Err(ViewportError::Fatal(detail)) => {
                    return Err(BatchError::Collaborator(detail))
                }
            };

            match map_to_screen(span, &metrics) {
                Ok(rectangle) => break rectangle,
                Err(_) if retries < self.max_scroll_retries => {
                    retries += 1;
                    match self.viewport.scroll_to_line(span.line_index) {
                        Ok(()) => {}
                        Err(ViewportError::Unavailable(detail)) => {
                            return Ok(Err(fail(
                                Some(pattern.clone()),
                                FailureReason::ViewportUnavailable { detail },
                            )))
                        }
                        Err(ViewportError::Fatal(detail)) => {
                            return Err(BatchError::Collaborator(detail))
                        }
                    }
                }
                Err(_) => {
                    return Ok(Err(fail(
                        Some(pattern.clone()),
                        FailureReason::NotVisible { retries },
                    )))
                }
            }
        };

        match self.sink.capture(&job.display_name, &rectangle) {
            Ok(screenshot) => Ok(Ok(BatchOutcome {
                job: job.clone(),
                span,
                rectangle,
                screenshot,
            })),
            Err(err) => Ok(Err(fail(
                Some(pattern),
                FailureReason::CaptureFailed {
                    detail: format!("{err:#}"),
                },
            ))),
        }
    }
}

struct CommandViewportProvider {
    metrics_command: String,
    scroll_command: Option<String>,
    settle_ms: u64,
    timeout: Duration,
}

impl ViewportProvider for CommandViewportProvider {
    fn metrics(&mut self) -> Result<ViewportMetrics, ViewportError> {
        let raw = run_collaborator_command(&self.metrics_command, self.timeout)?;
        if raw.is_empty() {
            return Err(ViewportError::Unavailable(format!(
                "{:?} printed no metrics",
                self.metrics_command
            )));
        }
        serde_json::from_str(&raw)
            .map_err(|err| ViewportError::Unavailable(format!("bad viewport metrics JSON: {err}")))
    }

    fn scroll_to_line(&mut self, line_index: usize) -> Result<(), ViewportError> {
        let Some(command) = self.scroll_command.as_deref() else {
            return Err(ViewportError::Unavailable(
                "no scroll command configured".to_string(),
            ));
        };
        run_collaborator_command(&format!("{command} {line_index}"), self.timeout)?;
        if self.settle_ms > 0 {
            thread::sleep(Duration::from_millis(self.settle_ms));
        }
        Ok(())
    }
}

struct FixedViewportProvider {
    metrics: ViewportMetrics,
}

impl ViewportProvider for FixedViewportProvider {
    fn metrics(&mut self) -> Result<ViewportMetrics, ViewportError> {
        Ok(self.metrics)
    }

    fn scroll_to_line(&mut self, line_index: usize) -> Result<(), ViewportError> {
        // Recenter on the target, as an editor honoring a scroll request would.
        self.metrics.first_visible_line =
            line_index.saturating_sub(self.metrics.visible_lines / 2);
        Ok(())
    }
}

fn run_collaborator_command(command: &str, timeout: Duration) -> Result<String, ViewportError> {
    let mut cmd = Command::new("bash");
    cmd.arg("-lc").arg(command);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|err| ViewportError::Fatal(format!("failed to spawn {command:?}: {err}")))?;

    match child.wait_timeout(timeout) {
        Ok(Some(_)) => {}
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ViewportError::Unavailable(format!(
                "{command:?} timed out after {}ms",
                timeout.as_millis()
            )));
        }
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ViewportError::Unavailable(format!(
                "{command:?} wait failed: {err}"
            )));
        }
    }

    let output = child
        .wait_with_output()
        .map_err(|err| ViewportError::Unavailable(format!("{command:?} output lost: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let code = output.status.code().unwrap_or(1);
        return Err(ViewportError::Fatal(if stderr.is_empty() {
            format!("{command:?} exited with status {code}")
        } else {
            stderr
        }));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

struct ScreenshotSink {
    capture_command: Option<String>,
    out_dir: PathBuf,
    thickness: u32,
    timeout: Duration,
}

impl HighlightSink for ScreenshotSink {
    fn capture(
        &mut self,
        display_name: &str,
        rect: &HighlightRectangle,
    ) -> Result<Option<PathBuf>> {
        fs::create_dir_all(&self.out_dir).with_context(|| {
            format!("failed to create screenshot dir: {}", self.out_dir.display())
        })?;

        let staging = self.out_dir.join(format!(
            ".capture-{}-{}.png",
            std::process::id(),
            rand::thread_rng().gen_range(1000..9999)
        ));

        let mut fallback_used = false;
        match self.capture_command.as_deref() {
            Some(command) => {
                let line = format!("{command} '{}'", staging.display());
                run_collaborator_command(&line, self.timeout)
                    .map_err(|err| anyhow::anyhow!("capture command failed: {err}"))?;
                if !staging.exists() {
                    bail!("capture command produced no file: {}", staging.display());
                }
            }
            None => {
                let placeholder = DynamicImage::ImageRgba8(ImageBuffer::from_pixel(
                    1280,
                    720,
                    Rgba([255, 255, 255, 255]),
                ));
                placeholder.save(&staging).with_context(|| {
                    format!("failed to write placeholder capture: {}", staging.display())
                })?;
                fallback_used = true;
            }
        }

        let captured = image::open(&staging)
            .with_context(|| format!("failed to read capture: {}", staging.display()))?;
        let mut annotated = captured.to_rgba8();
        draw_highlight_rect(&mut annotated, rect, Rgba([255, 0, 0, 255]), self.thickness);
        draw_rect_label(&mut annotated, rect, display_name);

        let final_path = self
            .out_dir
            .join(format!("{}.png", sanitize_shot_name(display_name)));
        DynamicImage::ImageRgba8(annotated)
            .save(&final_path)
            .with_context(|| format!("failed to save screenshot: {}", final_path.display()))?;
        let _ = fs::remove_file(&staging);

        write_json_pretty(
            &default_sidecar_for(&final_path),
            &json!({
                "display_name": display_name,
                "image_path": abs_path(&final_path).display().to_string(),
                "captured_at": timestamp_iso(),
                "rectangle": rect,
                "fallback_used": fallback_used,
            }),
        )?;

        Ok(Some(final_path))
    }
}

#[derive(Default)]
struct RecordingSink {
    requests: Vec<(String, HighlightRectangle)>,
}

impl HighlightSink for RecordingSink {
    fn capture(
        &mut self,
        display_name: &str,
        rect: &HighlightRectangle,
    ) -> Result<Option<PathBuf>> {
        self.requests.push((display_name.to_string(), *rect));
        Ok(None)
    }
}

fn load_viewport_metrics(spec: &str) -> Result<ViewportMetrics> {
    let raw = if let Some(path) = spec.strip_prefix('@') {
        fs::read_to_string(path)
            .with_context(|| format!("failed to read viewport metrics: {path}"))?
    } else {
        spec.to_string()
    };
    serde_json::from_str(&raw).context("invalid viewport metrics JSON")
}

fn parse_jobs_text(raw: &str) -> Vec<LookupJob> {
    let mut jobs = Vec::new();
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (name, code) = match trimmed
            .split_once('\t')
            .or_else(|| trimmed.split_once(','))
        {
            Some((name, code)) => (name.trim(), code.trim()),
            None => (trimmed, trimmed),
        };
        if code.is_empty() {
            continue;
        }
        let display = if name.is_empty() { code } else { name };
        jobs.push(LookupJob {
            display_name: display.to_string(),
            field_code: code.to_string(),
        });
    }
    jobs
}

fn parse_inline_job(raw: &str) -> Result<LookupJob> {
    if let Some((name, code)) = raw.split_once('=') {
        let name = name.trim();
        let code = code.trim();
        if name.is_empty() || code.is_empty() {
            bail!("invalid job {raw:?}: expected NAME=CODE");
        }
        return Ok(LookupJob {
            display_name: name.to_string(),
            field_code: code.to_string(),
        });
    }
    let code = raw.trim();
    if code.is_empty() {
        bail!("invalid job {raw:?}: expected NAME=CODE");
    }
    Ok(LookupJob {
        display_name: code.to_string(),
        field_code: code.to_string(),
    })
}

fn parse_row_range(spec: &str, total: usize) -> Result<(usize, usize)> {
    let trimmed = spec.trim();
    let (start, end) = if let Some((lo, hi)) = trimmed.split_once('-') {
        let start = if lo.trim().is_empty() {
            1
        } else {
            lo.trim()
                .parse::<usize>()
                .with_context(|| format!("invalid row range {spec:?}"))?
        };
        let end = if hi.trim().is_empty() {
            total
        } else {
            hi.trim()
                .parse::<usize>()
                .with_context(|| format!("invalid row range {spec:?}"))?
        };
        (start, end)
    } else {
        let row = trimmed
            .parse::<usize>()
            .with_context(|| format!("invalid row range {spec:?}"))?;
        (row, row)
    };

    if start == 0 {
        bail!("row ranges are 1-based: {spec:?}");
    }
    let start_idx = start - 1;
    let end_idx = end.min(total);
    if start_idx >= end_idx {
        bail!("row range {spec:?} selects nothing out of {total} job(s)");
    }
    Ok((start_idx, end_idx))
}

fn draw_highlight_rect(
    img: &mut RgbaImage,
    rect: &HighlightRectangle,
    color: Rgba<u8>,
    thickness: u32,
) {
    let (img_w, img_h) = img.dimensions();
    if img_w == 0 || img_h == 0 || rect.right <= rect.left || rect.bottom <= rect.top {
        return;
    }

    let clamp_x = |v: i64| v.clamp(0, i64::from(img_w) - 1) as u32;
    let clamp_y = |v: i64| v.clamp(0, i64::from(img_h) - 1) as u32;
    let x0 = clamp_x(rect.left);
    let y0 = clamp_y(rect.top);
    let x1 = clamp_x(rect.right);
    let y1 = clamp_y(rect.bottom);

    for t in 0..thickness.max(1) {
        let tx0 = x0.saturating_sub(t);
        let ty0 = y0.saturating_sub(t);
        let tx1 = (x1 + t).min(img_w - 1);
        let ty1 = (y1 + t).min(img_h - 1);

        for x in tx0..=tx1 {
            img.put_pixel(x, ty0, color);
            img.put_pixel(x, ty1, color);
        }
        for y in ty0..=ty1 {
            img.put_pixel(tx0, y, color);
            img.put_pixel(tx1, y, color);
        }
    }
}

fn draw_rect_label(img: &mut RgbaImage, rect: &HighlightRectangle, label: &str) {
    if label.is_empty() {
        return;
    }
    let x = to_i32(rect.left.max(0));
    let mut y = to_i32(rect.top) - 12;
    if y < 0 {
        y = to_i32(rect.bottom) + 4;
    }
    draw_bitmap_text(img, x, y, label, Rgba([255, 0, 0, 255]), 1);
}

fn draw_bitmap_text(img: &mut RgbaImage, x: i32, y: i32, text: &str, color: Rgba<u8>, scale: u32) {
    let scale_i = scale.max(1) as i32;
    let mut cursor_x = x;
    for ch in text.chars() {
        let Some(glyph) = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?')) else {
            cursor_x += 8 * scale_i;
            continue;
        };
        for (row_idx, row) in glyph.iter().enumerate() {
            let row_bits = *row;
            for col_idx in 0..8i32 {
                if (row_bits >> col_idx) & 1 == 0 {
                    continue;
                }
                for sy in 0..scale_i {
                    for sx in 0..scale_i {
                        let tx = cursor_x + col_idx * scale_i + sx;
                        let ty = y + row_idx as i32 * scale_i + sy;
                        if tx >= 0
                            && ty >= 0
                            && (tx as u32) < img.width()
                            && (ty as u32) < img.height()
                        {
                            img.put_pixel(tx as u32, ty as u32, color);
                        }
                    }
                }
            }
        }
        cursor_x += 8 * scale_i;
    }
}

fn to_i32(value: i64) -> i32 {
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

fn sanitize_shot_name(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-') {
            out.push(ch);
        } else {
            out.push('_');
        }
        if out.len() >= 50 {
            break;
        }
    }
    if out.is_empty() {
        "field".to_string()
    } else {
        out
    }
}

fn write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    ensure_parent_dir(path)?;
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).with_context(|| format!("failed to write JSON: {}", path.display()))?;
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory: {}", parent.display())
            })?;
        }
    }
    Ok(())
}

fn default_sidecar_for(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output")
        .to_string();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    parent.join(format!("{stem}.json"))
}

fn shots_root() -> PathBuf {
    env::var("EDI_SHOT_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".edi-locate").join("shots"))
}

fn abs_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(path)
}

fn timestamp_iso() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_document() -> Vec<DocumentLine> {
        document_lines(concat!(
            "ISA*00*          *00*          *ZZ*SUBMITTER      *ZZ*RECEIVER\n",
            "GS*HC*SUBMITTER*RECEIVER*20240101*1200*1*X*005010X222A1\n",
            "ST*837*0001*005010X222A1~\n",
            "BHT*0019*00*REF47517*20240101*1200*CH~\n",
            "CLM*36463774*100***11:B:1*Y*A*Y*Y~\n",
            "SE*5*0001~\n",
        ))
    }

    fn test_metrics() -> ViewportMetrics {
        ViewportMetrics {
            origin_x: 100,
            origin_y: 200,
            cell_width: 8,
            cell_height: 16,
            first_visible_line: 0,
            visible_lines: 50,
            scroll_columns: 0,
            padding: 3,
        }
    }

    enum StubMode {
        Ok,
        Unavailable,
        Fatal,
    }

    struct StubViewport {
        metrics: ViewportMetrics,
        scroll_calls: Vec<usize>,
        honor_scroll: bool,
        mode: StubMode,
    }

    impl StubViewport {
        fn new(metrics: ViewportMetrics) -> Self {
            Self {
                metrics,
                scroll_calls: Vec::new(),
                honor_scroll: true,
                mode: StubMode::Ok,
            }
        }
    }

    impl ViewportProvider for StubViewport {
        fn metrics(&mut self) -> Result<ViewportMetrics, ViewportError> {
            match self.mode {
                StubMode::Ok => Ok(self.metrics),
                StubMode::Unavailable => {
                    Err(ViewportError::Unavailable("stub offline".to_string()))
                }
                StubMode::Fatal => Err(ViewportError::Fatal("window gone".to_string())),
            }
        }

        fn scroll_to_line(&mut self, line_index: usize) -> Result<(), ViewportError> {
            self.scroll_calls.push(line_index);
            if self.honor_scroll {
                self.metrics.first_visible_line =
                    line_index.saturating_sub(self.metrics.visible_lines / 2);
            }
            Ok(())
        }
    }

    fn job(name: &str, code: &str) -> LookupJob {
        LookupJob {
            display_name: name.to_string(),
            field_code: code.to_string(),
        }
    }

    #[test]
    fn parse_accepts_simple_and_composite_codes() {
        assert_eq!(
            parse_field_code("BHT03").unwrap(),
            FieldReference {
                segment_tag: "BHT".to_string(),
                element_index: 3,
                sub_element_index: None,
            }
        );
        assert_eq!(
            parse_field_code("CLM05-1").unwrap(),
            FieldReference {
                segment_tag: "CLM".to_string(),
                element_index: 5,
                sub_element_index: Some(1),
            }
        );
        assert_eq!(
            parse_field_code("SV101-1").unwrap(),
            FieldReference {
                segment_tag: "SV1".to_string(),
                element_index: 1,
                sub_element_index: Some(1),
            }
        );
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(
            parse_field_code("clm05-1").unwrap(),
            parse_field_code("CLM05-1").unwrap()
        );
    }

    #[test]
    fn parse_rejects_malformed_codes() {
        for code in [
            "", "CL5", "CLM5A", "CLM05-", "CLM05-0", "CLM00", "CLM05-1-2", "1LM05", "CLMXX05",
            "ÇLM05",
        ] {
            assert!(parse_field_code(code).is_err(), "accepted {code:?}");
        }
    }

    #[test]
    fn locate_finds_sub_element_span() {
        let lines = sample_document();
        let reference = parse_field_code("CLM05-1").unwrap();
        match locate(&reference, &lines) {
            MatchResult::Found(span) => {
                assert_eq!(span.line_index, 4);
                assert_eq!(span.start_column, 19);
                assert_eq!(span.end_column, 21);
                assert_eq!(span_text(&lines, span), "11");
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[test]
    fn locate_finds_whole_element_span() {
        let lines = sample_document();
        let reference = parse_field_code("CLM05").unwrap();
        match locate(&reference, &lines) {
            MatchResult::Found(span) => {
                assert_eq!(span_text(&lines, span), "11:B:1");
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[test]
    fn locate_excludes_segment_terminator() {
        let lines = sample_document();
        let reference = parse_field_code("SE102").unwrap();
        // SE1 is not the tag on that line; use SE via a fresh document instead.
        assert!(matches!(
            locate(&reference, &lines),
            MatchResult::NotFound { .. }
        ));

        let lines = document_lines("DTP*472*D8*20240101~\n");
        let reference = parse_field_code("DTP03").unwrap();
        match locate(&reference, &lines) {
            MatchResult::Found(span) => {
                assert_eq!(span_text(&lines, span), "20240101");
                assert_eq!(span.end_column, 19);
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[test]
    fn locate_picks_first_matching_line() {
        let lines = document_lines(concat!(
            "CLM*1111*50***11:B:1*Y~\n",
            "CLM*2222*75***12:B:1*Y~\n",
        ));
        let reference = parse_field_code("CLM01").unwrap();
        match locate(&reference, &lines) {
            MatchResult::Found(span) => {
                assert_eq!(span.line_index, 0);
                assert_eq!(span_text(&lines, span), "1111");
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[test]
    fn locate_requires_exact_tag_match() {
        let lines = document_lines("CLMX*1111*50~\n");
        let reference = parse_field_code("CLM01").unwrap();
        assert!(matches!(
            locate(&reference, &lines),
            MatchResult::NotFound { .. }
        ));
    }

    #[test]
    fn locate_out_of_range_reports_search_pattern() {
        let lines = sample_document();
        let reference = parse_field_code("CLM99").unwrap();
        match locate(&reference, &lines) {
            MatchResult::NotFound { pattern, .. } => assert_eq!(pattern, "CLM*"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn locate_missing_sub_element_is_not_found() {
        let lines = sample_document();
        let reference = parse_field_code("CLM05-9").unwrap();
        match locate(&reference, &lines) {
            MatchResult::NotFound { pattern, .. } => assert_eq!(pattern, "CLM*"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn map_produces_expected_rectangle() {
        let span = TextSpan {
            line_index: 4,
            start_column: 19,
            end_column: 21,
        };
        let rect = map_to_screen(span, &test_metrics()).unwrap();
        assert_eq!(rect.left, 100 + 19 * 8 - 3);
        assert_eq!(rect.right, 100 + 21 * 8 + 3);
        assert_eq!(rect.top, 200 + 4 * 16 - 3);
        assert_eq!(rect.bottom, 200 + 5 * 16 + 3);
    }

    #[test]
    fn map_vertical_position_tracks_line_index() {
        let metrics = test_metrics();
        let lower = map_to_screen(
            TextSpan {
                line_index: 4,
                start_column: 0,
                end_column: 3,
            },
            &metrics,
        )
        .unwrap();
        let upper = map_to_screen(
            TextSpan {
                line_index: 5,
                start_column: 0,
                end_column: 3,
            },
            &metrics,
        )
        .unwrap();
        assert_eq!(upper.top - lower.top, i64::from(metrics.cell_height));
        assert_eq!(upper.bottom - lower.bottom, i64::from(metrics.cell_height));
    }

    #[test]
    fn map_applies_horizontal_scroll_offset() {
        let mut metrics = test_metrics();
        metrics.scroll_columns = 10;
        let span = TextSpan {
            line_index: 0,
            start_column: 12,
            end_column: 15,
        };
        let rect = map_to_screen(span, &metrics).unwrap();
        assert_eq!(rect.left, 100 + 2 * 8 - 3);
        assert_eq!(rect.right, 100 + 5 * 8 + 3);
    }

    #[test]
    fn map_rejects_lines_outside_viewport() {
        let mut metrics = test_metrics();
        metrics.first_visible_line = 10;
        metrics.visible_lines = 20;

        let before = TextSpan {
            line_index: 4,
            start_column: 0,
            end_column: 3,
        };
        assert!(map_to_screen(before, &metrics).is_err());

        let after = TextSpan {
            line_index: 30,
            start_column: 0,
            end_column: 3,
        };
        assert!(map_to_screen(after, &metrics).is_err());

        let inside = TextSpan {
            line_index: 29,
            start_column: 0,
            end_column: 3,
        };
        assert!(map_to_screen(inside, &metrics).is_ok());
    }

    #[test]
    fn map_rejects_empty_viewport() {
        let mut metrics = test_metrics();
        metrics.visible_lines = 0;
        let span = TextSpan {
            line_index: 0,
            start_column: 0,
            end_column: 3,
        };
        assert!(map_to_screen(span, &metrics).is_err());
    }

    #[test]
    fn batch_mixed_results_and_log_format() {
        let lines = sample_document();
        let mut viewport = StubViewport::new(test_metrics());
        let mut sink = RecordingSink::default();
        let jobs = vec![job("ISA Segment", "ISA01"), job("Ghost", "XYZ01")];

        let mut orchestrator = BatchOrchestrator {
            document: &lines,
            viewport: &mut viewport,
            sink: &mut sink,
            max_scroll_retries: 3,
            cancel: None,
        };
        let result = orchestrator.run(&jobs).unwrap();

        assert_eq!(result.successes.len(), 1);
        assert_eq!(result.failures.len(), 1);
        assert!(!result.cancelled);
        assert_eq!(result.successes[0].job.display_name, "ISA Segment");
        assert_eq!(result.successes[0].span.line_index, 0);
        assert_eq!(result.failures[0].reason, FailureReason::NotFound);

        let log = result.not_found_log();
        assert!(log.starts_with("NOT FOUND ("));
        assert!(log.contains("XYZ01 (searched: XYZ*)"));
        assert_eq!(sink.requests.len(), 1);
    }

    #[test]
    fn batch_malformed_code_is_logged_without_pattern() {
        let lines = sample_document();
        let mut viewport = StubViewport::new(test_metrics());
        let mut sink = RecordingSink::default();
        let jobs = vec![job("Broken", "CL5")];

        let mut orchestrator = BatchOrchestrator {
            document: &lines,
            viewport: &mut viewport,
            sink: &mut sink,
            max_scroll_retries: 3,
            cancel: None,
        };
        let result = orchestrator.run(&jobs).unwrap();

        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].pattern, None);
        assert!(result
            .not_found_log()
            .contains("CL5 (malformed field code)"));
    }

    #[test]
    fn batch_scroll_retry_recovers_hidden_line() {
        let lines = sample_document();
        let mut metrics = test_metrics();
        metrics.first_visible_line = 20;
        metrics.visible_lines = 10;
        let mut viewport = StubViewport::new(metrics);
        let mut sink = RecordingSink::default();
        let jobs = vec![job("Claim", "CLM05-1")];

        let mut orchestrator = BatchOrchestrator {
            document: &lines,
            viewport: &mut viewport,
            sink: &mut sink,
            max_scroll_retries: 3,
            cancel: None,
        };
        let result = orchestrator.run(&jobs).unwrap();

        assert_eq!(result.successes.len(), 1);
        assert_eq!(viewport.scroll_calls, vec![4]);
    }

    #[test]
    fn batch_gives_up_after_retry_ceiling() {
        let lines = sample_document();
        let mut metrics = test_metrics();
        metrics.first_visible_line = 20;
        metrics.visible_lines = 10;
        let mut viewport = StubViewport::new(metrics);
        viewport.honor_scroll = false;
        let mut sink = RecordingSink::default();
        let jobs = vec![job("Claim", "CLM05-1")];

        let mut orchestrator = BatchOrchestrator {
            document: &lines,
            viewport: &mut viewport,
            sink: &mut sink,
            max_scroll_retries: 2,
            cancel: None,
        };
        let result = orchestrator.run(&jobs).unwrap();

        assert!(result.successes.is_empty());
        assert_eq!(
            result.failures[0].reason,
            FailureReason::NotVisible { retries: 2 }
        );
        assert_eq!(viewport.scroll_calls.len(), 2);
    }

    #[test]
    fn batch_unavailable_viewport_fails_job_but_continues() {
        let lines = sample_document();
        let mut viewport = StubViewport::new(test_metrics());
        viewport.mode = StubMode::Unavailable;
        let mut sink = RecordingSink::default();
        let jobs = vec![job("ISA Segment", "ISA01"), job("Header", "BHT01")];

        let mut orchestrator = BatchOrchestrator {
            document: &lines,
            viewport: &mut viewport,
            sink: &mut sink,
            max_scroll_retries: 1,
            cancel: None,
        };
        let result = orchestrator.run(&jobs).unwrap();

        assert!(result.successes.is_empty());
        assert_eq!(result.failures.len(), 2);
        assert!(matches!(
            result.failures[0].reason,
            FailureReason::ViewportUnavailable { .. }
        ));
    }

    #[test]
    fn batch_fatal_viewport_aborts() {
        let lines = sample_document();
        let mut viewport = StubViewport::new(test_metrics());
        viewport.mode = StubMode::Fatal;
        let mut sink = RecordingSink::default();
        let jobs = vec![job("ISA Segment", "ISA01")];

        let mut orchestrator = BatchOrchestrator {
            document: &lines,
            viewport: &mut viewport,
            sink: &mut sink,
            max_scroll_retries: 1,
            cancel: None,
        };
        assert!(orchestrator.run(&jobs).is_err());
    }

    #[test]
    fn batch_is_idempotent() {
        let lines = sample_document();
        let jobs = vec![job("Claim", "CLM05-1")];

        let mut first_rect = None;
        for _ in 0..2 {
            let mut viewport = StubViewport::new(test_metrics());
            let mut sink = RecordingSink::default();
            let mut orchestrator = BatchOrchestrator {
                document: &lines,
                viewport: &mut viewport,
                sink: &mut sink,
                max_scroll_retries: 3,
                cancel: None,
            };
            let result = orchestrator.run(&jobs).unwrap();
            let rect = result.successes[0].rectangle;
            match first_rect {
                None => first_rect = Some(rect),
                Some(prev) => assert_eq!(prev, rect),
            }
        }
    }

    struct CancellingSink<'a> {
        flag: &'a AtomicBool,
        inner: RecordingSink,
    }

    impl HighlightSink for CancellingSink<'_> {
        fn capture(
            &mut self,
            display_name: &str,
            rect: &HighlightRectangle,
        ) -> Result<Option<PathBuf>> {
            self.flag.store(true, Ordering::Relaxed);
            self.inner.capture(display_name, rect)
        }
    }

    #[test]
    fn batch_cancellation_stops_between_jobs() {
        let lines = sample_document();
        let flag = AtomicBool::new(false);
        let mut viewport = StubViewport::new(test_metrics());
        let mut sink = CancellingSink {
            flag: &flag,
            inner: RecordingSink::default(),
        };
        let jobs = vec![job("ISA Segment", "ISA01"), job("Header", "BHT01")];

        let mut orchestrator = BatchOrchestrator {
            document: &lines,
            viewport: &mut viewport,
            sink: &mut sink,
            max_scroll_retries: 3,
            cancel: Some(&flag),
        };
        let result = orchestrator.run(&jobs).unwrap();

        assert!(result.cancelled);
        assert_eq!(result.successes.len(), 1);
        assert!(result.failures.is_empty());
        assert_eq!(result.successes[0].job.field_code, "ISA01");
    }

    #[test]
    fn jobs_text_accepts_tabs_commas_and_single_column() {
        let jobs = parse_jobs_text(concat!(
            "# header comment\n",
            "Claim Amount\tCLM02\n",
            "Provider,NM109\n",
            "BHT03\n",
            "\n",
        ));
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0], job("Claim Amount", "CLM02"));
        assert_eq!(jobs[1], job("Provider", "NM109"));
        assert_eq!(jobs[2], job("BHT03", "BHT03"));
    }

    #[test]
    fn inline_job_requires_name_and_code() {
        assert_eq!(
            parse_inline_job("ISA Segment=ISA01").unwrap(),
            job("ISA Segment", "ISA01")
        );
        assert_eq!(parse_inline_job("BHT03").unwrap(), job("BHT03", "BHT03"));
        assert!(parse_inline_job("=ISA01").is_err());
        assert!(parse_inline_job("name=").is_err());
    }

    #[test]
    fn row_range_matches_original_semantics() {
        assert_eq!(parse_row_range("2-3", 5).unwrap(), (1, 3));
        assert_eq!(parse_row_range("2-", 5).unwrap(), (1, 5));
        assert_eq!(parse_row_range("-2", 5).unwrap(), (0, 2));
        assert_eq!(parse_row_range("3", 5).unwrap(), (2, 3));
        assert_eq!(parse_row_range("4-99", 5).unwrap(), (3, 5));
        assert!(parse_row_range("0-2", 5).is_err());
        assert!(parse_row_range("4-2", 5).is_err());
        assert!(parse_row_range("x", 5).is_err());
    }

    #[test]
    fn sanitize_replaces_and_truncates() {
        assert_eq!(sanitize_shot_name("Claim Amount (USD)"), "Claim_Amount__USD_");
        assert_eq!(sanitize_shot_name(""), "field");
        assert_eq!(sanitize_shot_name(&"x".repeat(80)).len(), 50);
    }

    #[test]
    fn highlight_rect_draws_clamped_outline() {
        let mut img: RgbaImage = ImageBuffer::from_pixel(100, 50, Rgba([255, 255, 255, 255]));
        let rect = HighlightRectangle {
            left: 10,
            top: 10,
            right: 30,
            bottom: 20,
        };
        draw_highlight_rect(&mut img, &rect, Rgba([255, 0, 0, 255]), 1);
        assert_eq!(*img.get_pixel(10, 10), Rgba([255, 0, 0, 255]));
        assert_eq!(*img.get_pixel(30, 20), Rgba([255, 0, 0, 255]));
        assert_eq!(*img.get_pixel(20, 15), Rgba([255, 255, 255, 255]));

        // Off-image edges clamp instead of panicking.
        let wild = HighlightRectangle {
            left: -20,
            top: -20,
            right: 500,
            bottom: 500,
        };
        draw_highlight_rect(&mut img, &wild, Rgba([255, 0, 0, 255]), 2);
        assert_eq!(*img.get_pixel(0, 0), Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn screenshot_sink_falls_back_to_placeholder() {
        let dir = tempdir().unwrap();
        let mut sink = ScreenshotSink {
            capture_command: None,
            out_dir: dir.path().to_path_buf(),
            thickness: 3,
            timeout: Duration::from_millis(500),
        };
        let rect = HighlightRectangle {
            left: 40,
            top: 40,
            right: 200,
            bottom: 60,
        };
        let path = sink.capture("ISA Segment", &rect).unwrap().unwrap();
        assert!(path.exists());
        assert_eq!(path.file_name().unwrap(), "ISA_Segment.png");
        assert!(default_sidecar_for(&path).exists());
    }

    #[test]
    fn viewport_metrics_json_defaults() {
        let metrics: ViewportMetrics =
            serde_json::from_str(r#"{"cell_width": 8, "cell_height": 16, "visible_lines": 40}"#)
                .unwrap();
        assert_eq!(metrics.origin_x, 0);
        assert_eq!(metrics.first_visible_line, 0);
        assert_eq!(metrics.scroll_columns, 0);
        assert_eq!(metrics.padding, 3);
    }

    #[test]
    fn fixed_provider_scroll_recenters() {
        let mut provider = FixedViewportProvider {
            metrics: test_metrics(),
        };
        provider.scroll_to_line(200).unwrap();
        assert_eq!(provider.metrics().unwrap().first_visible_line, 175);
        provider.scroll_to_line(3).unwrap();
        assert_eq!(provider.metrics().unwrap().first_visible_line, 0);
    }

    #[test]
    fn writes_json_pretty() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a").join("b.json");
        write_json_pretty(&target, &json!({"ok": true})).unwrap();
        assert!(target.exists());
    }
}
