use std::fmt::Write as _;
use std::io::{Write, stdout};
use std::time::Duration;

use anyhow::Result;
use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::execute;
use crossterm::style::{Color, Stylize};
use crossterm::terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen};

use crate::monitor::DisplayState;
use crate::rpc::Endpoint;
use crate::usage::{CompressionSource, ContextUsage};
use crate::util::{
    format_percent, format_tokens, group_digits, human_duration, now_local, progress_bar, truncate,
};

const FOOTER_ROWS: u16 = 1;
const FOOTER_TEXT: &str = "Press q or Ctrl+C to quit, r to refresh.";

const FULL_BANNER: [&str; 5] = [
    "+------------------------------------------------+",
    "|      _   _  _ _____ ___ ___ ___    ___   __    |",
    "|     /_\\ | \\| |_   _|_ _/ __| _ \\  /_\\ \\ / /    |",
    "|    / _ \\| .` | | |  | | (_ |   / / _ \\ V /     |",
    "+---- context window monitor -------------------+",
];

const COMPACT_BANNER: [&str; 2] = [
    "ANTIGRAVITY CONTEXT MONITOR",
    "Live context-window usage per workspace",
];

const MINIMAL_BANNER: &str = "Antigravity Context";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiLayoutMode {
    Full,
    Compact,
    Minimal,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameBudget {
    pub width: u16,
    pub height: u16,
    pub footer_rows: u16,
}

impl FrameBudget {
    fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            footer_rows: FOOTER_ROWS.min(height),
        }
    }

    fn body_bottom(self) -> u16 {
        self.height.saturating_sub(self.footer_rows)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Elevated,
    High,
    Critical,
}

impl Severity {
    pub fn from_percent(percent: f64) -> Self {
        if percent >= 95.0 {
            Self::Critical
        } else if percent >= 80.0 {
            Self::High
        } else if percent >= 50.0 {
            Self::Elevated
        } else {
            Self::Normal
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Elevated => "elevated",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    fn color(self) -> Color {
        match self {
            Self::Normal => Color::Green,
            Self::Elevated => Color::Yellow,
            Self::High => Color::DarkYellow,
            Self::Critical => Color::Red,
        }
    }
}

pub struct RenderData<'a> {
    pub running_for: Duration,
    pub workspace: Option<&'a str>,
    pub poll_interval_secs: u64,
    pub endpoint: Option<&'a Endpoint>,
    pub polling: bool,
    pub last_update: Option<&'a str>,
    pub error: Option<&'a str>,
    pub consecutive_failures: u32,
    pub next_poll_in: Duration,
    pub state: Option<&'a DisplayState>,
}

pub fn enter_terminal() -> Result<()> {
    let mut out = stdout();
    terminal::enable_raw_mode()?;
    execute!(out, EnterAlternateScreen, Hide)?;
    Ok(())
}

pub fn leave_terminal() -> Result<()> {
    let mut out = stdout();
    execute!(out, Show, LeaveAlternateScreen)?;
    terminal::disable_raw_mode()?;
    Ok(())
}

pub fn draw(data: &RenderData<'_>) -> Result<()> {
    let mut out = stdout();
    let (width, height) = terminal::size()?;
    if width == 0 || height == 0 {
        return Ok(());
    }

    let budget = FrameBudget::new(width, height);
    let max_body_row = budget.body_bottom();
    let layout = select_layout_mode(width, height);
    let w = width as usize;

    execute!(out, MoveTo(0, 0), Clear(ClearType::All))?;

    let mut row = 0u16;
    draw_banner(&mut out, &mut row, max_body_row, w, layout)?;
    let _ = write_line(&mut out, &mut row, max_body_row, w, "");

    render_runtime_section(&mut out, &mut row, max_body_row, w, layout, data)?;
    let _ = write_line(&mut out, &mut row, max_body_row, w, "");

    render_context_section(&mut out, &mut row, max_body_row, w, layout, data)?;
    let _ = write_line(&mut out, &mut row, max_body_row, w, "");

    render_recent_section(&mut out, &mut row, max_body_row, w, layout, data)?;
    render_footer(&mut out, w, height)?;

    out.flush()?;
    Ok(())
}

pub fn frame_signature(data: &RenderData<'_>) -> String {
    let mut signature = String::with_capacity(256);
    let _ = write!(
        signature,
        "{}|{}|{}|{}|{}|{}|",
        data.polling,
        data.endpoint.map(Endpoint::describe).unwrap_or_default(),
        data.last_update.unwrap_or(""),
        data.error.unwrap_or(""),
        data.consecutive_failures,
        data.next_poll_in.as_secs(),
    );

    match data.state {
        None => signature.push_str("pending|"),
        Some(DisplayState::Active {
            current, recent, ..
        }) => {
            for usage in std::iter::once(current).chain(recent.iter()) {
                let _ = write!(
                    signature,
                    "{}:{}:{}:{}:{}|",
                    usage.cascade_id,
                    usage.context_used,
                    usage.step_count,
                    usage.compression_detected,
                    usage.has_gaps
                );
            }
        }
        Some(other) => {
            let _ = write!(signature, "{}|", summary_line(other));
        }
    }

    signature
}

pub fn status_text(usage: &ContextUsage) -> String {
    let percent = if usage.is_over_limit() {
        "~100".to_string()
    } else {
        format_percent(usage.usage_percent)
    };
    let mut text = format!(
        "{}/{}, {percent}%",
        format_tokens(usage.context_used),
        format_tokens(usage.context_limit)
    );
    if usage.is_over_limit() {
        text.push_str(" [compressing]");
    } else if usage.compression_detected {
        text.push_str(" [compressed]");
    }
    if usage.has_gaps {
        text.push_str(" [gaps]");
    }
    text
}

pub fn summary_line(state: &DisplayState) -> String {
    match state {
        DisplayState::Disconnected => "disconnected: language server not reachable".to_string(),
        DisplayState::NoConversations {
            context_limit,
            model,
        } => format!(
            "no conversations | 0/{} | {}",
            format_tokens(*context_limit),
            model.as_deref().unwrap_or("no model yet")
        ),
        DisplayState::Idle {
            context_limit,
            model,
        } => format!(
            "idle | 0/{} | {}",
            format_tokens(*context_limit),
            model.as_deref().unwrap_or("no model yet")
        ),
        DisplayState::Active { current, .. } => format!(
            "{} | {} | {} | {}",
            truncate(&current.title, 40),
            status_text(current),
            current.model_display_name,
            source_label(current)
        ),
    }
}

pub fn source_label(usage: &ContextUsage) -> &'static str {
    if usage.is_estimated {
        "estimated"
    } else {
        "precise"
    }
}

pub fn compression_line(usage: &ContextUsage) -> Option<String> {
    let stats = usage.compression_stats()?;
    let source = match stats.source {
        CompressionSource::CrossPoll => "between polls",
        CompressionSource::Checkpoint => "checkpoint",
    };
    Some(format!(
        "-{} ({:.1}%, {source})",
        format_tokens(stats.dropped_tokens),
        stats.drop_percent
    ))
}

pub fn context_detail_lines(usage: &ContextUsage, layout: UiLayoutMode, width: usize) -> Vec<String> {
    let value_width = width.saturating_sub(13);
    let mut lines = vec![
        kv_line("Session", &truncate(&usage.title, value_width)),
        kv_line("Model", &truncate(&usage.model_display_name, value_width)),
    ];

    let remaining = usage.context_limit.saturating_sub(usage.context_used);
    lines.push(kv_line(
        "Used",
        &format!(
            "{} of {} tokens ({})",
            group_digits(usage.context_used),
            group_digits(usage.context_limit),
            source_label(usage)
        ),
    ));
    if !matches!(layout, UiLayoutMode::Minimal) {
        lines.push(kv_line("Remaining", &format!("{} tokens", group_digits(remaining))));
        if let Some(last) = &usage.last_model_usage {
            lines.push(kv_line(
                "Checkpoint",
                &format!(
                    "in {} | out {} | +{} est.",
                    format_tokens(last.input_tokens),
                    format_tokens(last.output_tokens),
                    format_tokens(usage.estimated_delta_since_checkpoint)
                ),
            ));
        } else {
            lines.push(kv_line("Checkpoint", "none yet (full estimate)"));
        }
        lines.push(kv_line(
            "Steps",
            &format!("{} | {}", usage.step_count, usage.status.label()),
        ));
    }
    if matches!(layout, UiLayoutMode::Full) {
        lines.push(kv_line(
            "Output",
            &format!(
                "model {} | tools {}",
                format_tokens(usage.total_output_tokens),
                format_tokens(usage.total_tool_call_output_tokens)
            ),
        ));
        if usage.image_gen_step_count > 0 {
            lines.push(kv_line("Images", &usage.image_gen_step_count.to_string()));
        }
    }
    if let Some(compression) = compression_line(usage) {
        lines.push(kv_line("Compressed", &compression));
    }
    if usage.has_gaps {
        lines.push(kv_line("Warning", "some steps failed to load; usage may be low"));
    }
    lines
}

fn render_runtime_section(
    out: &mut impl Write,
    row: &mut u16,
    max_body_row: u16,
    width: usize,
    layout: UiLayoutMode,
    data: &RenderData<'_>,
) -> Result<()> {
    if !write_line(out, row, max_body_row, width, &hr("Runtime", width))? {
        return Ok(());
    }

    let server = match data.endpoint {
        Some(endpoint) => endpoint.describe(),
        None if data.polling => "searching...".to_string(),
        None => "not connected".to_string(),
    };
    let mut lines = vec![
        kv_line("Now", &now_local()),
        kv_line("Uptime", &human_duration(data.running_for)),
        kv_line("Server", &server),
    ];

    if !matches!(layout, UiLayoutMode::Minimal) {
        lines.push(kv_line(
            "Workspace",
            &truncate(data.workspace.unwrap_or("none"), width.saturating_sub(13)),
        ));
        let next = if data.polling {
            "polling now".to_string()
        } else {
            format!("next in {}", human_duration(data.next_poll_in))
        };
        let mut polling = format!("{}s | {next}", data.poll_interval_secs);
        if data.consecutive_failures > 0 {
            let _ = write!(polling, " | {} failed in a row", data.consecutive_failures);
        }
        lines.push(kv_line("Polling", &polling));
    }

    if matches!(layout, UiLayoutMode::Full) {
        lines.push(kv_line("Last Update", data.last_update.unwrap_or("never")));
    }

    if let Some(error) = data.error {
        lines.push(kv_line("Error", error));
    }

    for line in lines {
        if !write_line(out, row, max_body_row, width, &line)? {
            break;
        }
    }

    Ok(())
}

fn render_context_section(
    out: &mut impl Write,
    row: &mut u16,
    max_body_row: u16,
    width: usize,
    layout: UiLayoutMode,
    data: &RenderData<'_>,
) -> Result<()> {
    if !write_line(out, row, max_body_row, width, &hr("Context", width))? {
        return Ok(());
    }

    let usage = match data.state {
        None => {
            let _ = write_line(out, row, max_body_row, width, "Waiting for the first poll...");
            return Ok(());
        }
        Some(DisplayState::Active { current, .. }) => current,
        Some(other) => {
            let _ = write_line(out, row, max_body_row, width, &summary_line(other));
            let hint = match other {
                DisplayState::Disconnected => "Is Antigravity running? Press r to retry now.",
                _ => "Waiting for activity in this workspace.",
            };
            let _ = write_line(out, row, max_body_row, width, hint);
            return Ok(());
        }
    };

    let line = render_usage_row(usage, width);
    if !write_line_unchecked(out, row, max_body_row, &line)? {
        return Ok(());
    }

    for line in context_detail_lines(usage, layout, width) {
        if !write_line(out, row, max_body_row, width, &line)? {
            break;
        }
    }

    Ok(())
}

fn render_recent_section(
    out: &mut impl Write,
    row: &mut u16,
    max_body_row: u16,
    width: usize,
    layout: UiLayoutMode,
    data: &RenderData<'_>,
) -> Result<()> {
    let Some(DisplayState::Active { current, recent, .. }) = data.state else {
        return Ok(());
    };
    let others: Vec<&ContextUsage> = recent
        .iter()
        .filter(|usage| usage.cascade_id != current.cascade_id)
        .collect();
    if others.is_empty() {
        return Ok(());
    }
    if !write_line(out, row, max_body_row, width, &hr("Other Sessions", width))? {
        return Ok(());
    }

    let per_session_lines = if matches!(layout, UiLayoutMode::Minimal) {
        1u16
    } else {
        2u16
    };

    for usage in others {
        if max_body_row.saturating_sub(*row) < per_session_lines {
            break;
        }

        let header = format!(
            "- {} | {}",
            truncate(&usage.title, 36),
            status_text(usage)
        );
        if !write_line(out, row, max_body_row, width, &header)? {
            break;
        }

        if per_session_lines == 2 {
            let detail = format!(
                "  {} | {} steps | {} | {}",
                truncate(&usage.model_display_name, 28),
                usage.step_count,
                usage.status.label(),
                source_label(usage)
            );
            if !write_line(out, row, max_body_row, width, &detail)? {
                break;
            }
        }
    }

    Ok(())
}

fn draw_banner(
    out: &mut impl Write,
    row: &mut u16,
    max_body_row: u16,
    width: usize,
    layout: UiLayoutMode,
) -> Result<()> {
    if *row >= max_body_row {
        return Ok(());
    }

    match layout {
        UiLayoutMode::Full if width >= 60 => {
            for line in FULL_BANNER {
                let centered = center_line(line, width);
                if !write_line(out, row, max_body_row, width, &centered)? {
                    break;
                }
            }
        }
        UiLayoutMode::Full | UiLayoutMode::Compact => {
            for text in COMPACT_BANNER {
                let centered = center_line(text, width);
                if !write_line(out, row, max_body_row, width, &centered)? {
                    break;
                }
            }
        }
        UiLayoutMode::Minimal => {
            let centered = center_line(MINIMAL_BANNER, width);
            let _ = write_line(out, row, max_body_row, width, &centered)?;
        }
    }

    Ok(())
}

fn render_footer(out: &mut impl Write, width: usize, height: u16) -> Result<()> {
    if height == 0 {
        return Ok(());
    }

    execute!(out, MoveTo(0, height - 1), Clear(ClearType::CurrentLine))?;
    write!(out, "{}", truncate(FOOTER_TEXT, width).dark_grey())?;
    Ok(())
}

fn write_line(
    out: &mut impl Write,
    row: &mut u16,
    max_body_row: u16,
    width: usize,
    text: &str,
) -> Result<bool> {
    if *row >= max_body_row {
        return Ok(false);
    }

    execute!(out, MoveTo(0, *row), Clear(ClearType::CurrentLine))?;
    write!(out, "{}", truncate(text, width))?;
    *row += 1;
    Ok(true)
}

fn write_line_unchecked(
    out: &mut impl Write,
    row: &mut u16,
    max_body_row: u16,
    text: &str,
) -> Result<bool> {
    if *row >= max_body_row {
        return Ok(false);
    }

    execute!(out, MoveTo(0, *row), Clear(ClearType::CurrentLine))?;
    write!(out, "{text}")?;
    *row += 1;
    Ok(true)
}

fn kv_line(label: &str, value: &str) -> String {
    format!("{label:<11}: {value}")
}

fn render_usage_row(usage: &ContextUsage, width: usize) -> String {
    let severity = Severity::from_percent(usage.usage_percent);
    let color = severity.color();
    let status = status_text(usage).with(color).bold();
    let bar = progress_bar(usage.usage_percent, usage_bar_width(width)).with(color);

    if width < 48 {
        return format!("{status}");
    }
    format!("[{bar}] {status}")
}

fn usage_bar_width(width: usize) -> usize {
    if width >= 140 {
        40
    } else if width >= 112 {
        32
    } else if width >= 92 {
        24
    } else if width >= 72 {
        16
    } else {
        10
    }
}

fn hr(title: &str, width: usize) -> String {
    if width == 0 {
        return String::new();
    }

    let core = format!(" {title} ");
    if core.len() >= width {
        return truncate(title, width);
    }

    let side = (width - core.len()) / 2;
    let right = width - core.len() - side;
    format!("{}{}{}", "-".repeat(side), core, "-".repeat(right))
}

fn select_layout_mode(width: u16, height: u16) -> UiLayoutMode {
    if width >= 96 && height >= 30 {
        UiLayoutMode::Full
    } else if width >= 64 && height >= 20 {
        UiLayoutMode::Compact
    } else {
        UiLayoutMode::Minimal
    }
}

fn center_line(text: &str, width: usize) -> String {
    let clipped = truncate(text, width);
    let left_pad = width.saturating_sub(clipped.chars().count()) / 2;
    format!("{}{}", " ".repeat(left_pad), clipped)
}
