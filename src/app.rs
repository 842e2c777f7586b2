use std::env;
use std::io::{self, IsTerminal};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use tracing::debug;

use crate::config::{self, MonitorConfig, RuntimeSettings};
use crate::conversation::{resolve_workspace_uri, workspace_uri_from_path};
use crate::discovery::{
    COMMAND_TIMEOUT, Locator, ProcessLocator, candidate_processes, run_command,
};
use crate::driver::{Driver, PollReport};
use crate::monitor::{DisplayState, Monitor, MonitorSettings};
use crate::rpc::CancelToken;
use crate::ui::{self, RenderData};
use crate::util::{format_tokens, human_duration};

const HEADLESS_TICK: Duration = Duration::from_millis(200);
const FORCED_REDRAW: Duration = Duration::from_secs(30);

pub fn workspace_uri(config: &MonitorConfig, cli_workspace: Option<&str>) -> Result<String> {
    if let Some(input) = cli_workspace.or(config.workspace.as_deref()) {
        return Ok(resolve_workspace_uri(input));
    }
    let cwd = env::current_dir().context("failed to resolve current directory")?;
    Ok(workspace_uri_from_path(&cwd))
}

pub fn build_monitor(config: &MonitorConfig, workspace_uri: String) -> Monitor {
    let settings = MonitorSettings {
        workspace_uri: Some(workspace_uri),
        context_limits: config.context_limits.clone(),
        max_recent: config.recent_limit(),
    };
    Monitor::new(Box::new(ProcessLocator::new()), settings).with_persistence(config::state_path())
}

pub fn run_dashboard(config: MonitorConfig, cli_workspace: Option<&str>) -> Result<()> {
    let stop = install_stop_signal()?;
    if !io::stdout().is_terminal() {
        println!("No interactive terminal detected; running in headless watch mode.");
        return watch_loop(&config, cli_workspace, stop);
    }

    let runtime = config::runtime_settings(&config);
    let workspace = workspace_uri(&config, cli_workspace)?;
    let monitor = build_monitor(&config, workspace.clone());
    let mut driver = Driver::new(
        monitor,
        runtime.poll_interval,
        CancelToken::from_flag(Arc::clone(&stop)),
    );

    ui::enter_terminal()?;

    let started = Instant::now();
    let mut last_report: Option<PollReport> = None;
    let mut last_render_signature = String::new();
    let mut last_render_at = overdue_render_mark(Instant::now());
    let mut force_redraw = true;

    let mut run = || -> Result<()> {
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }

            let now = Instant::now();
            if let Some(report) = driver.tick(now) {
                last_report = Some(report);
            }

            let last_update = last_report
                .as_ref()
                .map(|report| report.finished_at.format("%H:%M:%S").to_string());
            let render = render_data(
                started,
                &workspace,
                runtime,
                &driver,
                last_report.as_ref(),
                last_update.as_deref(),
                now,
            );
            let signature = ui::frame_signature(&render);
            let should_draw = force_redraw
                || signature != last_render_signature
                || last_render_at.elapsed() >= FORCED_REDRAW;
            if should_draw {
                ui::draw(&render)?;
                last_render_signature = signature;
                last_render_at = Instant::now();
                force_redraw = false;
            }

            if event::poll(Duration::from_millis(100))? {
                match event::read()? {
                    Event::Key(key) => {
                        if key.code == KeyCode::Char('q')
                            || (key.code == KeyCode::Char('c')
                                && key.modifiers.contains(KeyModifiers::CONTROL))
                        {
                            break;
                        }
                        if key.code == KeyCode::Char('r') {
                            driver.refresh(Instant::now());
                            force_redraw = true;
                        }
                    }
                    Event::Resize(_, _) => {
                        force_redraw = true;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    };

    let run_result = run();
    driver.shutdown();
    let _ = ui::leave_terminal();
    run_result
}

fn overdue_render_mark(now: Instant) -> Instant {
    now.checked_sub(FORCED_REDRAW).unwrap_or(now)
}

fn render_data<'a>(
    started: Instant,
    workspace: &'a str,
    runtime: RuntimeSettings,
    driver: &Driver,
    report: Option<&'a PollReport>,
    last_update: Option<&'a str>,
    now: Instant,
) -> RenderData<'a> {
    RenderData {
        running_for: started.elapsed(),
        workspace: Some(workspace),
        poll_interval_secs: runtime.poll_interval.as_secs(),
        endpoint: report.and_then(|report| report.endpoint.as_ref()),
        polling: driver.is_polling(),
        last_update,
        error: report.and_then(|report| report.error.as_deref()),
        consecutive_failures: report.map_or(0, |report| report.consecutive_failures),
        next_poll_in: driver.time_until_next(now),
        state: report.map(|report| &report.state),
    }
}

pub fn run_watch(config: MonitorConfig, cli_workspace: Option<&str>) -> Result<()> {
    let stop = install_stop_signal()?;
    watch_loop(&config, cli_workspace, stop)
}

fn watch_loop(
    config: &MonitorConfig,
    cli_workspace: Option<&str>,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let runtime = config::runtime_settings(config);
    let workspace = workspace_uri(config, cli_workspace)?;
    println!("Watching {workspace} every {}s.", runtime.poll_interval.as_secs());
    println!("Press Ctrl+C to stop.");

    let monitor = build_monitor(config, workspace);
    let mut driver = Driver::new(
        monitor,
        runtime.poll_interval,
        CancelToken::from_flag(Arc::clone(&stop)),
    );
    let mut last_line = String::new();

    while !stop.load(Ordering::Relaxed) {
        if let Some(report) = driver.tick(Instant::now()) {
            let line = report_line(&report);
            if line != last_line {
                println!("[{}] {line}", report.finished_at.format("%H:%M:%S"));
                last_line = line;
            }
        }
        thread::sleep(HEADLESS_TICK);
    }

    driver.shutdown();
    Ok(())
}

fn report_line(report: &PollReport) -> String {
    let mut line = ui::summary_line(&report.state);
    if let Some(error) = &report.error {
        line.push_str(&format!(
            " | {error} (retry in {})",
            human_duration(report.next_delay)
        ));
    }
    line
}

pub fn print_status(config: &MonitorConfig, cli_workspace: Option<&str>, json: bool) -> Result<()> {
    let workspace = workspace_uri(config, cli_workspace)?;
    let mut monitor = build_monitor(config, workspace.clone());
    let result = monitor.poll(&CancelToken::new());
    let error = result.as_ref().err().map(ToString::to_string);
    let state = result.unwrap_or(DisplayState::Disconnected);

    if json {
        let report = serde_json::json!({
            "workspace": workspace,
            "endpoint": monitor.endpoint(),
            "error": error,
            "display": state,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("antigravity-context-monitor status");
    println!("workspace: {workspace}");
    match monitor.endpoint() {
        Some(endpoint) => println!("server: {}", endpoint.describe()),
        None => println!("server: not found"),
    }
    if let Some(error) = error {
        println!("error: {error}");
    }
    println!("state: {}", state.label());
    print_state_details(&state);
    Ok(())
}

fn print_state_details(state: &DisplayState) {
    match state {
        DisplayState::Disconnected => {}
        DisplayState::NoConversations {
            context_limit,
            model,
        }
        | DisplayState::Idle {
            context_limit,
            model,
        } => {
            println!("context: 0/{}", format_tokens(*context_limit));
            println!("model: {}", model.as_deref().unwrap_or("n/a"));
        }
        DisplayState::Active {
            reason,
            current,
            recent,
        } => {
            println!("selected: {} ({})", current.cascade_id, reason.label());
            println!("context: {}", ui::status_text(current));
            for line in ui::context_detail_lines(current, ui::UiLayoutMode::Full, 100) {
                println!("  {line}");
            }
            let others: Vec<_> = recent
                .iter()
                .filter(|usage| usage.cascade_id != current.cascade_id)
                .collect();
            if !others.is_empty() {
                println!("other_sessions:");
                for usage in others {
                    println!("  - {} | {}", usage.title, ui::status_text(usage));
                }
            }
        }
    }
}

pub fn doctor(config: &MonitorConfig, cli_workspace: Option<&str>) -> Result<u8> {
    let mut issues = 0u8;
    let workspace = workspace_uri(config, cli_workspace)?;

    println!("antigravity-context-monitor doctor");
    println!("config_path: {}", config::config_path().display());
    println!("state_path: {}", config::state_path().display());
    println!("workspace: {workspace}");

    if cfg!(windows) {
        issues += 1;
        println!("[WARN] Language server discovery is not supported on Windows.");
    }

    for (program, probe_arg) in [("ps", "-p1"), ("lsof", "-v")] {
        if command_available(program, probe_arg) {
            println!("[OK] {program} command available.");
        } else {
            issues += 1;
            println!("[WARN] {program} command not found in PATH.");
        }
    }

    let cancel = CancelToken::new();
    match run_command("ps", &["-ax", "-o", "pid=,command="], COMMAND_TIMEOUT, &cancel) {
        Ok(output) => {
            let candidates = candidate_processes(&output, Some(&workspace));
            if candidates.is_empty() {
                issues += 1;
                println!("[WARN] No Antigravity language server process found.");
            } else {
                println!(
                    "[OK] Found {} language server process(es).",
                    candidates.len()
                );
            }
        }
        Err(err) => {
            issues += 1;
            println!("[WARN] Process listing failed: {err:#}");
        }
    }

    match ProcessLocator::new().locate(Some(&workspace), &cancel) {
        Some(connection) => {
            println!("[OK] Probe succeeded: {}", connection.endpoint.describe());
        }
        None => {
            issues += 1;
            println!("[WARN] No language server answered the probe.");
        }
    }

    if issues == 0 {
        println!("Doctor: healthy");
        Ok(0)
    } else {
        println!("Doctor: {issues} issue(s) found");
        Ok(1)
    }
}

fn command_available(program: &str, probe_arg: &str) -> bool {
    let status = Command::new(program)
        .arg(probe_arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(err) = &status {
        debug!(program, error = %err, "command probe failed");
    }
    status.is_ok()
}

fn install_stop_signal() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(stop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_workspace_wins_over_config() {
        let config = MonitorConfig {
            workspace: Some("/from/config".to_string()),
            ..MonitorConfig::default()
        };
        let uri = workspace_uri(&config, Some("file:///from/cli")).expect("uri");
        assert_eq!(uri, "file:///from/cli");

        let uri = workspace_uri(&config, None).expect("uri");
        assert_eq!(uri, "file:///from/config");
    }

    #[test]
    fn missing_workspace_falls_back_to_current_directory() {
        let uri = workspace_uri(&MonitorConfig::default(), None).expect("uri");
        assert!(uri.starts_with("file:///"));
    }

    #[test]
    fn first_frame_mark_never_underflows() {
        let now = Instant::now();
        let mark = overdue_render_mark(now);
        assert!(mark <= now);
        if let Some(expected) = now.checked_sub(FORCED_REDRAW) {
            assert_eq!(mark, expected);
        } else {
            assert_eq!(mark, now);
        }
    }

    #[test]
    fn report_line_carries_error_and_retry() {
        let report = PollReport {
            state: DisplayState::Disconnected,
            endpoint: None,
            error: Some("no Antigravity language server found".to_string()),
            finished_at: chrono::Local::now(),
            consecutive_failures: 2,
            next_delay: Duration::from_secs(10),
        };
        assert_eq!(
            report_line(&report),
            "disconnected: language server not reachable | no Antigravity language server found (retry in 10s)"
        );
    }
}
