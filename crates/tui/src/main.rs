//! loopcast dashboard TUI
//!
//! Terminal interface for watching the streaming pipeline in real time.
//! Polls the status endpoint (default http://127.0.0.1:7979/status).

use clap::Parser;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Cell, Chart, Dataset, Gauge, Paragraph, Row, Table, Wrap},
    Frame, Terminal,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, VecDeque},
    io::{self, Stdout},
    time::{Duration, Instant},
};

const DEFAULT_STATUS_URL: &str = "http://127.0.0.1:7979/status";
const POLL_INTERVAL_MS: u64 = 500;
const MAX_HISTORY_POINTS: usize = 120;
const MAX_EVENT_LOG_ENTRIES: usize = 100;

// ============================================================================
// Data Models (mirroring loopcast status types)
// ============================================================================

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Running totals reported by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PipelineCounters {
    pub cycles_completed: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub launch_failed_jobs: u64,
    pub timed_out_jobs: u64,
    pub deleted_files: u64,
    pub deletion_failures: u64,
    pub signals_received: u64,
}

impl PipelineCounters {
    /// Jobs that ended, whatever the result
    pub fn finished_jobs(&self) -> u64 {
        self.completed_jobs + self.failed_jobs + self.launch_failed_jobs + self.timed_out_jobs
    }
}

/// Most recent encoder result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastOutcome {
    pub job_id: String,
    pub batch_index: usize,
    pub outcome: String,
    pub exit_code: Option<i32>,
}

/// Complete status snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSnapshot {
    pub timestamp_unix_ms: i64,
    pub state: String,
    pub cycle: u64,
    pub batch_index: Option<usize>,
    pub batch_count: usize,
    pub current_members: Vec<String>,
    pub inventory_size: usize,
    pub counters: PipelineCounters,
    pub last_outcome: Option<LastOutcome>,
    pub viewers: BTreeMap<u16, usize>,
    pub system: SystemMetrics,
}

impl Default for PipelineSnapshot {
    fn default() -> Self {
        Self {
            timestamp_unix_ms: 0,
            state: "idle".to_string(),
            cycle: 0,
            batch_index: None,
            batch_count: 0,
            current_members: Vec::new(),
            inventory_size: 0,
            counters: PipelineCounters::default(),
            last_outcome: None,
            viewers: BTreeMap::new(),
            system: SystemMetrics::default(),
        }
    }
}

/// Event log lines for what changed between two snapshots
pub fn describe_changes(prev: Option<&PipelineSnapshot>, next: &PipelineSnapshot) -> Vec<String> {
    let Some(prev) = prev else {
        return vec![format!("Connected: pipeline {}", next.state)];
    };

    let mut events = Vec::new();
    if next.cycle != prev.cycle {
        events.push(format!(
            "Cycle {} started ({} files)",
            next.cycle, next.inventory_size
        ));
    }
    if next.state != prev.state {
        events.push(format!("State: {} -> {}", prev.state, next.state));
    }
    if next.batch_index != prev.batch_index {
        if let Some(index) = next.batch_index {
            events.push(format!(
                "Streaming batch {}/{} ({} files)",
                index + 1,
                next.batch_count,
                next.current_members.len()
            ));
        }
    }
    if next.last_outcome != prev.last_outcome {
        if let Some(outcome) = &next.last_outcome {
            let code = outcome
                .exit_code
                .map(|c| format!(" (exit {})", c))
                .unwrap_or_default();
            events.push(format!(
                "Batch {} {}{}",
                outcome.batch_index + 1,
                outcome.outcome,
                code
            ));
        }
    }
    let deleted = next
        .counters
        .deleted_files
        .saturating_sub(prev.counters.deleted_files);
    if deleted > 0 {
        events.push(format!("Retention deleted {} file(s)", deleted));
    }
    let failures = next
        .counters
        .deletion_failures
        .saturating_sub(prev.counters.deletion_failures);
    if failures > 0 {
        events.push(format!("Retention failed on {} file(s)", failures));
    }
    events
}

// ============================================================================
// App State
// ============================================================================

/// ltop - live view of a loopcast pipeline
#[derive(Parser, Debug)]
#[command(name = "ltop")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Status endpoint to poll
    #[arg(short, long, default_value = DEFAULT_STATUS_URL)]
    url: String,
}

/// Main application state for the TUI dashboard
pub struct App {
    /// Current snapshot from loopcast
    pub status: Option<PipelineSnapshot>,
    /// Event log with recent pipeline transitions
    pub event_log: VecDeque<String>,
    /// Finished jobs over time for the chart (elapsed_secs, jobs)
    pub job_history: VecDeque<(f64, f64)>,
    /// Connection status
    pub connected: bool,
    url: String,
    /// HTTP client for status fetching
    client: reqwest::Client,
    /// Start time for chart x-axis
    start_time: Instant,
}

impl App {
    /// Create a new App instance
    pub fn new(url: String) -> Self {
        Self {
            status: None,
            event_log: VecDeque::with_capacity(MAX_EVENT_LOG_ENTRIES),
            job_history: VecDeque::with_capacity(MAX_HISTORY_POINTS),
            connected: false,
            url,
            client: reqwest::Client::new(),
            start_time: Instant::now(),
        }
    }

    /// Add an event to the log
    pub fn log_event(&mut self, event: String) {
        if self.event_log.len() >= MAX_EVENT_LOG_ENTRIES {
            self.event_log.pop_front();
        }
        self.event_log.push_back(event);
    }

    /// Fetch the snapshot from the status endpoint
    pub async fn fetch_status(&mut self) {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    match response.json::<PipelineSnapshot>().await {
                        Ok(snapshot) => self.apply_snapshot(snapshot),
                        Err(e) => {
                            self.log_event(format!("JSON parse error: {}", e));
                            self.connected = false;
                        }
                    }
                } else {
                    self.log_event(format!("HTTP error: {}", response.status()));
                    self.connected = false;
                }
            }
            Err(e) => {
                if self.connected {
                    self.log_event(format!("Connection lost: {}", e));
                }
                self.connected = false;
            }
        }
    }

    /// Record a fresh snapshot, logging what changed
    pub fn apply_snapshot(&mut self, snapshot: PipelineSnapshot) {
        let previous = if self.connected {
            self.status.as_ref()
        } else {
            None
        };
        for event in describe_changes(previous, &snapshot) {
            self.log_event(event);
        }

        let elapsed_secs = self.start_time.elapsed().as_secs_f64();
        if self.job_history.len() >= MAX_HISTORY_POINTS {
            self.job_history.pop_front();
        }
        self.job_history
            .push_back((elapsed_secs, snapshot.counters.finished_jobs() as f64));

        self.status = Some(snapshot);
        self.connected = true;
    }
}

// ============================================================================
// Terminal Setup/Teardown
// ============================================================================

/// Initialize the terminal for TUI rendering
fn setup_terminal() -> io::Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

/// Restore terminal to normal state
fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

// ============================================================================
// Widget Rendering
// ============================================================================

fn state_color(state: &str) -> Color {
    match state {
        "streaming" => Color::Green,
        "cycle_complete" => Color::Cyan,
        "stopped" => Color::Red,
        _ => Color::Yellow,
    }
}

/// Render pipeline state and current batch summary
fn render_pipeline(f: &mut Frame, area: Rect, app: &App) {
    let title = if app.connected {
        " Pipeline "
    } else {
        " Pipeline (Disconnected) "
    };

    let lines = match app.status {
        Some(ref status) => {
            let batch = match status.batch_index {
                Some(index) => format!("{}/{}", index + 1, status.batch_count),
                None => "-".to_string(),
            };
            let last = match status.last_outcome {
                Some(ref o) => format!("{} (batch {})", o.outcome, o.batch_index + 1),
                None => "-".to_string(),
            };
            vec![
                Line::from(vec![
                    Span::raw("State:     "),
                    Span::styled(
                        status.state.clone(),
                        Style::default()
                            .fg(state_color(&status.state))
                            .add_modifier(Modifier::BOLD),
                    ),
                ]),
                Line::from(format!("Cycle:     {}", status.cycle)),
                Line::from(format!("Batch:     {}", batch)),
                Line::from(format!("Inventory: {} files", status.inventory_size)),
                Line::from(format!("Last job:  {}", last)),
            ]
        }
        None => vec![Line::from("Waiting for status...")],
    };

    let paragraph =
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(paragraph, area);
}

/// Render the files of the batch being streamed
fn render_batch_table(f: &mut Frame, area: Rect, app: &App) {
    let header_cells = ["#", "File"].iter().map(|h| {
        Cell::from(*h).style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        )
    });
    let header = Row::new(header_cells).height(1).bottom_margin(1);

    let rows: Vec<Row> = if let Some(ref status) = app.status {
        status
            .current_members
            .iter()
            .enumerate()
            .map(|(i, member)| {
                Row::new(vec![
                    Cell::from(format!("{}", i + 1)),
                    Cell::from(file_name(member)),
                ])
            })
            .collect()
    } else {
        vec![]
    };

    let widths = [Constraint::Length(4), Constraint::Min(10)];
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(" Current Batch "));

    f.render_widget(table, area);
}

/// Render job and retention counters
fn render_counters(f: &mut Frame, area: Rect, app: &App) {
    let counters = app
        .status
        .as_ref()
        .map(|s| s.counters.clone())
        .unwrap_or_default();

    let entries = [
        ("Cycles", counters.cycles_completed),
        ("Completed", counters.completed_jobs),
        ("Failed", counters.failed_jobs),
        ("Launch failed", counters.launch_failed_jobs),
        ("Timed out", counters.timed_out_jobs),
        ("Deleted", counters.deleted_files),
        ("Delete errors", counters.deletion_failures),
        ("Signals", counters.signals_received),
    ];
    let rows: Vec<Row> = entries
        .iter()
        .map(|(label, value)| {
            Row::new(vec![Cell::from(*label), Cell::from(format!("{}", value))])
        })
        .collect();

    let widths = [Constraint::Length(14), Constraint::Length(10)];
    let table =
        Table::new(rows, widths).block(Block::default().borders(Borders::ALL).title(" Counters "));

    f.render_widget(table, area);
}

/// Render viewer counts per port
fn render_viewers(f: &mut Frame, area: Rect, app: &App) {
    let rows: Vec<Row> = match app.status {
        Some(ref status) if !status.viewers.is_empty() => status
            .viewers
            .iter()
            .map(|(port, count)| {
                Row::new(vec![
                    Cell::from(format!("{}", port)),
                    Cell::from(format!("{}", count)),
                ])
            })
            .collect(),
        _ => vec![Row::new(vec![Cell::from("-"), Cell::from("-")])],
    };

    let widths = [Constraint::Length(8), Constraint::Length(8)];
    let table = Table::new(rows, widths)
        .header(
            Row::new(vec!["Port", "Viewers"])
                .style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
        )
        .block(Block::default().borders(Borders::ALL).title(" Viewers "));

    f.render_widget(table, area);
}

/// Render CPU and memory usage gauges
fn render_system_gauges(f: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(0),
        ])
        .split(area);

    let (cpu_percent, mem_percent) = if let Some(ref status) = app.status {
        (
            status.system.cpu_usage_percent as f64 / 100.0,
            status.system.mem_usage_percent as f64 / 100.0,
        )
    } else {
        (0.0, 0.0)
    };

    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" CPU "))
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio(cpu_percent.clamp(0.0, 1.0))
        .label(format!("{:.1}%", cpu_percent * 100.0));

    let mem_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" Memory "))
        .gauge_style(Style::default().fg(Color::Magenta))
        .ratio(mem_percent.clamp(0.0, 1.0))
        .label(format!("{:.1}%", mem_percent * 100.0));

    f.render_widget(cpu_gauge, chunks[0]);
    f.render_widget(mem_gauge, chunks[1]);
}

/// Render load averages table
fn render_load_averages(f: &mut Frame, area: Rect, app: &App) {
    let system = app
        .status
        .as_ref()
        .map(|s| s.system.clone())
        .unwrap_or_default();

    let rows = vec![
        Row::new(vec![
            Cell::from("1 min"),
            Cell::from(format!("{:.2}", system.load_avg_1)),
        ]),
        Row::new(vec![
            Cell::from("5 min"),
            Cell::from(format!("{:.2}", system.load_avg_5)),
        ]),
        Row::new(vec![
            Cell::from("15 min"),
            Cell::from(format!("{:.2}", system.load_avg_15)),
        ]),
    ];

    let widths = [Constraint::Length(8), Constraint::Length(10)];
    let table =
        Table::new(rows, widths).block(Block::default().borders(Borders::ALL).title(" Load Avg "));

    f.render_widget(table, area);
}

/// Render finished jobs over time
fn render_jobs_chart(f: &mut Frame, area: Rect, app: &App) {
    let data: Vec<(f64, f64)> = app.job_history.iter().cloned().collect();

    if data.is_empty() {
        let block = Block::default().borders(Borders::ALL).title(" Jobs ");
        f.render_widget(block, area);
        return;
    }

    let min_x = data.first().map(|(x, _)| *x).unwrap_or(0.0);
    let max_x = data.last().map(|(x, _)| *x).unwrap_or(60.0).max(min_x + 1.0);
    let max_y = data.iter().map(|(_, y)| *y).fold(0.0f64, f64::max).max(1.0);

    let datasets = vec![Dataset::default()
        .name("finished")
        .marker(symbols::Marker::Braille)
        .style(Style::default().fg(Color::Green))
        .data(&data)];

    let chart = Chart::new(datasets)
        .block(Block::default().borders(Borders::ALL).title(" Jobs "))
        .x_axis(
            Axis::default()
                .title("Time (s)")
                .style(Style::default().fg(Color::Gray))
                .bounds([min_x, max_x])
                .labels(vec![
                    Span::raw(format!("{:.0}", min_x)),
                    Span::raw(format!("{:.0}", max_x)),
                ]),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, max_y])
                .labels(vec![Span::raw("0"), Span::raw(format!("{:.0}", max_y))]),
        );

    f.render_widget(chart, area);
}

/// Render event log showing recent transitions
fn render_event_log(f: &mut Frame, area: Rect, app: &App) {
    let events: Vec<Line> = app
        .event_log
        .iter()
        .rev()
        .take((area.height as usize).saturating_sub(2))
        .map(|e| Line::from(e.as_str()))
        .collect();

    let paragraph = Paragraph::new(events)
        .block(Block::default().borders(Borders::ALL).title(" Event Log "))
        .wrap(Wrap { trim: true });

    f.render_widget(paragraph, area);
}

/// Render status bar with aggregate stats
fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let status = if let Some(ref status) = app.status {
        let viewers: usize = status.viewers.values().sum();
        format!(
            " {} | Cycle {} | Jobs: {} ok / {} failed | Viewers: {} | Press 'q' to quit ",
            status.state,
            status.cycle,
            status.counters.completed_jobs,
            status.counters.finished_jobs() - status.counters.completed_jobs,
            viewers
        )
    } else {
        format!(" Connecting to {}... | Press 'q' to quit ", app.url)
    };

    let paragraph =
        Paragraph::new(status).style(Style::default().fg(Color::White).bg(Color::DarkGray));

    f.render_widget(paragraph, area);
}

/// Last path component for display
fn file_name(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(path)
        .to_string()
}

// ============================================================================
// Main UI Layout
// ============================================================================

/// Render the complete UI layout
fn ui(f: &mut Frame, app: &App) {
    let size = f.area();

    // Main layout: status bar at bottom, rest for content
    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(size);

    let content_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(main_chunks[0]);

    // Left panel: pipeline, batch, event log
    let left_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(7),
            Constraint::Percentage(40),
            Constraint::Min(0),
        ])
        .split(content_chunks[0]);

    // Right panel: counters + viewers, gauges, load avg, jobs chart
    let right_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(10), // Counters + viewers
            Constraint::Length(6),  // CPU + Memory gauges
            Constraint::Length(5),  // Load averages
            Constraint::Min(0),     // Jobs chart
        ])
        .split(content_chunks[1]);

    let top_right = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(right_chunks[0]);

    render_pipeline(f, left_chunks[0], app);
    render_batch_table(f, left_chunks[1], app);
    render_event_log(f, left_chunks[2], app);
    render_counters(f, top_right[0], app);
    render_viewers(f, top_right[1], app);
    render_system_gauges(f, right_chunks[1], app);
    render_load_averages(f, right_chunks[2], app);
    render_jobs_chart(f, right_chunks[3], app);
    render_status_bar(f, main_chunks[1], app);
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> io::Result<()> {
    let args = Args::parse();

    // Initialize terminal
    let mut terminal = setup_terminal()?;

    // Create app state
    let mut app = App::new(args.url);
    app.log_event("ltop started".to_string());

    // Run the main loop
    let result = run_app(&mut terminal, &mut app).await;

    // Restore terminal
    restore_terminal(&mut terminal)?;

    result
}

/// Main application loop
async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
) -> io::Result<()> {
    let poll_interval = Duration::from_millis(POLL_INTERVAL_MS);
    let mut last_fetch: Option<Instant> = None;

    loop {
        if last_fetch.map_or(true, |t| t.elapsed() >= poll_interval) {
            app.fetch_status().await;
            last_fetch = Some(Instant::now());
        }

        terminal.draw(|f| ui(f, app))?;

        // Short timeout keeps redraws frequent
        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => {
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
