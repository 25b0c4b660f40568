//! Terminal analytics viewer
//!
//! Read-only dashboard over the telemetry database: an aggregate summary for
//! the last 7 days above a table of recent calls. Opens the database in
//! read-only mode and refreshes every couple of seconds; `q` quits.

use crate::config::VERSION;
use crate::telemetry::query::{open_readonly, TelemetryQuery};
use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table},
    Terminal,
};
use serde_json::Value;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

const REFRESH_INTERVAL: Duration = Duration::from_secs(2);

/// Snapshot of everything the viewer renders
struct ViewData {
    performance: Value,
    cache: Value,
    recent: Vec<Value>,
}

impl ViewData {
    fn load(query: &TelemetryQuery) -> Self {
        Self {
            performance: query
                .get_performance_stats(None, None, 7)
                .unwrap_or(Value::Null),
            cache: query.get_cache_analysis_summary(7).unwrap_or(Value::Null),
            recent: query.get_recent_logs(50).unwrap_or_default(),
        }
    }
}

/// Run the viewer until the user quits
pub fn run_viewer(db_path: &Path) -> Result<()> {
    // Read-only so a running gateway keeps exclusive write access
    let query = TelemetryQuery::new(open_readonly(db_path)?);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = event_loop(&mut terminal, &query);

    // Always restore the terminal, even on error
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    query: &TelemetryQuery,
) -> Result<()> {
    let mut data = ViewData::load(query);
    let mut last_refresh = Instant::now();

    loop {
        terminal.draw(|frame| draw(frame, &data))?;

        if event::poll(Duration::from_millis(250))? {
            if let Event::Key(key) = event::read()? {
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                    KeyCode::Char('r') => {
                        data = ViewData::load(query);
                        last_refresh = Instant::now();
                    }
                    _ => {}
                }
            }
        }

        if last_refresh.elapsed() >= REFRESH_INTERVAL {
            data = ViewData::load(query);
            last_refresh = Instant::now();
        }
    }
}

fn draw(frame: &mut ratatui::Frame, data: &ViewData) {
    let [title_area, summary_area, table_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Length(4),
        Constraint::Min(3),
        Constraint::Length(1),
    ])
    .areas(frame.area());

    let title = Line::from(vec![
        Span::styled(
            " crossgate analytics ",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled(format!("v{VERSION}"), Style::default().fg(Color::DarkGray)),
    ]);
    frame.render_widget(Paragraph::new(title), title_area);

    frame.render_widget(summary_widget(data), summary_area);
    frame.render_widget(recent_table(data), table_area);

    let footer = Line::from(Span::styled(
        " q quit · r refresh · aggregates over last 7 days",
        Style::default().fg(Color::DarkGray),
    ));
    frame.render_widget(Paragraph::new(footer), footer_area);
}

fn summary_widget(data: &ViewData) -> Paragraph<'_> {
    let perf = &data.performance;
    let cache = &data.cache;

    let line1 = format!(
        "requests: {}  ok: {}  tokens: {}  cost: ${:.4}",
        fmt_int(&perf["total_requests"]),
        fmt_int(&perf["successful_requests"]),
        fmt_int(&perf["total_tokens"]),
        perf["total_cost_usd"].as_f64().unwrap_or(0.0),
    );
    let line2 = format!(
        "avg ttft: {}ms  avg tpot: {}ms  avg latency: {}ms  throughput: {} tok/s",
        fmt_f64(&perf["avg_ttft_ms"]),
        fmt_f64(&perf["avg_tpot_ms"]),
        fmt_f64(&perf["avg_latency_ms"]),
        fmt_f64(&perf["avg_tokens_per_second"]),
    );
    let line3 = format!(
        "cache predictions: {}  avg error: {}  est hit: {}  actual hit: {}",
        fmt_int(&cache["total_predictions"]),
        fmt_f64(&cache["avg_prediction_error"]),
        fmt_f64(&cache["avg_estimated_hit_rate"]),
        fmt_f64(&cache["avg_actual_hit_rate"]),
    );

    Paragraph::new(vec![
        Line::from(line1),
        Line::from(line2),
        Line::from(line3),
    ])
    .block(Block::default().borders(Borders::ALL).title(" summary "))
}

fn recent_table(data: &ViewData) -> Table<'_> {
    let header = Row::new(vec![
        "time", "model", "provider", "ok", "ttft", "latency", "hit%", "tokens", "cost",
    ])
    .style(Style::default().add_modifier(Modifier::BOLD));

    let rows: Vec<Row> = data
        .recent
        .iter()
        .map(|log| {
            let ok = log["success"].as_bool().unwrap_or(false);
            let style = if ok {
                Style::default()
            } else {
                Style::default().fg(Color::Red)
            };

            let timestamp = log["timestamp"].as_str().unwrap_or("-");
            let time = timestamp.split(' ').nth(1).unwrap_or(timestamp);
            let time = time.split('.').next().unwrap_or(time).to_string();

            Row::new(vec![
                Cell::from(time),
                Cell::from(log["model"].as_str().unwrap_or("-").to_string()),
                Cell::from(log["provider"].as_str().unwrap_or("-").to_string()),
                Cell::from(if ok { "✓" } else { "✗" }),
                Cell::from(fmt_int(&log["estimated_ttft_ms"])),
                Cell::from(fmt_int(&log["estimated_total_latency_ms"])),
                Cell::from(fmt_rate(&log["estimated_cache_hit_rate"])),
                Cell::from(fmt_int(&log["actual_total_tokens"])),
                Cell::from(format!(
                    "{:.4}",
                    log["estimated_cost_usd"].as_f64().unwrap_or(0.0)
                )),
            ])
            .style(style)
        })
        .collect();

    Table::new(
        rows,
        [
            Constraint::Length(8),
            Constraint::Min(20),
            Constraint::Length(10),
            Constraint::Length(2),
            Constraint::Length(6),
            Constraint::Length(8),
            Constraint::Length(5),
            Constraint::Length(7),
            Constraint::Length(7),
        ],
    )
    .header(header)
    .block(Block::default().borders(Borders::ALL).title(" recent calls "))
}

fn fmt_int(value: &Value) -> String {
    value
        .as_i64()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn fmt_f64(value: &Value) -> String {
    value
        .as_f64()
        .map(|v| format!("{v:.1}"))
        .unwrap_or_else(|| "-".to_string())
}

fn fmt_rate(value: &Value) -> String {
    value
        .as_f64()
        .map(|v| format!("{:.0}", v * 100.0))
        .unwrap_or_else(|| "-".to_string())
}
