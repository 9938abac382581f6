//! TUI that follows a verification run: progress, clean proxies and run counters

use crate::proxy::models::VerificationRecord;
use crate::service::VetterService;
use crate::verify::RunSnapshot;
use crate::Result;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::Line,
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Maximum number of clean proxies kept for display
const MAX_RECENT_RESULTS: usize = 100;

/// How often stored results are re-read
const RESULTS_REFRESH: Duration = Duration::from_secs(1);

pub struct RunMonitor {
    service: Arc<VetterService>,
    snapshot: Option<RunSnapshot>,
    /// Newest last
    results: VecDeque<VerificationRecord>,
    result_count: usize,
    list_state: ListState,
    status_message: String,
    last_refresh: Option<Instant>,
    stop_requested: bool,
    is_complete: bool,
    should_quit: bool,
}

impl RunMonitor {
    pub fn new(service: Arc<VetterService>) -> Self {
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            service,
            snapshot: None,
            results: VecDeque::new(),
            result_count: 0,
            list_state,
            status_message: "Running... Press 's' to stop, 'q' to quit.".to_string(),
            last_refresh: None,
            stop_requested: false,
            is_complete: false,
            should_quit: false,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.run_app(&mut terminal).await;

        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        )?;
        terminal.show_cursor()?;

        result
    }

    async fn run_app<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> Result<()> {
        loop {
            terminal.draw(|f| self.ui(f))?;

            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_input(key.code);
                        if self.should_quit {
                            break;
                        }
                    }
                }
            }

            if self.stop_requested {
                self.stop_requested = false;
                if self.service.stop_run().await {
                    self.status_message = "Run stopped. Press 'q' to quit.".to_string();
                }
            }

            self.update().await?;
        }

        Ok(())
    }

    async fn update(&mut self) -> Result<()> {
        self.snapshot = self.service.snapshot();

        let due = self
            .last_refresh
            .map_or(true, |at| at.elapsed() >= RESULTS_REFRESH);
        if due {
            let records = self.service.results().await?;
            self.result_count = records.len();
            self.results = records
                .into_iter()
                .rev()
                .take(MAX_RECENT_RESULTS)
                .rev()
                .collect();
            self.last_refresh = Some(Instant::now());
        }

        let finished = self.snapshot.as_ref().map_or(true, |s| s.finished);
        if finished && !self.is_complete {
            self.is_complete = true;
            self.status_message = format!(
                "Complete! Clean proxies: {} | Press 'q' to quit",
                self.result_count
            );
        }
        Ok(())
    }

    fn handle_input(&mut self, key: KeyCode) {
        match key {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.should_quit = true;
            }
            KeyCode::Char('s') => {
                if !self.is_complete {
                    self.stop_requested = true;
                    self.status_message = "Stopping run...".to_string();
                }
            }
            KeyCode::Down => {
                let i = match self.list_state.selected() {
                    Some(i) if i + 1 < self.results.len() => i + 1,
                    _ => 0,
                };
                self.list_state.select(Some(i));
            }
            KeyCode::Up => {
                let i = match self.list_state.selected() {
                    Some(0) | None => self.results.len().saturating_sub(1),
                    Some(i) => i - 1,
                };
                self.list_state.select(Some(i));
            }
            _ => {}
        }
    }

    fn ui(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3), // Title
                Constraint::Length(3), // Progress bar
                Constraint::Min(0),    // Results and run details
                Constraint::Length(3), // Status bar
            ])
            .split(f.size());

        let title = Paragraph::new("Proxy Vetter")
            .style(Style::default().fg(Color::Cyan))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(title, chunks[0]);

        let (percent, label) = match &self.snapshot {
            Some(s) => (
                s.percent,
                format!("{}/{} ({}%)", s.total.saturating_sub(s.remaining), s.total, s.percent),
            ),
            None => (100, "no active run".to_string()),
        };
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Progress"))
            .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
            .percent(u16::from(percent))
            .label(label);
        f.render_widget(gauge, chunks[1]);

        let body = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(65), Constraint::Percentage(35)])
            .split(chunks[2]);

        Self::render_results(f, body[0], &self.results, self.result_count, &mut self.list_state);
        Self::render_run_details(f, body[1], self.snapshot.as_ref());

        let status = Paragraph::new(self.status_message.clone())
            .style(if self.is_complete {
                Style::default().fg(Color::Green)
            } else {
                Style::default().fg(Color::Yellow)
            })
            .wrap(Wrap { trim: true })
            .block(Block::default().borders(Borders::ALL).title("Status"));
        f.render_widget(status, chunks[3]);
    }

    fn render_results(
        f: &mut Frame,
        area: Rect,
        results: &VecDeque<VerificationRecord>,
        total_count: usize,
        list_state: &mut ListState,
    ) {
        let items: Vec<ListItem> = results
            .iter()
            .rev() // Show newest first
            .map(|record| {
                let place = [record.city.as_deref(), record.country_code.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(", ");
                let content = format!(
                    "{} [{}] {} {}",
                    record.ip.as_deref().unwrap_or("?"),
                    record.proxy_type.map(|t| t.as_str()).unwrap_or("?"),
                    place,
                    record.isp.as_deref().or(record.organization.as_deref()).unwrap_or("")
                );
                ListItem::new(content).style(Style::default().fg(Color::Green))
            })
            .collect();

        let list = List::new(items)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(format!("Clean Proxies ({})", total_count))
                    .border_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
            )
            .highlight_style(Style::default().bg(Color::DarkGray))
            .highlight_symbol(">> ");

        f.render_stateful_widget(list, area, list_state);
    }

    fn render_run_details(f: &mut Frame, area: Rect, snapshot: Option<&RunSnapshot>) {
        let lines: Vec<Line> = match snapshot {
            Some(s) => vec![
                Line::from(format!("Run:       {}", s.id)),
                Line::from(format!("Strategy:  {}", s.strategy)),
                Line::from(format!("Workers:   {}", s.limit)),
                Line::from(format!("Queued:    {}", s.remaining)),
                Line::from(format!("Requeued:  {}", s.requeued)),
                Line::from(format!("Clean:     {}", s.accepted)),
                Line::from(format!("Rejected:  {}", s.rejected)),
                Line::from(format!("Dropped:   {}", s.dropped)),
                Line::from(format!("Bypass:    {}", s.bypass.as_deref().unwrap_or("direct"))),
            ],
            None => vec![Line::from("No active run")],
        };

        let details = Paragraph::new(lines)
            .wrap(Wrap { trim: false })
            .block(Block::default().borders(Borders::ALL).title("Run"));
        f.render_widget(details, area);
    }
}
