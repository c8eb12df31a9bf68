//! Tasks (recent analytics runs with progress)
//! Leases (forms currently locked by a run)
//! Dead letters (jobs that exhausted their retries)

use std::{
  error::Error,
  io,
  sync::{Arc, mpsc},
  thread,
  time::{Duration, Instant},
};

use anyhow::Result;
use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use surveyflow::config::Config;
use surveyflow::database::setup_database;
use surveyflow::messaging::{RabbitJobQueue, create_rabbit_channel};
use surveyflow::models::{DeadLetterRecord, Lease, Stage, Task, TaskState};
use surveyflow::queue::JobQueue;
use surveyflow::stores::{DeadLetterSink, LeaseLock, PgStore, TaskStore};
use tokio::runtime::Runtime;
use tui::{
  Terminal,
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, Gauge, List, ListItem, Paragraph, Tabs},
};

const RECENT_TASKS: usize = 20;
const DEAD_LETTERS: usize = 20;

#[derive(Clone, Copy)]
enum DashboardTab {
  Tasks,
  Leases,
  DeadLetters,
}

#[derive(Default)]
struct Snapshot {
  tasks: Vec<Task>,
  leases: Vec<Lease>,
  dead_letters: Vec<DeadLetterRecord>,
  depths: Vec<(Stage, u32)>,
}

struct App {
  current_tab: DashboardTab,
  snapshot: Snapshot,
}

impl App {
  fn new() -> Self {
    Self { current_tab: DashboardTab::Tasks, snapshot: Snapshot::default() }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Tasks => DashboardTab::Leases,
      DashboardTab::Leases => DashboardTab::DeadLetters,
      DashboardTab::DeadLetters => DashboardTab::Tasks,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Tasks => DashboardTab::DeadLetters,
      DashboardTab::Leases => DashboardTab::Tasks,
      DashboardTab::DeadLetters => DashboardTab::Leases,
    }
  }
}

async fn fetch_store_state(store: &PgStore) -> Result<Snapshot> {
  Ok(Snapshot {
    tasks: store.recent_tasks(RECENT_TASKS).await?,
    leases: store.list_live().await?,
    dead_letters: store.list(None, DEAD_LETTERS).await?,
    depths: Vec::new(),
  })
}

async fn fetch_queue_depths(queue: &RabbitJobQueue) -> Vec<(Stage, u32)> {
  let mut depths = Vec::new();
  for stage in Stage::ALL {
    depths.push((stage, queue.depth(stage).await.unwrap_or(0)));
  }
  depths
}

fn main() -> Result<(), Box<dyn Error>> {
  let config = Config::from_env()?;
  let rt = Runtime::new()?;
  let store = Arc::new(PgStore::new(rt.block_on(setup_database(&config.database_url))?));
  let channel = rt.block_on(create_rabbit_channel(&config.rabbitmq_url))?;
  let queue = Arc::new(rt.block_on(RabbitJobQueue::declare(channel, "dashboard"))?);

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let (tx, rx) = mpsc::channel::<Snapshot>();
  {
    let store = store.clone();
    let queue = queue.clone();
    thread::spawn(move || {
      let Ok(rt_bg) = Runtime::new() else {
        return;
      };
      loop {
        let mut snapshot = rt_bg.block_on(fetch_store_state(&store)).unwrap_or_default();
        snapshot.depths = rt_bg.block_on(fetch_queue_depths(&queue));
        if tx.send(snapshot).is_err() {
          break;
        }
        thread::sleep(Duration::from_secs(2));
      }
    });
  }

  let mut app = App::new();
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    if let Ok(snapshot) = rx.try_recv() {
      app.snapshot = snapshot;
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate.checked_sub(last_tick.elapsed()).unwrap_or_else(|| Duration::from_secs(0));
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => break,
          KeyCode::Right => app.next_tab(),
          KeyCode::Left => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  Ok(())
}

fn state_color(state: TaskState) -> Color {
  match state {
    TaskState::New | TaskState::Pending => Color::Yellow,
    TaskState::Running => Color::Cyan,
    TaskState::Completed => Color::Green,
    TaskState::Failed => Color::Red,
    TaskState::Canceled => Color::DarkGray,
  }
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(3), Constraint::Length(3)].as_ref())
    .split(f.size());

  let tab_titles = ["Tasks", "Leases", "Dead letters"];
  let tabs = Tabs::new(
    tab_titles.iter().map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow)))).collect(),
  )
  .block(Block::default().borders(Borders::ALL).title("Analytics Pipeline"))
  .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
  .select(match app.current_tab {
    DashboardTab::Tasks => 0,
    DashboardTab::Leases => 1,
    DashboardTab::DeadLetters => 2,
  });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Tasks => render_tasks(f, app, chunks[1]),
    DashboardTab::Leases => render_leases(f, app, chunks[1]),
    DashboardTab::DeadLetters => render_dead_letters(f, app, chunks[1]),
  }

  let depths: Vec<String> =
    app.snapshot.depths.iter().map(|(stage, depth)| format!("{}: {}", stage.queue_name(), depth)).collect();
  let queues = Paragraph::new(if depths.is_empty() { "No queue data".to_string() } else { depths.join(" | ") })
    .block(Block::default().borders(Borders::ALL).title("Pending jobs per stage queue"));
  f.render_widget(queues, chunks[2]);

  let footer = Paragraph::new("←/→: Switch Tabs | q: Quit")
    .style(Style::default().fg(Color::White))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[3]);
}

fn render_tasks<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(65), Constraint::Percentage(35)].as_ref())
    .split(area);

  let items: Vec<ListItem> = app
    .snapshot
    .tasks
    .iter()
    .map(|t| {
      ListItem::new(vec![
        Spans::from(vec![
          Span::styled(format!("{} ", t.task_id), Style::default().add_modifier(Modifier::BOLD)),
          Span::styled(t.state.as_str(), Style::default().fg(state_color(t.state))),
          Span::raw(format!(" {}%", t.progress)),
        ]),
        Spans::from(Span::raw(format!("  form {} | {} | {}", t.resource_id, t.owner_id, t.message))),
      ])
    })
    .collect();
  let tasks = List::new(items).block(Block::default().borders(Borders::ALL).title("Recent runs"));
  f.render_widget(tasks, chunks[0]);

  let running: Vec<&Task> = app.snapshot.tasks.iter().filter(|t| t.state == TaskState::Running).collect();
  let gauge_area = Layout::default()
    .direction(Direction::Vertical)
    .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
    .split(chunks[1]);
  let (label, percent) = match running.first() {
    Some(task) => (format!("{} running, first at {}%", running.len(), task.progress), task.progress as u16),
    None => ("No running analytics".to_string(), 0),
  };
  let gauge = Gauge::default()
    .block(Block::default().borders(Borders::ALL).title("Active run"))
    .gauge_style(Style::default().fg(Color::Cyan))
    .percent(percent.min(100))
    .label(label);
  f.render_widget(gauge, gauge_area[0]);
}

fn render_leases<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app
    .snapshot
    .leases
    .iter()
    .map(|l| {
      ListItem::new(Spans::from(vec![
        Span::styled(format!("{} ", l.resource_key), Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
        Span::raw(format!("task {} | owner {} | expires {}", l.task_id, l.owner_id, l.expires_at.format("%H:%M:%S"))),
      ]))
    })
    .collect();
  let title = format!("Live leases ({})", app.snapshot.leases.len());
  f.render_widget(List::new(items).block(Block::default().borders(Borders::ALL).title(title)), area);
}

fn render_dead_letters<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app
    .snapshot
    .dead_letters
    .iter()
    .map(|d| {
      ListItem::new(vec![
        Spans::from(vec![
          Span::styled(d.failed_at.format("%Y-%m-%d %H:%M:%S").to_string(), Style::default().fg(Color::Red)),
          Span::raw(format!(" {} job {} ({}/{} attempts)", d.original_stage, d.job_id, d.attempts_made, d.max_attempts)),
        ]),
        Spans::from(Span::raw(format!("  task {}: {}", d.task_id, d.failure_reason))),
      ])
    })
    .collect();
  f.render_widget(List::new(items).block(Block::default().borders(Borders::ALL).title("Dead letters")), area);
}
