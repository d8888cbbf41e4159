use std::collections::BTreeSet;

use anyhow::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph},
    Frame,
};

use agent_deck::coordinator::ScanRole;
use agent_deck::events::DeckEvent;
use agent_deck::facts::{TabStatus, Workspace};
use agent_deck::runtime::Deck;

use crate::actions::Action;

pub struct Theme {
    pub fg: Color,
    pub accent: Color,
    pub dim: Color,
    pub success: Color,
    pub warning: Color,
    pub error: Color,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            fg: Color::Rgb(220, 220, 220),
            accent: Color::Rgb(217, 119, 87),
            dim: Color::Rgb(100, 100, 100),
            success: Color::Rgb(80, 200, 120),
            warning: Color::Rgb(255, 193, 7),
            error: Color::Rgb(220, 53, 69),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Confirming,
}

/// Main application state
pub struct App {
    /// Last copy of the deck's workspaces
    pub workspaces: Vec<Workspace>,
    pub active: BTreeSet<String>,
    pub role: Option<ScanRole>,
    pub epoch: u64,
    /// Summary of the most recent reclaim, kept after the message clears
    pub last_reclaim: Option<String>,
    pub list_state: ListState,
    /// Current message to display (info or error)
    pub message: Option<String>,
    pub theme: Theme,
    pub input_mode: InputMode,
    pub pending_actions: Vec<Action>,
}

impl App {
    pub fn new() -> Self {
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            workspaces: Vec::new(),
            active: BTreeSet::new(),
            role: None,
            epoch: 0,
            last_reclaim: None,
            list_state,
            message: None,
            theme: Theme::default(),
            input_mode: InputMode::Normal,
            pending_actions: Vec::new(),
        }
    }

    /// Copy what the dashboard shows out of the deck
    pub fn sync(&mut self, deck: &Deck) {
        if deck.workspaces() != self.workspaces.as_slice() {
            self.workspaces = deck.workspaces().to_vec();
        }
        self.active.clone_from(deck.active_workspaces());
        self.role = deck.role();
        self.epoch = deck.epoch();

        match self.list_state.selected() {
            Some(selected) if selected >= self.workspaces.len() && !self.workspaces.is_empty() => {
                self.list_state.select(Some(self.workspaces.len() - 1));
            }
            None if !self.workspaces.is_empty() => self.list_state.select(Some(0)),
            _ => {}
        }
    }

    pub fn selected_workspace(&self) -> Option<&Workspace> {
        self.list_state
            .selected()
            .and_then(|i| self.workspaces.get(i))
    }

    /// Take pending actions (drains the queue)
    pub fn take_pending_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.pending_actions)
    }

    /// Handle an action and return whether to quit
    pub fn handle_action(&mut self, action: Action) -> Result<bool> {
        match action {
            Action::KeyPress(key) => self.handle_key(key),
            _ => Ok(false),
        }
    }

    pub fn on_event(&mut self, event: &DeckEvent) {
        match event {
            DeckEvent::TabStopped { session_name, .. } => {
                self.message = Some(format!("Session '{}' exited", session_name));
            }
            DeckEvent::SessionsReclaimed { count, reason } => {
                let plural = if *count == 1 { "" } else { "s" };
                let summary = format!("Reclaimed {} {} session{}", count, reason, plural);
                self.last_reclaim = Some(summary.clone());
                self.message = Some(summary);
            }
            DeckEvent::RoleChanged { role, epoch } => {
                self.message = Some(format!("Scanning as {} (epoch {})", role, epoch));
            }
            DeckEvent::ActiveWorkspacesChanged(_) => {}
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> Result<bool> {
        if self.message.is_some() && self.input_mode == InputMode::Normal {
            self.message = None;
        }

        match self.input_mode {
            InputMode::Normal => self.handle_normal_key(key),
            InputMode::Confirming => self.handle_confirming_key(key),
        }
    }

    fn handle_normal_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Char('q') => return Ok(true),
            KeyCode::Char('j') | KeyCode::Down => self.next_workspace(),
            KeyCode::Char('k') | KeyCode::Up => self.previous_workspace(),
            KeyCode::Enter => {
                let session = self.selected_workspace().and_then(|ws| {
                    ws.tabs
                        .iter()
                        .find(|tab| tab.status == TabStatus::Running)
                        .map(|tab| tab.session_name.clone())
                });
                match session {
                    Some(name) => self.pending_actions.push(Action::AttachSession(name)),
                    None if self.selected_workspace().is_some() => {
                        self.message = Some("No running tab in this workspace".to_string());
                    }
                    None => {}
                }
            }
            KeyCode::Char('r') => self.pending_actions.push(Action::RescanNow),
            KeyCode::Char('x') => {
                if self.selected_workspace().is_some() {
                    self.input_mode = InputMode::Confirming;
                }
            }
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                return Ok(true);
            }
            _ => {}
        }
        Ok(false)
    }

    fn handle_confirming_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Char('y') | KeyCode::Char('Y') => {
                if let Some(ws) = self.selected_workspace() {
                    self.pending_actions
                        .push(Action::ReclaimWorkspace(ws.id.clone()));
                }
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                self.input_mode = InputMode::Normal;
            }
            _ => {}
        }
        Ok(false)
    }

    fn next_workspace(&mut self) {
        if self.workspaces.is_empty() {
            return;
        }
        let i = match self.list_state.selected() {
            Some(i) if i + 1 < self.workspaces.len() => i + 1,
            _ => 0,
        };
        self.list_state.select(Some(i));
    }

    fn previous_workspace(&mut self) {
        if self.workspaces.is_empty() {
            return;
        }
        let i = match self.list_state.selected() {
            Some(0) | None => self.workspaces.len() - 1,
            Some(i) => i - 1,
        };
        self.list_state.select(Some(i));
    }

    pub fn render(&mut self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3), // Header
                Constraint::Min(0),    // Main content
                Constraint::Length(3), // Footer/status
            ])
            .split(frame.area());

        self.render_header(frame, chunks[0]);
        self.render_main(frame, chunks[1]);
        self.render_footer(frame, chunks[2]);

        if self.input_mode == InputMode::Confirming {
            self.render_confirm_dialog(frame);
        }
    }

    fn render_header(&self, frame: &mut Frame, area: Rect) {
        let role = match self.role {
            Some(role) => format!("│ {} · epoch {} ", role, self.epoch),
            None => "│ discovering… ".to_string(),
        };
        let title = Paragraph::new(Line::from(vec![
            Span::styled(
                " Agent Deck ",
                Style::default()
                    .fg(self.theme.accent)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(role, Style::default().fg(self.theme.dim)),
            Span::styled(
                format!("│ {} active ", self.active.len()),
                Style::default().fg(self.theme.warning),
            ),
            Span::styled(
                self.last_reclaim
                    .as_deref()
                    .map(|summary| format!("│ {}", summary))
                    .unwrap_or_default(),
                Style::default().fg(self.theme.dim),
            ),
        ]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(title, area);
    }

    fn render_main(&mut self, frame: &mut Frame, area: Rect) {
        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
            .split(area);

        self.render_workspace_list(frame, chunks[0]);
        self.render_detail_pane(frame, chunks[1]);
    }

    fn render_workspace_list(&mut self, frame: &mut Frame, area: Rect) {
        let items: Vec<ListItem> = if self.workspaces.is_empty() {
            vec![ListItem::new(Line::from(Span::styled(
                "  No workspaces registered.",
                Style::default().fg(self.theme.dim),
            )))]
        } else {
            self.workspaces
                .iter()
                .map(|ws| {
                    let marker = if self.active.contains(&ws.id) {
                        Span::styled("● ", Style::default().fg(self.theme.warning))
                    } else if ws.tabs.iter().any(|t| t.status == TabStatus::Running) {
                        Span::styled("● ", Style::default().fg(self.theme.success))
                    } else {
                        Span::styled("○ ", Style::default().fg(self.theme.dim))
                    };
                    let name = Span::styled(ws.display_name(), Style::default().fg(self.theme.fg));
                    ListItem::new(Line::from(vec![marker, name]))
                })
                .collect()
        };

        let list = List::new(items)
            .block(
                Block::default()
                    .title(" Workspaces ")
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(self.theme.dim)),
            )
            .highlight_style(
                Style::default()
                    .bg(Color::Rgb(50, 50, 50))
                    .add_modifier(Modifier::BOLD),
            )
            .highlight_symbol("▶ ");

        frame.render_stateful_widget(list, area, &mut self.list_state);
    }

    fn render_detail_pane(&self, frame: &mut Frame, area: Rect) {
        let content = if let Some(ws) = self.selected_workspace() {
            let (state, color) = if self.active.contains(&ws.id) {
                ("Working", self.theme.warning)
            } else {
                ("Idle", self.theme.success)
            };
            let mut lines = vec![
                Line::from(vec![
                    Span::styled("Name: ", Style::default().fg(self.theme.dim)),
                    Span::styled(ws.display_name(), Style::default().fg(self.theme.fg)),
                ]),
                Line::from(vec![
                    Span::styled("ID: ", Style::default().fg(self.theme.dim)),
                    Span::styled(&ws.id, Style::default().fg(self.theme.fg)),
                ]),
                Line::from(vec![
                    Span::styled("Status: ", Style::default().fg(self.theme.dim)),
                    Span::styled(state, Style::default().fg(color)),
                ]),
                Line::from(""),
                Line::from(Span::styled("Tabs:", Style::default().fg(self.theme.dim))),
            ];
            for tab in &ws.tabs {
                let (icon, color) = match tab.status {
                    TabStatus::Running => ("● ", self.theme.success),
                    TabStatus::Stopped => ("✗ ", self.theme.error),
                };
                let kind = tab.assistant.as_deref().unwrap_or("terminal");
                lines.push(Line::from(vec![
                    Span::styled(format!("  {}", icon), Style::default().fg(color)),
                    Span::styled(&tab.session_name, Style::default().fg(self.theme.fg)),
                    Span::styled(format!("  ({})", kind), Style::default().fg(self.theme.dim)),
                ]));
            }
            lines.push(Line::from(""));
            lines.push(Line::from(Span::styled(
                "Press Enter to attach, 'x' to reclaim sessions",
                Style::default().fg(self.theme.dim),
            )));
            lines
        } else {
            vec![Line::from(Span::styled(
                "No workspace selected",
                Style::default().fg(self.theme.dim),
            ))]
        };

        let detail = Paragraph::new(content).block(
            Block::default()
                .title(" Details ")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(detail, area);
    }

    fn render_footer(&self, frame: &mut Frame, area: Rect) {
        let help_text = " q: Quit │ j/k: Navigate │ Enter: Attach │ r: Rescan │ x: Reclaim ";

        let content = if let Some(ref msg) = self.message {
            let style = if msg.starts_with("Failed") || msg.starts_with("Tmux") {
                Style::default().fg(self.theme.error)
            } else {
                Style::default().fg(self.theme.success)
            };
            Line::from(Span::styled(format!(" {} ", msg), style))
        } else {
            Line::from(Span::styled(help_text, Style::default().fg(self.theme.dim)))
        };

        let footer = Paragraph::new(content).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(footer, area);
    }

    fn render_confirm_dialog(&self, frame: &mut Frame) {
        let area = centered_rect(50, 20, frame.area());

        frame.render_widget(Clear, area);

        let block = Block::default()
            .title(" Reclaim Sessions ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(self.theme.error));

        let inner = block.inner(area);
        frame.render_widget(block, area);

        let name = self
            .selected_workspace()
            .map(|ws| ws.display_name())
            .unwrap_or("unknown");

        let text = vec![
            Line::from(""),
            Line::from(Span::styled(
                format!("Kill every tmux session of '{}'?", name),
                Style::default().fg(self.theme.fg),
            )),
            Line::from(""),
            Line::from(Span::styled(
                "Running agents in this workspace will exit.",
                Style::default().fg(self.theme.warning),
            )),
            Line::from(""),
            Line::from(Span::styled(
                "Press 'y' to confirm, 'n' or Esc to cancel",
                Style::default().fg(self.theme.dim),
            )),
        ];

        frame.render_widget(Paragraph::new(text), inner);
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}
