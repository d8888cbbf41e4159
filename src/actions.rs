use crossterm::event::KeyEvent;

/// Actions that can be dispatched through the application
#[derive(Debug, Clone)]
pub enum Action {
    /// A key was pressed
    KeyPress(KeyEvent),
    /// Attach to a session
    AttachSession(String),
    /// Run an activity scan now instead of waiting for the timer
    RescanNow,
    /// Kill every session belonging to a workspace
    ReclaimWorkspace(String),
}
