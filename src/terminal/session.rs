//! One remote shell session.

use super::protocol::SessionId;
use super::transcript::Transcript;

/// Visible marker appended when the remote process exits.
pub const EXIT_MARKER: &str = "\r\n[process exited]\r\n";

/// Lifecycle of a session.
///
/// `Created → Starting → Ready → Active → Closing → Closed`. An exited
/// session is `Closed` but stays listed until its tab is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered locally; nothing sent yet.
    Created,
    /// `terminal:start` sent.
    Starting,
    /// Server acknowledged; working directory injected.
    Ready,
    /// Exchanging data.
    Active,
    /// Local close in progress.
    Closing,
    /// Exited or closed.
    Closed,
}

impl SessionState {
    /// Whether output and input still apply.
    pub fn is_open(self) -> bool {
        !matches!(self, Self::Closing | Self::Closed)
    }
}

/// Per-session record.
#[derive(Debug, Clone)]
pub struct TerminalSession {
    id: SessionId,
    title: String,
    working_directory: Option<String>,
    state: SessionState,
    transcript: Transcript,
    geometry: Option<(u16, u16)>,
    cd_sent: bool,
}

impl TerminalSession {
    pub(crate) fn new(
        id: SessionId,
        title: String,
        working_directory: Option<String>,
        scrollback_bytes: usize,
    ) -> Self {
        Self {
            id,
            title,
            working_directory,
            state: SessionState::Created,
            transcript: Transcript::new(scrollback_bytes),
            geometry: None,
            cd_sent: false,
        }
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Tab title.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Directory the shell is moved into once ready.
    pub fn working_directory(&self) -> Option<&str> {
        self.working_directory.as_deref()
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Output received so far.
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Last geometry sent to the server as `(rows, cols)`.
    pub fn geometry(&self) -> Option<(u16, u16)> {
        self.geometry
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub(crate) fn set_geometry(&mut self, rows: u16, cols: u16) {
        self.geometry = Some((rows, cols));
    }

    pub(crate) fn append(&mut self, data: &[u8]) {
        self.transcript.push(data);
    }

    /// Mark exited. Returns `false` if it was already closed.
    pub(crate) fn mark_exited(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.transcript.push(EXIT_MARKER.as_bytes());
        self.state = SessionState::Closed;
        true
    }

    /// Take the pending `cd` target; yields it at most once.
    pub(crate) fn take_cd(&mut self) -> Option<String> {
        if self.cd_sent {
            return None;
        }
        self.cd_sent = true;
        self.working_directory.clone().filter(|dir| !dir.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cd_is_taken_once() {
        let mut s = TerminalSession::new(1, "web".into(), Some("/srv".into()), 64);
        assert_eq!(s.take_cd().as_deref(), Some("/srv"));
        assert_eq!(s.take_cd(), None);
    }

    #[test]
    fn test_exit_marks_closed_once() {
        let mut s = TerminalSession::new(1, "web".into(), None, 64);
        s.set_state(SessionState::Active);
        assert!(s.mark_exited());
        assert!(!s.mark_exited());
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(s.transcript().to_string_lossy(), EXIT_MARKER);
    }
}
