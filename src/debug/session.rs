//! Engine-side debugger session
//!
//! A small line-oriented command set that drives the transport from the
//! interpreter's debugger hook. Not a full debugger protocol: no
//! breakpoints, no variable inspection.
//!
//! Client -> engine, one command per line:
//!
//! | command              | effect                               |
//! |----------------------|--------------------------------------|
//! | `pause`              | stop before the next statement       |
//! | `resume`/`continue`  | run freely                           |
//! | `step`               | run one statement, then stop again   |
//! | `detach`             | end the session, close the connection|
//!
//! Engine -> client notifications: `attached`, `paused <source>:<line>`,
//! `running`, `finished`, `detached`, `error <message>`.
//!
//! While running, the session only peeks at the connection before each
//! statement, so an idle debugger costs one zero-timeout poll per step.
//! While paused it blocks in `read` until the next command arrives.

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::DebugChannel;

const TOPIC: &str = "debug.session";

const READ_CHUNK: usize = 256;

/// Unterminated input longer than this is discarded
const MAX_LINE_LEN: usize = 4096;

/// Commands understood by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Pause,
    Resume,
    Step,
    Detach,
}

impl SessionCommand {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "pause" => Some(SessionCommand::Pause),
            "resume" | "continue" => Some(SessionCommand::Resume),
            "step" => Some(SessionCommand::Step),
            "detach" => Some(SessionCommand::Detach),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Running,
    Paused,
    /// Pause at the next statement
    Stepping,
}

/// One debugger client talking to one engine
pub struct DebugSession {
    channel: Box<dyn DebugChannel>,
    mode: Mode,
    pending: Vec<u8>,
    attached: bool,
}

impl DebugSession {
    pub fn new(channel: Box<dyn DebugChannel>) -> Self {
        Self {
            channel,
            mode: Mode::Running,
            pending: Vec::new(),
            attached: true,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn is_paused(&self) -> bool {
        self.mode == Mode::Paused
    }

    /// Hook invoked before each statement
    ///
    /// Returns `false` once the session is over (client detached or the
    /// connection dropped); the interpreter then carries on without it.
    pub fn on_step(
        &mut self,
        source: Option<&str>,
        line: Option<usize>,
    ) -> bool {
        if !self.attached {
            return false;
        }
        if self.mode == Mode::Stepping {
            self.mode = Mode::Paused;
        }
        if self.mode == Mode::Running {
            self.poll_commands();
        }
        if self.attached && self.mode == Mode::Paused {
            self.send(&format!("paused {}", location(source, line)));
            self.wait_while_paused();
        }
        self.attached
    }

    /// Hook invoked when a script run completes
    pub fn on_finish(&mut self) {
        if self.attached {
            self.send("finished");
        }
    }

    /// Say goodbye and stop talking to the client
    pub fn close(&mut self) {
        if self.attached {
            self.send("detached");
            self.attached = false;
            info!(topic = TOPIC, "debugger detached");
        }
    }

    pub(crate) fn send(
        &mut self,
        message: &str,
    ) {
        let line = format!("{message}\n");
        let bytes = line.as_bytes();
        let mut offset = 0;
        while self.attached && offset < bytes.len() {
            let written = self.channel.write(&bytes[offset..]);
            if written == 0 {
                self.connection_lost();
                return;
            }
            offset += written;
        }
    }

    fn poll_commands(&mut self) {
        let mut chunk = [0u8; READ_CHUNK];
        while self.attached && self.mode == Mode::Running && self.channel.peek() == 1 {
            let got = self.channel.read(&mut chunk);
            if got == 0 {
                self.connection_lost();
                return;
            }
            self.pending.extend_from_slice(&chunk[..got]);
            self.apply_buffered();
        }
    }

    /// Apply buffered commands while still running; stops at the first one
    /// that changes the mode so the rest is handled at the pause point.
    fn apply_buffered(&mut self) {
        while self.attached && self.mode == Mode::Running {
            match self.next_command() {
                Some(command) => self.apply(command),
                None => break,
            }
        }
    }

    fn wait_while_paused(&mut self) {
        let mut chunk = [0u8; READ_CHUNK];
        while self.attached && self.mode == Mode::Paused {
            if let Some(command) = self.next_command() {
                self.apply(command);
                continue;
            }
            let got = self.channel.read(&mut chunk);
            if got == 0 {
                self.connection_lost();
                return;
            }
            self.pending.extend_from_slice(&chunk[..got]);
        }
    }

    /// Next complete, recognised command line from the buffer
    fn next_command(&mut self) -> Option<SessionCommand> {
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match SessionCommand::parse(line) {
                Some(command) => return Some(command),
                None => {
                    warn!(topic = TOPIC, command = %line, "unknown debugger command");
                    self.send(&format!("error unknown command: {line}"));
                }
            }
        }
        if self.pending.len() > MAX_LINE_LEN {
            warn!(topic = TOPIC, len = self.pending.len(), "discarding oversized debugger input");
            self.pending.clear();
        }
        None
    }

    fn apply(
        &mut self,
        command: SessionCommand,
    ) {
        debug!(topic = TOPIC, ?command, "debugger command");
        match command {
            SessionCommand::Pause => self.mode = Mode::Paused,
            SessionCommand::Resume => {
                let was_paused = self.mode == Mode::Paused;
                self.mode = Mode::Running;
                if was_paused {
                    self.send("running");
                }
            }
            SessionCommand::Step => self.mode = Mode::Stepping,
            SessionCommand::Detach => self.close(),
        }
    }

    fn connection_lost(&mut self) {
        if self.attached {
            self.attached = false;
            info!(topic = TOPIC, "debugger connection lost, continuing without debugger");
        }
    }
}

impl std::fmt::Debug for DebugSession {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("DebugSession")
            .field("mode", &self.mode)
            .field("attached", &self.attached)
            .field("pending", &self.pending.len())
            .finish()
    }
}

fn location(
    source: Option<&str>,
    line: Option<usize>,
) -> String {
    let source = source.filter(|s| !s.is_empty()).unwrap_or("<script>");
    format!("{source}:{}", line.unwrap_or(0))
}

/// Attach point between the interpreter's debugger callback and a session
///
/// The interpreter holds the hook from construction on; a session is
/// plugged in once the debugger client has connected and removed on
/// detach. Dropping the session drops its channel, which closes the
/// connection.
#[derive(Debug, Default)]
pub struct DebugHook {
    session: Mutex<Option<DebugSession>>,
}

impl DebugHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session over `channel`, replacing any previous one
    pub fn attach(
        &self,
        channel: Box<dyn DebugChannel>,
    ) {
        let mut session = DebugSession::new(channel);
        session.send("attached");
        let previous = self.session.lock().replace(session);
        if let Some(mut previous) = previous {
            previous.close();
        }
    }

    /// End the current session; returns whether one was attached
    pub fn detach(&self) -> bool {
        let session = self.session.lock().take();
        match session {
            Some(mut session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|session| session.is_attached())
    }

    /// Returns whether the interpreter should keep stepping statement by
    /// statement
    pub fn on_step(
        &self,
        source: Option<&str>,
        line: Option<usize>,
    ) -> bool {
        let mut slot = self.session.lock();
        let Some(session) = slot.as_mut() else {
            return false;
        };
        if session.on_step(source, line) {
            return true;
        }
        slot.take();
        false
    }

    pub fn on_finish(&self) {
        if let Some(session) = self.session.lock().as_mut() {
            session.on_finish();
        }
    }
}
