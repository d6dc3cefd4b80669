use super::*;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::time::{SystemTime, UNIX_EPOCH};

/// Session recording granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub enum SessionRecordLevel {
    /// Disable recording.
    Off,
    /// Record connection events and command outcomes without their output.
    KeyEventsOnly,
    /// Record everything, including captured stdout and stderr.
    #[default]
    Full,
}

/// A single recorded session event.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionRecordEntry {
    pub ts_ms: u128,
    pub event: SessionEvent,
}

/// Options for normalizing JSONL recordings into stable fixtures.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeOptions {
    /// Keep connection established/failed events.
    pub keep_connection_events: bool,
    /// Keep commands that did not succeed.
    pub keep_failed_commands: bool,
    /// Replace timestamps with their position in the normalized output.
    pub renumber_timestamps: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            keep_connection_events: true,
            keep_failed_commands: true,
            renumber_timestamps: false,
        }
    }
}

/// Supported recorded event types.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    ConnectionEstablished {
        target: String,
    },
    ConnectionFailed {
        target: String,
        reason: String,
    },
    /// A command ran to completion. `command` is the command as written by
    /// the caller; the escalation rewrite is never stored.
    CommandOutput {
        target: String,
        command: String,
        #[serde(default)]
        sudo: bool,
        success: bool,
        #[serde(default)]
        exit_status: Option<u32>,
        #[serde(default)]
        exit_signal: Option<String>,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
    },
}

/// In-memory session recorder.
#[derive(Debug, Clone)]
pub struct SessionRecorder {
    level: SessionRecordLevel,
    entries: Arc<Mutex<Vec<SessionRecordEntry>>>,
}

impl SessionRecorder {
    /// Create a recorder with the given level.
    pub fn new(level: SessionRecordLevel) -> Self {
        Self {
            level,
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Current recording level.
    pub fn level(&self) -> SessionRecordLevel {
        self.level
    }

    /// Record an event.
    pub fn record_event(&self, event: SessionEvent) -> Result<(), RemoteError> {
        if self.level == SessionRecordLevel::Off {
            return Ok(());
        }
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| RemoteError::InternalServerError(format!("record lock error: {e}")))?;
        guard.push(SessionRecordEntry {
            ts_ms: now_ms(),
            event,
        });
        Ok(())
    }

    /// Record a finished command. Output is dropped below [`SessionRecordLevel::Full`].
    pub fn record_command(
        &self,
        target: String,
        command: &Command,
        outcome: ExitOutcome,
        stdout: String,
        stderr: String,
    ) -> Result<(), RemoteError> {
        let (stdout, stderr) = match self.level {
            SessionRecordLevel::Full => (stdout, stderr),
            _ => (String::new(), String::new()),
        };
        let (exit_status, exit_signal) = match outcome {
            ExitOutcome::Code(code) => (Some(code), None),
            ExitOutcome::Signal(signal) => (None, Some(signal)),
            ExitOutcome::Missing => (None, None),
        };
        self.record_event(SessionEvent::CommandOutput {
            target,
            command: command.command.clone(),
            sudo: command.sudo,
            success: exit_status == Some(0),
            exit_status,
            exit_signal,
            stdout,
            stderr,
        })
    }

    /// Snapshot all records.
    pub fn entries(&self) -> Result<Vec<SessionRecordEntry>, RemoteError> {
        let guard = self
            .entries
            .lock()
            .map_err(|e| RemoteError::InternalServerError(format!("record lock error: {e}")))?;
        Ok(guard.clone())
    }

    /// Clears all recorded events.
    pub fn clear(&self) -> Result<(), RemoteError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| RemoteError::InternalServerError(format!("record lock error: {e}")))?;
        guard.clear();
        Ok(())
    }

    /// Export records as JSONL.
    pub fn to_jsonl(&self) -> Result<String, RemoteError> {
        let entries = self.entries()?;
        let mut lines = Vec::with_capacity(entries.len());
        for entry in entries {
            let line = serde_json::to_string(&entry).map_err(|e| {
                RemoteError::InternalServerError(format!("record encode error: {e}"))
            })?;
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }

    /// Restore recorder from JSONL lines.
    pub fn from_jsonl(jsonl: &str) -> Result<Self, RemoteError> {
        let mut parsed = Vec::new();
        for line in jsonl.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: SessionRecordEntry = serde_json::from_str(line).map_err(|e| {
                RemoteError::InternalServerError(format!("record decode error: {e}"))
            })?;
            parsed.push(entry);
        }

        Ok(Self {
            level: SessionRecordLevel::Full,
            entries: Arc::new(Mutex::new(parsed)),
        })
    }

    /// Normalize JSONL recording content into a stable fixture representation.
    ///
    /// Events are sorted by timestamp, keeping recording order for ties, and
    /// filtered according to `options`.
    pub fn normalize_jsonl(jsonl: &str, options: NormalizeOptions) -> Result<String, RemoteError> {
        let recorder = Self::from_jsonl(jsonl)?;
        let mut indexed = recorder
            .entries()?
            .into_iter()
            .enumerate()
            .collect::<Vec<(usize, SessionRecordEntry)>>();

        indexed
            .sort_by(|(idx_a, a), (idx_b, b)| a.ts_ms.cmp(&b.ts_ms).then_with(|| idx_a.cmp(idx_b)));

        let mut filtered = indexed
            .into_iter()
            .filter_map(|(_, entry)| match &entry.event {
                SessionEvent::ConnectionEstablished { .. } | SessionEvent::ConnectionFailed { .. }
                    if !options.keep_connection_events =>
                {
                    None
                }
                SessionEvent::CommandOutput { success: false, .. }
                    if !options.keep_failed_commands =>
                {
                    None
                }
                _ => Some(entry),
            })
            .collect::<Vec<_>>();

        if options.renumber_timestamps {
            for (idx, entry) in filtered.iter_mut().enumerate() {
                entry.ts_ms = idx as u128 + 1;
            }
        }

        let normalized = SessionRecorder {
            level: SessionRecordLevel::Full,
            entries: Arc::new(Mutex::new(filtered)),
        };
        normalized.to_jsonl()
    }
}

impl Default for SessionRecorder {
    fn default() -> Self {
        Self::new(SessionRecordLevel::Full)
    }
}

/// A command outcome taken from a transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedCommand {
    pub command: String,
    pub outcome: ExitOutcome,
    pub stdout: String,
    pub stderr: String,
}

/// Offline replayer backed by session recording data.
///
/// Commands are consumed in transcript order; clones share one cursor. The
/// replayer also implements [`Dial`], so a
/// `ConnectionManager<SessionReplayer>` runs against a transcript instead of
/// a live host.
#[derive(Debug, Clone)]
pub struct SessionReplayer {
    entries: Arc<Vec<SessionRecordEntry>>,
    cursor: Arc<Mutex<usize>>,
}

impl SessionReplayer {
    /// Build a replayer from a recorder snapshot.
    pub fn from_recorder(recorder: &SessionRecorder) -> Self {
        let entries = recorder.entries().unwrap_or_default();
        Self {
            entries: Arc::new(entries),
            cursor: Arc::new(Mutex::new(0)),
        }
    }

    /// Build a replayer from JSONL recording data.
    pub fn from_jsonl(jsonl: &str) -> Result<Self, RemoteError> {
        let recorder = SessionRecorder::from_jsonl(jsonl)?;
        Ok(Self::from_recorder(&recorder))
    }

    /// Target of the first successful connection in the transcript.
    pub fn initial_target(&self) -> Option<&str> {
        self.entries.iter().find_map(|entry| match &entry.event {
            SessionEvent::ConnectionEstablished { target } => Some(target.as_str()),
            _ => None,
        })
    }

    /// Commands not yet consumed.
    pub fn remaining(&self) -> usize {
        let cursor = self.cursor.lock().map(|c| *c).unwrap_or(self.entries.len());
        self.entries[cursor.min(self.entries.len())..]
            .iter()
            .filter(|entry| matches!(entry.event, SessionEvent::CommandOutput { .. }))
            .count()
    }

    /// Replay the next recorded outcome for `command`.
    ///
    /// `command` is either the command as recorded or, for entries recorded
    /// with `sudo`, its escalated form. Entries for other commands before the
    /// match are skipped.
    pub fn replay_next(&self, command: &str) -> Result<ReplayedCommand, RemoteError> {
        let mut cursor = self
            .cursor
            .lock()
            .map_err(|e| RemoteError::InternalServerError(format!("replay lock error: {e}")))?;

        while *cursor < self.entries.len() {
            let entry = &self.entries[*cursor];
            *cursor += 1;

            if let SessionEvent::CommandOutput {
                command: recorded,
                sudo,
                exit_status,
                exit_signal,
                stdout,
                stderr,
                ..
            } = &entry.event
            {
                if !replay_matches(recorded, *sudo, command) {
                    continue;
                }
                let outcome = match (exit_status, exit_signal) {
                    (Some(code), _) => ExitOutcome::Code(*code),
                    (None, Some(signal)) => ExitOutcome::Signal(signal.clone()),
                    (None, None) => ExitOutcome::Missing,
                };
                return Ok(ReplayedCommand {
                    command: recorded.clone(),
                    outcome,
                    stdout: stdout.clone(),
                    stderr: stderr.clone(),
                });
            }
        }

        Err(RemoteError::ReplayMismatchError(format!(
            "no replayable output found for command '{command}'"
        )))
    }
}

fn replay_matches(recorded: &str, sudo: bool, command: &str) -> bool {
    if recorded == command {
        return true;
    }
    sudo && (command == format!("sudo {recorded}")
        || (command.contains("sudo --prompt='' --stdin")
            && command.ends_with(&format!("sh -c \"{recorded}\""))))
}

impl Dial for SessionReplayer {
    type Connection = ReplayConnection;

    async fn dial(&self, target: &TargetHandle) -> Result<ReplayConnection, RemoteError> {
        let name = target.name();
        for entry in self.entries.iter() {
            match &entry.event {
                SessionEvent::ConnectionEstablished { target } if *target == name => break,
                SessionEvent::ConnectionFailed { target, reason } if *target == name => {
                    debug!("Replaying failed connection to {name}: {reason}");
                    return Err(RemoteError::InternalServerError(format!(
                        "replayed connection failure: {reason}"
                    )));
                }
                _ => {}
            }
        }
        debug!("Replaying session for {name}");
        Ok(ReplayConnection {
            replayer: self.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// A connection whose commands are answered from a transcript.
pub struct ReplayConnection {
    replayer: SessionReplayer,
    closed: Arc<AtomicBool>,
}

impl RemoteConnection for ReplayConnection {
    type Channel = ReplayChannel;

    async fn open_channel(&self) -> Result<ReplayChannel, RemoteError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RemoteError::ConnectClosedError);
        }
        Ok(ReplayChannel {
            replayer: self.replayer.clone(),
            events: VecDeque::new(),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), RemoteError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One replayed exec channel.
pub struct ReplayChannel {
    replayer: SessionReplayer,
    events: VecDeque<ChannelEvent>,
}

impl ExecChannel for ReplayChannel {
    async fn exec(&mut self, command: &str) -> Result<(), RemoteError> {
        let replayed = self.replayer.replay_next(command)?;
        trace!("Replaying `{}`: {}", replayed.command, replayed.outcome);

        if !replayed.stdout.is_empty() {
            self.events
                .push_back(ChannelEvent::Stdout(replayed.stdout.into_bytes()));
        }
        if !replayed.stderr.is_empty() {
            self.events
                .push_back(ChannelEvent::Stderr(replayed.stderr.into_bytes()));
        }
        self.events.push_back(ChannelEvent::Eof);
        match replayed.outcome {
            ExitOutcome::Code(code) => self.events.push_back(ChannelEvent::ExitStatus(code)),
            ExitOutcome::Signal(signal) => self.events.push_back(ChannelEvent::ExitSignal(signal)),
            ExitOutcome::Missing => {}
        }
        Ok(())
    }

    async fn send_stdin(&mut self, _data: &[u8]) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.pop_front()
    }

    async fn close(&mut self) {
        self.events.clear();
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
