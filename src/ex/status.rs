use chrono::Local;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

pub const DEFAULT_DATE_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";
pub const DEFAULT_DATE_PREFIX: &str = "[";
pub const DEFAULT_DATE_SUFFIX: &str = "]";

/// Bounded ring of captured output lines, each stamped with the local time.
///
/// Producers are the pipe drain tasks; consumers are the status handlers. Appends beyond the
/// capacity evict the oldest lines, so a slow consumer can never grow the ring.
#[derive(Debug)]
pub struct OutputRing {
    max: usize,
    prefix: String,
    layout: String,
    suffix: String,
    lines: Mutex<Vec<String>>,
}

impl OutputRing {
    pub fn new(max: usize) -> OutputRing {
        OutputRing::with_format(
            max,
            DEFAULT_DATE_PREFIX,
            DEFAULT_DATE_LAYOUT,
            DEFAULT_DATE_SUFFIX,
        )
    }

    pub fn with_format(max: usize, prefix: &str, layout: &str, suffix: &str) -> OutputRing {
        OutputRing {
            max,
            prefix: prefix.to_string(),
            layout: layout.to_string(),
            suffix: suffix.to_string(),
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn append(&self, item: &str) {
        let stamped = format!(
            "{}{}{} {}",
            self.prefix,
            Local::now().format(&self.layout),
            self.suffix,
            item
        );
        let mut lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        lines.push(stamped);
        if lines.len() > self.max {
            let excess = lines.len() - self.max;
            lines.drain(..excess);
        }
    }

    /// Point-in-time copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        lines.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ProcState {
    Stopped = 0,
    Started = 1,
    Stopping = 2,
    Starting = 3,
    Failed = 4,
}

impl ProcState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcState::Stopped => "Stopped",
            ProcState::Started => "Started",
            ProcState::Stopping => "Stopping",
            ProcState::Starting => "Starting",
            ProcState::Failed => "Failed",
        }
    }

    fn from_i32(raw: i32) -> ProcState {
        match raw {
            1 => ProcState::Started,
            2 => ProcState::Stopping,
            3 => ProcState::Starting,
            4 => ProcState::Failed,
            _ => ProcState::Stopped,
        }
    }
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared mutable record of one managed process.
///
/// The wait task, the pipe drain tasks and the control-plane readers all touch this concurrently.
/// `pid`, `exit_code` and `state` are word-sized atomics so status reads never block the wait
/// loop; only the error string takes a lock. State transitions themselves are owned by the
/// process state machine, which guards them with `compare_and_set_state`.
#[derive(Debug)]
pub struct ProcessState {
    pid: AtomicI32,
    code: AtomicI32,
    state: AtomicI32,
    startup_error: Mutex<Option<String>>,
    stdout: OutputRing,
    stderr: OutputRing,
}

impl ProcessState {
    pub fn new(max_lines: usize) -> ProcessState {
        ProcessState::with_format(
            max_lines,
            DEFAULT_DATE_PREFIX,
            DEFAULT_DATE_LAYOUT,
            DEFAULT_DATE_SUFFIX,
        )
    }

    pub fn with_format(max_lines: usize, prefix: &str, layout: &str, suffix: &str) -> ProcessState {
        ProcessState {
            pid: AtomicI32::new(0),
            code: AtomicI32::new(0),
            state: AtomicI32::new(ProcState::Stopped as i32),
            startup_error: Mutex::new(None),
            stdout: OutputRing::with_format(max_lines, prefix, layout, suffix),
            stderr: OutputRing::with_format(max_lines, prefix, layout, suffix),
        }
    }

    pub fn set_pid(&self, pid: i32) {
        self.pid.store(pid, Ordering::SeqCst);
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::SeqCst)
    }

    pub fn set_exit_code(&self, code: i32) {
        self.code.store(code, Ordering::SeqCst);
    }

    pub fn exit_code(&self) -> i32 {
        self.code.load(Ordering::SeqCst)
    }

    pub fn set_state(&self, state: ProcState) {
        self.state.store(state as i32, Ordering::SeqCst);
    }

    pub fn state(&self) -> ProcState {
        ProcState::from_i32(self.state.load(Ordering::SeqCst))
    }

    /// Atomically transition `from` -> `to`. Returns false if another task won the race.
    pub fn compare_and_set_state(&self, from: ProcState, to: ProcState) -> bool {
        self.state
            .compare_exchange(from as i32, to as i32, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn set_error(&self, err: Option<String>) {
        let mut slot = self.startup_error.lock().unwrap_or_else(|p| p.into_inner());
        *slot = err;
    }

    pub fn error(&self) -> Option<String> {
        let slot = self.startup_error.lock().unwrap_or_else(|p| p.into_inner());
        slot.clone()
    }

    pub fn add_stdout(&self, item: &str) {
        self.stdout.append(item);
    }

    pub fn list_stdout(&self) -> Vec<String> {
        self.stdout.snapshot()
    }

    pub fn add_stderr(&self, item: &str) {
        self.stderr.append(item);
    }

    pub fn list_stderr(&self) -> Vec<String> {
        self.stderr.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    #[test]
    fn ring_keeps_only_the_newest_lines_in_order() {
        let ring = OutputRing::new(10);
        for i in 0..100 {
            ring.append(&format!("line {i}"));
        }
        let snap = ring.snapshot();
        assert_eq!(snap.len(), 10);
        for (offset, line) in snap.iter().enumerate() {
            assert!(
                line.ends_with(&format!("line {}", 90 + offset)),
                "unexpected line {line:?}"
            );
        }
    }

    #[test]
    fn ring_below_capacity_returns_everything() {
        let ring = OutputRing::new(500);
        ring.append("only");
        assert_eq!(ring.snapshot().len(), 1);
    }

    #[test]
    fn append_stamps_with_bracketed_local_time() {
        let ring = OutputRing::new(5);
        ring.append("hello");
        let snap = ring.snapshot();
        let line = &snap[0];
        let close = line.find(']').expect("closing bracket");
        assert!(line.starts_with('['));
        let stamp = &line[1..close];
        NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S").expect("parseable stamp");
        assert_eq!(&line[close + 1..], " hello");
    }

    #[test]
    fn snapshot_is_a_copy() {
        let ring = OutputRing::new(5);
        ring.append("a");
        let mut snap = ring.snapshot();
        snap.push("b".to_string());
        assert_eq!(ring.snapshot().len(), 1);
    }

    #[test]
    fn state_cas_guards_the_transition() {
        let st = ProcessState::new(5);
        assert_eq!(st.state(), ProcState::Stopped);
        assert!(st.compare_and_set_state(ProcState::Stopped, ProcState::Starting));
        // Second CAS from Stopped loses: state is already Starting.
        assert!(!st.compare_and_set_state(ProcState::Stopped, ProcState::Starting));
        assert_eq!(st.state(), ProcState::Starting);
    }

    #[test]
    fn error_roundtrip() {
        let st = ProcessState::new(5);
        assert!(st.error().is_none());
        st.set_error(Some("spawn failed".to_string()));
        assert_eq!(st.error().as_deref(), Some("spawn failed"));
        st.set_error(None);
        assert!(st.error().is_none());
    }

    #[test]
    fn state_names_match_the_wire_protocol() {
        assert_eq!(ProcState::Stopped.as_str(), "Stopped");
        assert_eq!(ProcState::Started.as_str(), "Started");
        assert_eq!(ProcState::Stopping.as_str(), "Stopping");
        assert_eq!(ProcState::Starting.as_str(), "Starting");
        assert_eq!(ProcState::Failed.as_str(), "Failed");
    }
}
