//! # Ring output buffer: bounded capture of a service's output.
//!
//! One ring per service captures stdout and stderr of whatever child process
//! is currently attached, line by line, into a single size-bounded window.
//! Lines are assigned increasing global indices as they arrive; the indices
//! keep growing across evictions and process restarts, so a reader can
//! resume from where it left off with `(index, pid)` and detect that "its"
//! process has finished and a different one now owns the stream.
//!
//! ## Architecture
//! ```text
//! follow_new_process(pid, stdout, stderr)
//!     ├──► scan task (stdout) ──┐        append one line at a time;
//!     ├──► scan task (stderr) ──┤──────► a scanner whose pid is no longer
//!     └──► completion waiter ◄──┘        current drops its line and exits
//!             │
//!             └──► both drained: release stream ownership, signal done
//! ```
//!
//! ## Rules
//! - Line indices are monotonic, non-decreasing; `index_offset` advances by
//!   one per evicted line.
//! - A line admitted under pid P stays attributed to P forever.
//! - Attaching a new process cancels the previous scanners at their next
//!   line read; already-captured lines are retained.
//! - Total retained bytes ≤ `max_bytes` + one line (the window never drops
//!   its only line).
//! - The lock is held only to append/evict or copy out lines, never across
//!   stream reads.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::futures::Notified;
use tokio::sync::{oneshot, Notify, RwLock};

/// Retained-output budget per service.
pub const MAX_OUTPUT_BYTES: usize = 100 * 1024 * 1024;

/// One captured line of service output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    /// Pid of the process that produced the line.
    pub pid: u32,
    /// True if the line came from stderr.
    #[serde(default)]
    pub stderr: bool,
    pub text: String,
}

#[derive(Debug, Default)]
struct RingState {
    lines: VecDeque<OutputLine>,
    /// Global index of `lines[0]`.
    index_offset: u64,
    /// Sum of `text` lengths currently retained.
    bytes: usize,
    /// Pid of the attached process, or 0 when no process owns the stream.
    current_pid: u32,
}

/// A chunk of output returned by [`OutputRing::get`].
#[derive(Debug, Clone)]
pub struct TailChunk {
    pub lines: Vec<OutputLine>,
    /// True if a specific pid was requested and that process has produced
    /// its last line (a different process, or none, now owns the stream).
    pub eof: bool,
    /// Global index one past the last returned line.
    pub next_index: u64,
    /// Pid of the first line beyond the returned range, or the current
    /// stream owner if none exists.
    pub next_pid: u32,
}

/// Bounded, index-addressable store of recent output lines.
pub struct OutputRing {
    max_bytes: usize,
    state: RwLock<RingState>,
    appended: Notify,
}

impl OutputRing {
    pub fn new() -> OutputRing {
        OutputRing::with_max_bytes(MAX_OUTPUT_BYTES)
    }

    pub fn with_max_bytes(max_bytes: usize) -> OutputRing {
        OutputRing {
            max_bytes,
            state: RwLock::new(RingState::default()),
            appended: Notify::new(),
        }
    }

    /// Attaches the ring to a new process and starts draining its streams.
    ///
    /// Any previous attachment is cancelled: its scanners notice the pid
    /// change at their next line and exit. The returned receiver resolves
    /// once both of the new process's streams are fully drained.
    pub async fn follow_new_process<O, E>(
        self: Arc<Self>,
        pid: u32,
        stdout: O,
        stderr: E,
    ) -> oneshot::Receiver<()>
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        {
            let mut st = self.state.write().await;
            st.current_pid = pid;
        }

        let out = tokio::spawn(scan_lines(Arc::clone(&self), pid, stdout, false));
        let err = tokio::spawn(scan_lines(Arc::clone(&self), pid, stderr, true));

        let (done_tx, done_rx) = oneshot::channel();
        let ring = self;
        tokio::spawn(async move {
            let _ = out.await;
            let _ = err.await;
            {
                let mut st = ring.state.write().await;
                // Release stream ownership unless a newer process attached
                // while we were draining.
                if st.current_pid == pid {
                    st.current_pid = 0;
                }
            }
            // Wake followers so they can observe EOF.
            ring.appended.notify_waiters();
            let _ = done_tx.send(());
        });

        done_rx
    }

    /// Reads lines by global index.
    ///
    /// - `index >= 0`: start at that global index, clamped forward if the
    ///   window has advanced past it.
    /// - `index < 0`: start `|index|` lines before the end; when `pid` is a
    ///   process that no longer owns the stream, "the end" is just past the
    ///   last line attributed to it.
    /// - `pid != 0` restricts the scan to that process's lines; the scan
    ///   stops at the first line from anyone else.
    /// - `max == 0` means unlimited.
    pub async fn get(&self, index: i64, pid: u32, max: usize) -> TailChunk {
        let st = self.state.read().await;
        let len = st.lines.len();

        let start = if index >= 0 {
            let idx = index as u64;
            if idx <= st.index_offset {
                0
            } else {
                ((idx - st.index_offset) as usize).min(len)
            }
        } else {
            let back = index.unsigned_abs() as usize;
            let end = if pid != 0 && pid != st.current_pid {
                match st.lines.iter().rposition(|l| l.pid == pid) {
                    Some(last) => last + 1,
                    None => 0,
                }
            } else {
                len
            };
            end.saturating_sub(back)
        };

        let mut lines = Vec::new();
        let mut at = start;
        while at < len {
            let line = &st.lines[at];
            if pid != 0 && line.pid != pid {
                break;
            }
            if max != 0 && lines.len() >= max {
                break;
            }
            lines.push(line.clone());
            at += 1;
        }

        let next_index = st.index_offset + at as u64;
        let next_pid = if at < len {
            st.lines[at].pid
        } else {
            st.current_pid
        };
        let eof = pid != 0 && pid != next_pid;

        TailChunk {
            lines,
            eof,
            next_index,
            next_pid,
        }
    }

    /// Copies out the last `n` lines, regardless of pid.
    pub async fn tail_lines(&self, n: usize) -> Vec<OutputLine> {
        let st = self.state.read().await;
        let skip = st.lines.len().saturating_sub(n);
        st.lines.iter().skip(skip).cloned().collect()
    }

    /// A future that resolves on the next append (or stream release).
    ///
    /// Call before re-checking [`OutputRing::get`] to avoid missed wakeups.
    pub fn appended(&self) -> Notified<'_> {
        self.appended.notified()
    }

    /// Appends one line on behalf of a scanner.
    ///
    /// Returns false if `pid` no longer owns the stream; the scanner should
    /// drop the line and exit.
    async fn append(&self, pid: u32, stderr: bool, text: String) -> bool {
        {
            let mut st = self.state.write().await;
            if st.current_pid != pid {
                return false;
            }

            st.bytes += text.len();
            st.lines.push_back(OutputLine { pid, stderr, text });

            // Trim by total size rather than line count; output could be a
            // byte stream chopped into few huge lines.
            while st.lines.len() > 1 && st.bytes > self.max_bytes {
                if let Some(evicted) = st.lines.pop_front() {
                    st.bytes -= evicted.text.len();
                    st.index_offset += 1;
                }
            }
        }
        self.appended.notify_waiters();
        true
    }

    #[cfg(test)]
    async fn attach_pid(&self, pid: u32) {
        self.state.write().await.current_pid = pid;
    }
}

impl Default for OutputRing {
    fn default() -> Self {
        OutputRing::new()
    }
}

/// Drains one stream line by line into the ring.
///
/// Ends on stream EOF (normal child exit), on read errors, or when a newer
/// process took over the ring.
async fn scan_lines<R>(ring: Arc<OutputRing>, pid: u32, reader: R, stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(text)) => {
                if !ring.append(pid, stderr, text).await {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                tracing::trace!(pid, error = %err, "output scanner ended");
                return;
            }
        }
    }
}
