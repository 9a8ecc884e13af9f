//! EEL event sequencing.
//!
//! An EEL file is line-oriented: `time moduleid eventtype args...`,
//! times in seconds relative to scenario start. A time of `-inf` marks
//! an init event, exposed separately and queryable without blocking.
//! Iterating the sequencer sleeps the calling thread until the wall
//! clock reaches `start + event_time`, then yields the event.
//!
//! The scenario clock starts when the sequencer is constructed; to
//! restart a schedule, construct a new sequencer.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum EelError {
    #[error("cannot read EEL file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bad EEL line {path}:{line}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("EEL event times must be non-decreasing: {path}:{line} has {time} after {previous}")]
    OutOfOrder {
        path: PathBuf,
        line: usize,
        time: f64,
        previous: f64,
    },
}

/// One scheduled event.
#[derive(Debug, Clone, PartialEq)]
pub struct EelEvent {
    /// Seconds after scenario start. Negative infinity for init events.
    pub time: f64,
    pub moduleid: String,
    pub eventtype: String,
    pub args: Vec<String>,
}

/// A lazy, time-ordered sequence of scheduled events.
pub struct EelSequencer {
    init_events: Vec<EelEvent>,
    events: Vec<EelEvent>,
    start: Instant,
    pos: usize,
}

impl EelSequencer {
    /// Parse an EEL file, enforcing non-decreasing event times.
    pub fn from_file(path: &Path) -> Result<Self, EelError> {
        Self::parse(path, true)
    }

    /// Parse an EEL file, accepting out-of-order event times the way
    /// older harnesses did. Out-of-order events still fire as soon as
    /// they are reached.
    pub fn from_file_lenient(path: &Path) -> Result<Self, EelError> {
        Self::parse(path, false)
    }

    fn parse(path: &Path, strict: bool) -> Result<Self, EelError> {
        let text = std::fs::read_to_string(path).map_err(|source| EelError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut init_events = Vec::new();
        let mut events: Vec<EelEvent> = Vec::new();

        for (line_no, line) in text.lines().enumerate() {
            let line_no = line_no + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let time_tok = fields.next().unwrap_or_default();
            let time: f64 = time_tok.parse().map_err(|_| EelError::Parse {
                path: path.to_path_buf(),
                line: line_no,
                reason: format!("bad event time {time_tok:?}"),
            })?;
            if time.is_nan() || time == f64::INFINITY {
                return Err(EelError::Parse {
                    path: path.to_path_buf(),
                    line: line_no,
                    reason: format!("event time {time_tok:?} is not usable"),
                });
            }

            let moduleid = fields.next().ok_or_else(|| EelError::Parse {
                path: path.to_path_buf(),
                line: line_no,
                reason: "missing moduleid".to_string(),
            })?;
            let eventtype = fields.next().ok_or_else(|| EelError::Parse {
                path: path.to_path_buf(),
                line: line_no,
                reason: "missing eventtype".to_string(),
            })?;

            let event = EelEvent {
                time,
                moduleid: moduleid.to_string(),
                eventtype: eventtype.to_string(),
                args: fields.map(str::to_string).collect(),
            };

            if time == f64::NEG_INFINITY {
                init_events.push(event);
                continue;
            }

            if let Some(previous) = events.last().map(|e| e.time) {
                if time < previous {
                    if strict {
                        return Err(EelError::OutOfOrder {
                            path: path.to_path_buf(),
                            line: line_no,
                            time,
                            previous,
                        });
                    }
                    tracing::warn!(
                        path = %path.display(),
                        line = line_no,
                        time,
                        previous,
                        "out-of-order EEL event accepted in lenient mode"
                    );
                }
            }
            events.push(event);
        }

        Ok(Self {
            init_events,
            events,
            start: Instant::now(),
            pos: 0,
        })
    }

    /// Events scheduled at negative infinity: fire-immediately setup
    /// actions, available without iterating.
    pub fn init_events(&self) -> &[EelEvent] {
        &self.init_events
    }

    /// Every timed event, without consuming or blocking.
    pub fn events(&self) -> &[EelEvent] {
        &self.events
    }
}

impl Iterator for EelSequencer {
    type Item = EelEvent;

    fn next(&mut self) -> Option<EelEvent> {
        let event = self.events.get(self.pos)?.clone();
        self.pos += 1;

        let target = self.start + Duration::from_secs_f64(event.time.max(0.0));
        let now = Instant::now();
        if target > now {
            std::thread::sleep(target - now);
        }
        Some(event)
    }
}
