//! # Filesystem tracer interface
//!
//! The tracer is an external collaborator: a program that runs a command
//! and reports every filesystem access it made as `<kind>|<path>` lines (or
//! `m|<dst>|<src>` for moves). The executor treats it as a black box behind
//! the [`CommandTracer`] trait (`spec.md` §6, §9 redesign note) so tests can
//! swap in [`ScriptedTracer`] instead of shelling out to a real tracer
//! binary.

use std::collections::BTreeMap;
use std::io::BufRead;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{ActionError, ActionResult};
use crate::trace_fsm::TraceEvent;

/// Runs a traced command and returns the filesystem events it performed.
pub trait CommandTracer {
    fn trace(
        &self,
        prog: &Utf8Path,
        args: &[String],
        working_dir: &Utf8Path,
        env: &BTreeMap<String, String>,
    ) -> ActionResult<Vec<TraceEvent>>;
}

/// Shells out to an external filesystem-tracing tool, named by the
/// `ARTIFACT_EXECUTOR_TRACER` environment variable or `fs-tracer` on
/// `PATH`, and parses its line-oriented event log.
pub struct SubprocessTracer {
    tracer_binary: String,
}

impl SubprocessTracer {
    pub fn new() -> Self {
        let tracer_binary = std::env::var("ARTIFACT_EXECUTOR_TRACER")
            .unwrap_or_else(|_| "fs-tracer".to_string());
        SubprocessTracer { tracer_binary }
    }

    pub fn with_binary(tracer_binary: impl Into<String>) -> Self {
        SubprocessTracer {
            tracer_binary: tracer_binary.into(),
        }
    }
}

impl Default for SubprocessTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTracer for SubprocessTracer {
    fn trace(
        &self,
        prog: &Utf8Path,
        args: &[String],
        working_dir: &Utf8Path,
        env: &BTreeMap<String, String>,
    ) -> ActionResult<Vec<TraceEvent>> {
        let events_file = tempfile::NamedTempFile::new()
            .map_err(ActionError::Io)?;
        let events_path = Utf8Path::from_path(events_file.path())
            .ok_or_else(|| ActionError::Other(anyhow::anyhow!("non-UTF-8 temp path")))?;

        let command_display = format!("{} {}", prog, args.join(" "));
        tracing::trace!(tracer = %self.tracer_binary, command = %command_display, "invoking filesystem tracer");

        let mut command = std::process::Command::new(&self.tracer_binary);
        command
            .arg(events_path.as_str())
            .arg(prog.as_str())
            .args(args)
            .current_dir(working_dir.as_std_path())
            .env_clear()
            .envs(env)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let output = command
            .output()
            .map_err(|e| ActionError::TracerFailure(format!("failed to spawn {}: {e}", self.tracer_binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ActionError::TracerFailure(format!(
                "{} exited with {}: {stderr}",
                self.tracer_binary, output.status
            )));
        }

        parse_event_log(events_path)
    }
}

fn parse_event_log(path: &Utf8Path) -> ActionResult<Vec<TraceEvent>> {
    let file = std::fs::File::open(path.as_std_path())?;
    let reader = std::io::BufReader::new(file);

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        events.push(parse_event_line(&line)?);
    }
    Ok(events)
}

fn parse_event_line(line: &str) -> ActionResult<TraceEvent> {
    let mut parts = line.splitn(3, '|');
    let kind = parts.next().unwrap_or_default();
    match kind {
        "r" => {
            let path = parts.next().ok_or_else(|| malformed(line))?;
            Ok(TraceEvent::Read(Utf8PathBuf::from(path)))
        }
        "w" => {
            let path = parts.next().ok_or_else(|| malformed(line))?;
            Ok(TraceEvent::Write(Utf8PathBuf::from(path)))
        }
        "d" => {
            let path = parts.next().ok_or_else(|| malformed(line))?;
            Ok(TraceEvent::Delete(Utf8PathBuf::from(path)))
        }
        "m" => {
            let dst = parts.next().ok_or_else(|| malformed(line))?;
            let src = parts.next().ok_or_else(|| malformed(line))?;
            Ok(TraceEvent::Move {
                dst: Utf8PathBuf::from(dst),
                src: Utf8PathBuf::from(src),
            })
        }
        _ => Err(malformed(line)),
    }
}

fn malformed(line: &str) -> ActionError {
    ActionError::TracerFailure(format!("malformed trace event line: {line:?}"))
}

/// A test double that replays a fixed event list instead of spawning a real
/// tracer binary. Used throughout this crate's own test suite in place of
/// shelling out to `/bin/cp` or similar.
pub struct ScriptedTracer {
    events: Vec<TraceEvent>,
}

impl ScriptedTracer {
    pub fn new(events: Vec<TraceEvent>) -> Self {
        ScriptedTracer { events }
    }
}

impl CommandTracer for ScriptedTracer {
    fn trace(
        &self,
        _prog: &Utf8Path,
        _args: &[String],
        _working_dir: &Utf8Path,
        _env: &BTreeMap<String, String>,
    ) -> ActionResult<Vec<TraceEvent>> {
        Ok(self.events.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_read_write_delete_lines() {
        assert_eq!(parse_event_line("r|/a").unwrap(), TraceEvent::Read(Utf8PathBuf::from("/a")));
        assert_eq!(parse_event_line("w|/a").unwrap(), TraceEvent::Write(Utf8PathBuf::from("/a")));
        assert_eq!(parse_event_line("d|/a").unwrap(), TraceEvent::Delete(Utf8PathBuf::from("/a")));
    }

    #[test]
    fn parses_move_line_as_dst_then_src() {
        let event = parse_event_line("m|/t/y|/t/x").unwrap();
        assert_eq!(
            event,
            TraceEvent::Move {
                dst: Utf8PathBuf::from("/t/y"),
                src: Utf8PathBuf::from("/t/x"),
            }
        );
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!(parse_event_line("x|/a").is_err());
    }

    #[test]
    fn scripted_tracer_replays_fixed_events() {
        let events = vec![TraceEvent::Read(Utf8PathBuf::from("/a"))];
        let tracer = ScriptedTracer::new(events.clone());
        let env = BTreeMap::new();
        let result = tracer
            .trace(Utf8Path::new("/bin/true"), &[], Utf8Path::new("/"), &env)
            .unwrap();
        assert_eq!(result, events);
    }
}
