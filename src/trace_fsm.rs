//! # Filesystem-trace state machine
//!
//! Folds a stream of filesystem-access events into a per-path terminal
//! classification (`spec.md` §4.2). Pure: no I/O, no shared state — a
//! `fold` call is a plain function of its input events, which is what makes
//! it exhaustively unit-testable against the transition table below.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{ActionError, ActionResult};

/// One line of the external tracer's event log, already parsed
/// (`spec.md` §6 "Tracer interface").
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    Read(Utf8PathBuf),
    Write(Utf8PathBuf),
    Delete(Utf8PathBuf),
    /// A move is rewritten to `[Delete(src), Write(dst)]` before folding.
    Move { dst: Utf8PathBuf, src: Utf8PathBuf },
}

/// The terminal state of a single path after folding its event history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathState {
    /// Declared input only.
    Read,
    /// Declared output only.
    Write,
    /// Both input and output.
    ReadWrite,
    /// Transient: neither an input nor an output.
    Deleted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Read,
    Write,
    Delete,
}

/// Fold a trace event stream into a per-path terminal classification,
/// applying the transition table in `spec.md` §4.2.
///
/// | from \ event | r | w | d |
/// |---|---|---|---|
/// | ∅  | r  | w  | error (delete-before-write) |
/// | r  | r  | rw | error (read-then-delete) |
/// | w  | w  | w  | d |
/// | rw | rw | rw | rw |
/// | d  | error (delete-then-read) | w | error (double-delete) |
pub fn fold(events: &[TraceEvent]) -> ActionResult<BTreeMap<Utf8PathBuf, PathState>> {
    let mut states: BTreeMap<Utf8PathBuf, PathState> = BTreeMap::new();

    for event in events {
        match event {
            TraceEvent::Read(path) => apply(&mut states, path, Kind::Read)?,
            TraceEvent::Write(path) => apply(&mut states, path, Kind::Write)?,
            TraceEvent::Delete(path) => apply(&mut states, path, Kind::Delete)?,
            TraceEvent::Move { dst, src } => {
                apply(&mut states, src, Kind::Delete)?;
                apply(&mut states, dst, Kind::Write)?;
            }
        }
    }

    Ok(states)
}

fn apply(states: &mut BTreeMap<Utf8PathBuf, PathState>, path: &Utf8Path, kind: Kind) -> ActionResult<()> {
    let current = states.get(path).copied();

    let next = match (current, kind) {
        (None, Kind::Read) => PathState::Read,
        (None, Kind::Write) => PathState::Write,
        (None, Kind::Delete) => {
            return Err(trace_error(path, "delete before any write (delete-before-write)"))
        }

        (Some(PathState::Read), Kind::Read) => PathState::Read,
        (Some(PathState::Read), Kind::Write) => PathState::ReadWrite,
        (Some(PathState::Read), Kind::Delete) => {
            return Err(trace_error(path, "delete after a read with no intervening write (read-then-delete)"))
        }

        (Some(PathState::Write), Kind::Read) => PathState::Write,
        (Some(PathState::Write), Kind::Write) => PathState::Write,
        (Some(PathState::Write), Kind::Delete) => PathState::Deleted,

        (Some(PathState::ReadWrite), Kind::Read) => PathState::ReadWrite,
        (Some(PathState::ReadWrite), Kind::Write) => PathState::ReadWrite,
        (Some(PathState::ReadWrite), Kind::Delete) => PathState::ReadWrite,

        (Some(PathState::Deleted), Kind::Read) => {
            return Err(trace_error(path, "read after delete (delete-then-read)"))
        }
        (Some(PathState::Deleted), Kind::Write) => PathState::Write,
        (Some(PathState::Deleted), Kind::Delete) => {
            return Err(trace_error(path, "delete after delete (double-delete)"))
        }
    };

    states.insert(path.to_owned(), next);
    Ok(())
}

fn trace_error(path: &Utf8Path, detail: &str) -> ActionError {
    ActionError::TraceStateError {
        path: path.to_owned(),
        detail: detail.to_string(),
    }
}

/// Split a folded state map into `(inputs, outputs)` path sets, per
/// `spec.md` §4.2's final-classification rule: `r` → input only, `w` →
/// output only, `rw` → both, `d` → neither.
pub fn classify(
    states: &BTreeMap<Utf8PathBuf, PathState>,
) -> (Vec<Utf8PathBuf>, Vec<Utf8PathBuf>) {
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();

    for (path, state) in states {
        match state {
            PathState::Read => inputs.push(path.clone()),
            PathState::Write => outputs.push(path.clone()),
            PathState::ReadWrite => {
                inputs.push(path.clone());
                outputs.push(path.clone());
            }
            PathState::Deleted => {}
        }
    }

    (inputs, outputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(s)
    }

    #[test]
    fn read_only_classifies_as_input() {
        let states = fold(&[TraceEvent::Read(p("/a"))]).unwrap();
        assert_eq!(states[&p("/a")], PathState::Read);
        let (inputs, outputs) = classify(&states);
        assert_eq!(inputs, vec![p("/a")]);
        assert!(outputs.is_empty());
    }

    #[test]
    fn write_only_classifies_as_output() {
        let states = fold(&[TraceEvent::Write(p("/a"))]).unwrap();
        let (inputs, outputs) = classify(&states);
        assert!(inputs.is_empty());
        assert_eq!(outputs, vec![p("/a")]);
    }

    #[test]
    fn read_then_write_classifies_as_both() {
        let states = fold(&[TraceEvent::Read(p("/a")), TraceEvent::Write(p("/a"))]).unwrap();
        assert_eq!(states[&p("/a")], PathState::ReadWrite);
        let (inputs, outputs) = classify(&states);
        assert_eq!(inputs, vec![p("/a")]);
        assert_eq!(outputs, vec![p("/a")]);
    }

    #[test]
    fn write_then_delete_is_transient() {
        let states = fold(&[TraceEvent::Write(p("/a")), TraceEvent::Delete(p("/a"))]).unwrap();
        assert_eq!(states[&p("/a")], PathState::Deleted);
        let (inputs, outputs) = classify(&states);
        assert!(inputs.is_empty());
        assert!(outputs.is_empty());
    }

    #[test]
    fn delete_before_write_is_fatal() {
        let err = fold(&[TraceEvent::Delete(p("/a"))]).unwrap_err();
        assert!(matches!(err, ActionError::TraceStateError { .. }));
    }

    #[test]
    fn read_then_delete_is_fatal() {
        let err = fold(&[TraceEvent::Read(p("/a")), TraceEvent::Delete(p("/a"))]).unwrap_err();
        assert!(matches!(err, ActionError::TraceStateError { .. }));
    }

    #[test]
    fn delete_then_read_is_fatal() {
        let err = fold(&[
            TraceEvent::Write(p("/a")),
            TraceEvent::Delete(p("/a")),
            TraceEvent::Read(p("/a")),
        ])
        .unwrap_err();
        assert!(matches!(err, ActionError::TraceStateError { .. }));
    }

    #[test]
    fn double_delete_is_fatal() {
        let err = fold(&[
            TraceEvent::Write(p("/a")),
            TraceEvent::Delete(p("/a")),
            TraceEvent::Delete(p("/a")),
        ])
        .unwrap_err();
        assert!(matches!(err, ActionError::TraceStateError { .. }));
    }

    #[test]
    fn rw_survives_delete() {
        let states = fold(&[
            TraceEvent::Read(p("/a")),
            TraceEvent::Write(p("/a")),
            TraceEvent::Delete(p("/a")),
        ])
        .unwrap();
        assert_eq!(states[&p("/a")], PathState::ReadWrite);
    }

    /// `spec.md` §8 scenario 5: move rewrite.
    #[test]
    fn move_rewrites_to_delete_source_write_dest() {
        let states = fold(&[
            TraceEvent::Write(p("/t/x")),
            TraceEvent::Move {
                dst: p("/t/y"),
                src: p("/t/x"),
            },
        ])
        .unwrap();

        assert_eq!(states[&p("/t/x")], PathState::Deleted);
        assert_eq!(states[&p("/t/y")], PathState::Write);

        let (inputs, outputs) = classify(&states);
        assert!(inputs.is_empty());
        assert_eq!(outputs, vec![p("/t/y")]);
    }

    #[test]
    fn unrelated_paths_have_independent_states() {
        let states = fold(&[TraceEvent::Read(p("/a")), TraceEvent::Write(p("/b"))]).unwrap();
        assert_eq!(states[&p("/a")], PathState::Read);
        assert_eq!(states[&p("/b")], PathState::Write);
    }
}
