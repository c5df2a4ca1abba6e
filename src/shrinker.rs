//! # Interactive cache shrinker
//!
//! Walks cached actions newest-first to build a reference count over every
//! object and path-index entry, then walks them oldest-first prompting the
//! operator to remove, skip, or quit, and finally sweeps anything left
//! unreferenced (`spec.md` §4.6).

use std::collections::BTreeMap;
use std::time::SystemTime;

use camino::Utf8PathBuf;
use indexmap::IndexSet;

use crate::digest::Digest;
use crate::error::ActionResult;
use crate::executor::{self, ActionRecordDigests};
use crate::manifest::Manifest;
use crate::object_store::{mirror_relative, ObjectStore};
use crate::util::format_duration;

/// What the operator chose for one action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromptResponse {
    Remove,
    Skip,
    Quit,
}

/// Everything shown to the operator about one action before they decide.
#[derive(Debug)]
pub struct ActionSummary {
    pub action_id: Digest,
    pub prog: Utf8PathBuf,
    pub args: Vec<String>,
    pub age: std::time::Duration,
    /// Sum of every referenced blob's size.
    pub max_bytes: u64,
    /// Sum of only blobs uniquely referenced by this action (refcount == 1
    /// at the time of display) — the bytes removal would actually reclaim.
    pub min_bytes: u64,
}

/// Asks the operator what to do with one action. Implementations read a
/// single keypress from the controlling terminal, not from `stdin` — so
/// the prompt still works when the process's stdin is piped data (e.g. a
/// script feeding the executor).
pub trait ShrinkerPrompt {
    fn prompt(&self, summary: &ActionSummary) -> std::io::Result<PromptResponse>;
}

/// Reads a single character from the operator's terminal via the `console`
/// crate, which opens the controlling tty directly rather than reading
/// `stdin` — the "separate duplicated input channel" `spec.md` §4.6 calls
/// for.
pub struct TerminalPrompt {
    term: console::Term,
}

impl TerminalPrompt {
    pub fn new() -> Self {
        TerminalPrompt { term: console::Term::stdout() }
    }
}

impl Default for TerminalPrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl ShrinkerPrompt for TerminalPrompt {
    fn prompt(&self, summary: &ActionSummary) -> std::io::Result<PromptResponse> {
        let args_preview = abbreviate_args(&summary.args);
        self.term.write_line(&format!(
            "{}  {} {}  age={}  min={}B max={}B",
            &summary.action_id.to_hex()[..12],
            summary.prog,
            args_preview,
            format_duration(summary.age),
            summary.min_bytes,
            summary.max_bytes,
        ))?;
        self.term.write_str("remove/skip/quit? [r/s/q] ")?;

        loop {
            match self.term.read_char()? {
                'r' | 'R' => return Ok(PromptResponse::Remove),
                's' | 'S' => return Ok(PromptResponse::Skip),
                'q' | 'Q' => return Ok(PromptResponse::Quit),
                _ => continue,
            }
        }
    }
}

fn abbreviate_args(args: &[String]) -> String {
    const MAX_ARGS_SHOWN: usize = 4;
    const MAX_ARG_LEN: usize = 24;

    let shown: Vec<String> = args
        .iter()
        .take(MAX_ARGS_SHOWN)
        .map(|a| {
            if a.len() > MAX_ARG_LEN {
                format!("{}…", &a[..MAX_ARG_LEN])
            } else {
                a.clone()
            }
        })
        .collect();

    if args.len() > MAX_ARGS_SHOWN {
        format!("{} … (+{} more)", shown.join(" "), args.len() - MAX_ARGS_SHOWN)
    } else {
        shown.join(" ")
    }
}

/// The references one action's record holds, used for both the first
/// reference-counting pass and the refcount decrement on removal.
struct ActionRefs {
    objects: Vec<Digest>,
    paths: Vec<Utf8PathBuf>,
}

fn action_refs(store: &ObjectStore, digests: &ActionRecordDigests) -> ActionResult<ActionRefs> {
    let mut objects = vec![
        digests.wd,
        digests.env,
        digests.prog,
        digests.args,
        digests.inputs_manifest,
        digests.outputs_manifest,
    ];
    let mut paths = Vec::new();

    for manifest_digest in [digests.inputs_manifest, digests.outputs_manifest] {
        let bytes = store.read_object(&manifest_digest)?;
        let manifest = Manifest::parse(&bytes)?;
        for entry in manifest.entries() {
            objects.push(entry.hash);
            paths.push(entry.path.clone());
        }
    }

    Ok(ActionRefs { objects, paths })
}

fn read_action_digests(store: &ObjectStore, action_id: &Digest) -> ActionResult<ActionRecordDigests> {
    let line = std::fs::read_to_string(store.action_path(action_id).as_std_path())?;
    executor::parse_action_record(line.trim_end())
}

/// Result of a full shrink pass, for the CLI to report.
#[derive(Debug, Default)]
pub struct ShrinkSummary {
    pub removed_actions: usize,
    pub skipped_actions: usize,
    pub quit_early: bool,
    pub swept_objects: usize,
    pub swept_paths: usize,
}

/// Run the full interactive shrink over `store` (`spec.md` §4.6).
pub fn shrink(store: &ObjectStore, prompt: &dyn ShrinkerPrompt) -> ActionResult<ShrinkSummary> {
    let mut actions = store.list_actions()?;
    // Newest first for the reference-counting pass.
    actions.sort_by(|a, b| b.1.cmp(&a.1));

    let mut unreferenced_objects: IndexSet<Digest> = store.list_object_digests()?.into_iter().collect();
    let mut unreferenced_paths: IndexSet<Utf8PathBuf> =
        store.list_path_index_entries()?.into_iter().collect();
    let mut object_refcount: BTreeMap<Digest, usize> = BTreeMap::new();
    let mut path_refcount: BTreeMap<Utf8PathBuf, usize> = BTreeMap::new();

    let mut action_refs_by_id: BTreeMap<Digest, ActionRefs> = BTreeMap::new();

    for (action_id, _mtime) in &actions {
        let digests = read_action_digests(store, action_id)?;
        let refs = action_refs(store, &digests)?;

        for hash in &refs.objects {
            unreferenced_objects.shift_remove(hash);
            *object_refcount.entry(*hash).or_insert(0) += 1;
        }
        for path in &refs.paths {
            let rel = mirror_relative(path);
            unreferenced_paths.shift_remove(&rel);
            *path_refcount.entry(rel).or_insert(0) += 1;
        }

        action_refs_by_id.insert(*action_id, refs);
    }

    let now = SystemTime::now();
    let mut summary = ShrinkSummary::default();

    // Oldest first for the display/prompt pass.
    let mut by_age = actions.clone();
    by_age.sort_by(|a, b| a.1.cmp(&b.1));

    for (action_id, mtime) in by_age {
        let digests = read_action_digests(store, &action_id)?;
        let refs = action_refs_by_id
            .get(&action_id)
            .expect("every listed action has its refs precomputed in the first pass");

        let (prog, args) = describe_action(store, &digests)?;
        let max_bytes = sum_sizes(store, &digests)?;
        let min_bytes = sum_unique_sizes(store, &digests, &object_refcount)?;
        let age = now.duration_since(mtime).unwrap_or_default();

        let action_summary = ActionSummary { action_id, prog, args, age, max_bytes, min_bytes };

        match prompt.prompt(&action_summary).map_err(crate::error::ActionError::Io)? {
            PromptResponse::Remove => {
                for hash in &refs.objects {
                    let count = object_refcount.entry(*hash).or_insert(0);
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        unreferenced_objects.insert(*hash);
                    }
                }
                for path in &refs.paths {
                    let rel = mirror_relative(path);
                    let count = path_refcount.entry(rel.clone()).or_insert(0);
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        unreferenced_paths.insert(rel);
                    }
                }
                store.remove_action(&action_id)?;
                summary.removed_actions += 1;
            }
            PromptResponse::Skip => {
                summary.skipped_actions += 1;
            }
            PromptResponse::Quit => {
                summary.quit_early = true;
                break;
            }
        }
    }

    for hash in &unreferenced_objects {
        store.remove_object(hash)?;
        summary.swept_objects += 1;
    }
    for path in &unreferenced_paths {
        store.remove_path_index_entry(path)?;
        summary.swept_paths += 1;
    }
    store.prune_empty_path_index_dirs()?;

    Ok(summary)
}

fn describe_action(store: &ObjectStore, digests: &ActionRecordDigests) -> ActionResult<(Utf8PathBuf, Vec<String>)> {
    let inputs_manifest = Manifest::parse(&store.read_object(&digests.inputs_manifest)?)?;
    let prog = inputs_manifest
        .entries()
        .iter()
        .find(|e| e.hash == digests.prog)
        .map(|e| e.path.clone())
        .unwrap_or_else(|| Utf8PathBuf::from("<unknown program>"));

    let args_bytes = store.read_object(&digests.args)?;
    let args_text = String::from_utf8_lossy(&args_bytes);
    let args: Vec<String> = args_text.lines().map(str::to_owned).collect();

    Ok((prog, args))
}

fn sum_sizes(store: &ObjectStore, digests: &ActionRecordDigests) -> ActionResult<u64> {
    let mut total = 0u64;
    for manifest_digest in [digests.inputs_manifest, digests.outputs_manifest] {
        let manifest = Manifest::parse(&store.read_object(&manifest_digest)?)?;
        total += manifest.total_size();
    }
    Ok(total)
}

fn sum_unique_sizes(
    store: &ObjectStore,
    digests: &ActionRecordDigests,
    refcount: &BTreeMap<Digest, usize>,
) -> ActionResult<u64> {
    let mut total = 0u64;
    for manifest_digest in [digests.inputs_manifest, digests.outputs_manifest] {
        let manifest = Manifest::parse(&store.read_object(&manifest_digest)?)?;
        for entry in manifest.entries() {
            if refcount.get(&entry.hash).copied().unwrap_or(0) == 1 {
                total += entry.size;
            }
        }
    }
    Ok(total)
}
