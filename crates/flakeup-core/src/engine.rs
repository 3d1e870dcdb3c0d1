//! The orchestrator: target resolution, per-item operation orders,
//! two-phase fan-out, event consumption, and persistence.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use flakeup_events::{
    EventKind, EventPayload, EventSender, UpdateEvent, channel, run_source_task,
};
use flakeup_nix::flake_lock_update;
use flakeup_types::{SourceEntry, SourcesFile, UpdateError};

use crate::context::RunContext;
use crate::options::{ListTargets, UpdateOptions};
use crate::refs::{FlakeInputRef, get_flake_inputs_with_refs, update_refs_task};
use crate::sources::{load_all_sources, save_sources, validate_source_discovery_consistency};
use crate::summary::{RunReport, SummaryStatus, UpdateSummary};
use crate::updater::{Updater, VersionInfo};

/// One step in an item's fixed operation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    CheckVersion,
    UpdateRef,
    RefreshLock,
    ComputeHash,
}

/// Where an item was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOrigin {
    FlakeOnly,
    SourcesOnly,
    Both,
}

impl fmt::Display for ItemOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemOrigin::FlakeOnly => f.write_str("(flake.nix)"),
            ItemOrigin::SourcesOnly => f.write_str("(sources.json)"),
            ItemOrigin::Both => f.write_str("(flake.nix + sources.json)"),
        }
    }
}

/// Static metadata for one run item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMeta {
    pub name: String,
    pub origin: ItemOrigin,
    pub op_order: Vec<OperationKind>,
}

/// Resolved source/input targets and effective mode flags.
#[derive(Debug, Clone)]
pub struct ResolvedTargets {
    pub all_source_names: BTreeSet<String>,
    pub all_ref_names: BTreeSet<String>,
    pub do_refs: bool,
    pub do_sources: bool,
    pub do_input_refresh: bool,
    pub dry_run: bool,
    pub native_only: bool,
    pub ref_inputs: Vec<FlakeInputRef>,
    pub source_names: Vec<String>,
}

impl ResolvedTargets {
    pub fn resolve(
        opts: &UpdateOptions,
        registry_names: &[String],
        all_ref_inputs: Vec<FlakeInputRef>,
    ) -> Result<Self, UpdateError> {
        let all_source_names: BTreeSet<String> = registry_names.iter().cloned().collect();
        let all_ref_names: BTreeSet<String> =
            all_ref_inputs.iter().map(|i| i.name.clone()).collect();

        if let Some(source) = &opts.source
            && !all_source_names.contains(source)
            && !all_ref_names.contains(source)
        {
            let mut known: Vec<&str> = all_source_names
                .iter()
                .chain(all_ref_names.iter())
                .map(String::as_str)
                .collect();
            known.sort_unstable();
            known.dedup();
            return Err(UpdateError::Validation(format!(
                "unknown source or input '{source}'; available: {}",
                known.join(", ")
            )));
        }

        // Native-only runs leave refs to the CI pipeline.
        let mut do_refs = !opts.no_refs && !opts.native_only;
        let mut do_sources = !opts.no_sources;
        if let Some(source) = &opts.source {
            if !all_ref_names.contains(source) {
                do_refs = false;
            }
            if !all_source_names.contains(source) {
                do_sources = false;
            }
        }

        let mut ref_inputs = match &opts.source {
            Some(source) => all_ref_inputs
                .into_iter()
                .filter(|input| &input.name == source)
                .collect(),
            None => all_ref_inputs,
        };
        let mut source_names: Vec<String> = match &opts.source {
            Some(source) if all_source_names.contains(source) => vec![source.clone()],
            Some(_) => Vec::new(),
            None => registry_names.to_vec(),
        };
        if !do_refs {
            ref_inputs = Vec::new();
        }
        if !do_sources {
            source_names = Vec::new();
        }

        Ok(Self {
            all_source_names,
            all_ref_names,
            do_refs,
            do_sources,
            do_input_refresh: !opts.no_input,
            dry_run: opts.check,
            native_only: opts.native_only,
            ref_inputs,
            source_names,
        })
    }
}

/// Classify every item into its origin and fixed operation order.
pub fn build_item_meta(
    resolved: &ResolvedTargets,
    sources: Option<&SourcesFile>,
) -> BTreeMap<String, ItemMeta> {
    let flake_names: BTreeSet<&str> = if resolved.do_refs {
        resolved.ref_inputs.iter().map(|i| i.name.as_str()).collect()
    } else {
        BTreeSet::new()
    };
    let source_names: BTreeSet<&str> = if resolved.do_sources {
        resolved.source_names.iter().map(String::as_str).collect()
    } else {
        BTreeSet::new()
    };
    let sources_with_input: BTreeSet<&str> = sources
        .map(|sources| {
            sources
                .entries
                .iter()
                .filter(|(name, entry)| {
                    entry.input.is_some() && source_names.contains(name.as_str())
                })
                .map(|(name, _)| name.as_str())
                .collect()
        })
        .unwrap_or_default();

    let mut meta = BTreeMap::new();
    for name in flake_names.union(&source_names) {
        let in_flake = flake_names.contains(name);
        let has_source_input = sources_with_input.contains(name);
        let (origin, op_order) = if in_flake && has_source_input {
            (
                ItemOrigin::Both,
                vec![
                    OperationKind::CheckVersion,
                    OperationKind::UpdateRef,
                    OperationKind::RefreshLock,
                    OperationKind::ComputeHash,
                ],
            )
        } else if source_names.contains(name) && has_source_input {
            (
                ItemOrigin::SourcesOnly,
                vec![
                    OperationKind::CheckVersion,
                    OperationKind::RefreshLock,
                    OperationKind::ComputeHash,
                ],
            )
        } else if source_names.contains(name) {
            (
                ItemOrigin::SourcesOnly,
                vec![OperationKind::CheckVersion, OperationKind::ComputeHash],
            )
        } else {
            (
                ItemOrigin::FlakeOnly,
                vec![
                    OperationKind::CheckVersion,
                    OperationKind::UpdateRef,
                    OperationKind::RefreshLock,
                ],
            )
        };
        meta.insert(
            name.to_string(),
            ItemMeta {
                name: name.to_string(),
                origin,
                op_order,
            },
        );
    }
    meta
}

struct Consumed {
    summary: UpdateSummary,
    source_updates: BTreeMap<String, SourceEntry>,
}

/// Aggregate per-source outcomes from the run-wide queue, optionally
/// forwarding every event to an external observer.
async fn consume_events(
    mut rx: mpsc::Receiver<UpdateEvent>,
    tap: Option<EventSender>,
) -> Consumed {
    let mut summary = UpdateSummary::default();
    let mut source_updates = BTreeMap::new();

    while let Some(event) = rx.recv().await {
        if let Some(tap) = &tap {
            tap.send(event.clone()).await;
        }
        match event.kind {
            EventKind::Error => summary.record(&event.source, SummaryStatus::Error),
            EventKind::Result => match event.payload {
                Some(EventPayload::Entry(entry)) => {
                    source_updates.insert(event.source.clone(), entry);
                    summary.record(&event.source, SummaryStatus::Updated);
                }
                Some(EventPayload::RefUpdate { .. }) => {
                    summary.record(&event.source, SummaryStatus::Updated);
                }
                _ => summary.record(&event.source, SummaryStatus::NoChange),
            },
            _ => {}
        }
    }

    Consumed {
        summary,
        source_updates,
    }
}

async fn update_source_task(
    name: String,
    updater: Arc<dyn Updater>,
    current: Option<SourceEntry>,
    update_input: bool,
    pinned: Option<VersionInfo>,
    ctx: Arc<RunContext>,
    events: EventSender,
    input_lock: Arc<Mutex<()>>,
) {
    let task = async {
        events.status(&name, "Starting update").await;
        if update_input && let Some(input) = updater.input_name() {
            events
                .status(&name, format!("Updating flake input '{input}'..."))
                .await;
            let _writer = input_lock.lock().await;
            flake_lock_update(&name, input, &ctx.config, &events).await?;
            ctx.invalidate_flake_lock();
        }
        updater
            .update_stream(current.as_ref(), &ctx, &events, pinned)
            .await
    };
    run_source_task(&name, &events, task).await;
}

/// Merge freshly computed entries over the on-disk ones. In native-only
/// mode the incoming entries carry only the current platform, so the
/// merge preserves other platforms' digests; otherwise replacement.
fn merge_source_updates(
    existing: &BTreeMap<String, SourceEntry>,
    updates: BTreeMap<String, SourceEntry>,
    native_only: bool,
) -> Result<BTreeMap<String, SourceEntry>, UpdateError> {
    if !native_only {
        return Ok(updates);
    }
    updates
        .into_iter()
        .map(|(name, entry)| match existing.get(&name) {
            Some(on_disk) => Ok((name, on_disk.merge(&entry)?)),
            None => Ok((name, entry)),
        })
        .collect()
}

/// Run the full update workflow.
pub async fn run_updates(
    opts: UpdateOptions,
    ctx: Arc<RunContext>,
) -> Result<RunReport, UpdateError> {
    run_updates_observed(opts, ctx, None).await
}

/// Like [`run_updates`], forwarding every event to `tap` so callers can
/// render live progress however they like.
pub async fn run_updates_observed(
    opts: UpdateOptions,
    ctx: Arc<RunContext>,
    tap: Option<EventSender>,
) -> Result<RunReport, UpdateError> {
    ctx.set_native_only(opts.native_only);

    let all_ref_inputs = match ctx.flake_lock() {
        Ok(lock) => get_flake_inputs_with_refs(&lock),
        // Refs were explicitly disabled; a missing lock file is fine.
        Err(_) if opts.no_refs || opts.native_only => Vec::new(),
        Err(err) => return Err(err),
    };
    let resolved = ResolvedTargets::resolve(&opts, &ctx.registry.names(), all_ref_inputs)?;

    if resolved.ref_inputs.is_empty() && resolved.source_names.is_empty() {
        return Ok(RunReport::from_summary(UpdateSummary::default()));
    }

    let mut sources = if resolved.do_sources && !resolved.source_names.is_empty() {
        load_all_sources(&ctx.paths)?
    } else {
        SourcesFile::default()
    };

    let (queue, rx) = channel();
    let consumer = tokio::spawn(consume_events(rx, tap));

    // Phase 1: flake input refs.
    if resolved.do_refs && !resolved.ref_inputs.is_empty() {
        let flake_edit_lock = Arc::new(Mutex::new(()));
        let mut tasks = JoinSet::new();
        for input_ref in resolved.ref_inputs.clone() {
            tasks.spawn(update_refs_task(
                input_ref,
                ctx.clone(),
                queue.clone(),
                resolved.dry_run,
                flake_edit_lock.clone(),
            ));
        }
        while tasks.join_next().await.is_some() {}
    }

    // Phase 2: per-source updates.
    if resolved.do_sources && !resolved.source_names.is_empty() {
        let input_lock = Arc::new(Mutex::new(()));
        let mut tasks = JoinSet::new();
        for name in resolved.source_names.clone() {
            let Some(updater) = ctx.registry.get(&name) else {
                queue
                    .send(UpdateEvent::error(&name, "No registered updater"))
                    .await;
                continue;
            };
            tasks.spawn(update_source_task(
                name.clone(),
                updater,
                sources.get(&name).cloned(),
                resolved.do_input_refresh && !resolved.dry_run,
                opts.pinned_versions.get(&name).map(VersionInfo::new),
                ctx.clone(),
                queue.clone(),
                input_lock.clone(),
            ));
        }
        while tasks.join_next().await.is_some() {}
    }

    drop(queue);
    let consumed = consumer
        .await
        .map_err(|err| UpdateError::message(format!("event consumer failed: {err}")))?;
    let summary = consumed.summary;

    if resolved.do_sources && !resolved.source_names.is_empty() {
        let updates = merge_source_updates(
            &sources.entries,
            consumed.source_updates,
            resolved.native_only,
        )?;
        for (name, entry) in updates {
            sources.insert(name, entry);
        }
        let updated = summary.updated();
        let any_source_updated = resolved
            .source_names
            .iter()
            .any(|name| updated.contains(name));
        if !resolved.dry_run && any_source_updated {
            save_sources(&ctx.paths, &sources).await?;
        }
    }

    Ok(RunReport::from_summary(summary))
}

/// Registered sources and eligible flake inputs, for rendering.
pub fn list_targets(ctx: &RunContext) -> Result<ListTargets, UpdateError> {
    let inputs = match ctx.flake_lock() {
        Ok(lock) => get_flake_inputs_with_refs(&lock),
        Err(_) => Vec::new(),
    };
    Ok(ListTargets {
        sources: ctx.registry.names(),
        inputs,
    })
}

/// Validate every on-disk entry and the discovery invariant; returns the
/// number of validated sources.
pub async fn validate_sources(
    ctx: &RunContext,
    events: &EventSender,
) -> Result<usize, UpdateError> {
    let sources = load_all_sources(&ctx.paths)?;
    validate_source_discovery_consistency(ctx, events).await?;
    Ok(sources.entries.len())
}
