//! CLI command handlers that bridge between `clap` and the core

use std::time::Duration;

use anyhow::{Context, Result};
use clap::ArgMatches;
use jobmesh_core::{config::load_config, Coordinator, JobId, Parameters};
use serde_json::{json, Value};

use super::{
    commands::build_cli,
    output::{emit, OutputFormat},
};

/// Format an error for user display (no stack traces)
pub fn format_error(err: &anyhow::Error) -> String {
    let msg = err.to_string();
    if let Some(source) = err.source() {
        let source_msg = source.to_string();
        if !msg.contains(&source_msg) && !source_msg.is_empty() {
            return format!("{msg}\nCause: {source_msg}");
        }
    }
    msg
}

/// Parse arguments, connect to the configured store and run one command.
pub async fn run_cli() -> Result<()> {
    let matches = build_cli().get_matches();
    let format = OutputFormat::from_json_flag(matches.get_flag("json"));

    let config = load_config()?;
    let coordinator = Coordinator::connect(&config).await?;
    tracing::debug!(
        command = matches.subcommand_name().unwrap_or_default(),
        json = format.is_json(),
        "dispatching command"
    );

    match matches.subcommand() {
        Some(("register", sub_m)) => handle_register(&coordinator, sub_m, format).await,
        Some(("find", sub_m)) => handle_find(&coordinator, sub_m, format).await,
        Some(("show", sub_m)) => handle_show(&coordinator, sub_m, format).await,
        Some(("remove", sub_m)) => handle_remove(&coordinator, sub_m, format).await,
        Some(("clear", sub_m)) => handle_clear(&coordinator, sub_m, format).await,
        Some(("pulse", _)) => handle_pulse(&coordinator, format).await,
        Some(("active", sub_m)) => handle_active(&coordinator, sub_m, format).await,
        Some(("sweep", sub_m)) => handle_sweep(&coordinator, sub_m, format).await,
        Some(("queue-stats", _)) => handle_queue_stats(&coordinator, format).await,
        Some((other, _)) => Err(anyhow::anyhow!("Unknown command: {other}")),
        None => Err(anyhow::anyhow!("No command given")),
    }
}

/// Parse a JSON argument that must be an object.
pub fn parse_parameters(raw: &str) -> Result<Parameters> {
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("Invalid JSON: {raw}"))?;
    match value {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("Parameters must be a JSON object, got {other}"),
    }
}

fn job_id_arg(sub_m: &ArgMatches) -> Result<JobId> {
    let raw = sub_m
        .get_one::<String>("job_id")
        .ok_or_else(|| anyhow::anyhow!("job_id is required"))?;
    Ok(JobId::parse(raw)?)
}

fn id_lines(ids: &[JobId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

pub async fn handle_register(
    coordinator: &Coordinator,
    sub_m: &ArgMatches,
    format: OutputFormat,
) -> Result<()> {
    let parameter_sets = sub_m
        .get_many::<String>("parameters")
        .into_iter()
        .flatten()
        .map(|raw| parse_parameters(raw))
        .collect::<Result<Vec<_>>>()?;

    let ids = coordinator.jobs().register_many(&parameter_sets).await?;
    emit(format, "register", &ids, |ids| id_lines(ids))
}

pub async fn handle_find(
    coordinator: &Coordinator,
    sub_m: &ArgMatches,
    format: OutputFormat,
) -> Result<()> {
    let filter = sub_m
        .get_one::<String>("filter")
        .map(|raw| parse_parameters(raw))
        .transpose()?
        .unwrap_or_default();

    let ids = coordinator.jobs().find(&filter).await?;
    emit(format, "find", &ids, |ids| id_lines(ids))
}

pub async fn handle_show(
    coordinator: &Coordinator,
    sub_m: &ArgMatches,
    format: OutputFormat,
) -> Result<()> {
    let id = job_id_arg(sub_m)?;
    let doc = coordinator
        .jobs()
        .get(&id)
        .await?
        .ok_or_else(|| jobmesh_core::Error::not_found(format!("job {id}")))?;

    emit(format, "show", &doc, |doc| {
        let parameters = doc
            .parameters
            .as_ref()
            .map_or_else(|| "<missing>".to_owned(), |p| Value::Object(p.clone()).to_string());
        let executing = doc.executing.iter().cloned().collect::<Vec<_>>().join(", ");
        let lock = doc
            .lock
            .as_ref()
            .map_or_else(|| "free".to_owned(), |l| format!("held since {}", l.acquired_at));
        format!(
            "id:         {}\nparameters: {parameters}\nexecuting:  [{executing}]\nlock:       {lock}",
            doc.id
        )
    })
}

pub async fn handle_remove(
    coordinator: &Coordinator,
    sub_m: &ArgMatches,
    format: OutputFormat,
) -> Result<()> {
    let id = job_id_arg(sub_m)?;
    let force = sub_m.get_flag("force");
    coordinator.jobs().remove(&id, force).await?;
    emit(format, "remove", json!({"removed": id.as_str()}), |_| format!("Removed {id}"))
}

pub async fn handle_clear(
    coordinator: &Coordinator,
    sub_m: &ArgMatches,
    format: OutputFormat,
) -> Result<()> {
    let force = sub_m.get_flag("force");
    let jobs = coordinator.jobs();
    let removed = if sub_m.get_flag("develop") {
        jobs.clear_develop(force).await?
    } else {
        jobs.clear(force).await?
    };
    emit(format, "clear", json!({"removed": removed}), |_| {
        format!("Removed {removed} job(s)")
    })
}

pub async fn handle_pulse(coordinator: &Coordinator, format: OutputFormat) -> Result<()> {
    let pulse = coordinator.jobs().job_pulse().await?;
    emit(format, "pulse", &pulse, |entries| {
        entries
            .iter()
            .map(|e| format!("{}  {}  {}", e.job_id, e.worker, e.last_beat))
            .collect::<Vec<_>>()
            .join("\n")
    })
}

pub async fn handle_active(
    coordinator: &Coordinator,
    sub_m: &ArgMatches,
    format: OutputFormat,
) -> Result<()> {
    let jobs = coordinator.jobs();
    if sub_m.get_flag("count") {
        let count = jobs.num_active_jobs().await?;
        return emit(format, "active", json!({"count": count}), |_| count.to_string());
    }
    let ids = jobs.active_job_ids().await?;
    emit(format, "active", &ids, |ids| id_lines(ids))
}

pub async fn handle_sweep(
    coordinator: &Coordinator,
    sub_m: &ArgMatches,
    format: OutputFormat,
) -> Result<()> {
    let jobs = coordinator.jobs();
    let cutoff = sub_m
        .get_one::<u64>("cutoff")
        .map_or(jobs.heartbeat().dead_after, |secs| Duration::from_secs(*secs));

    tracing::info!(cutoff_secs = cutoff.as_secs(), tasks = sub_m.get_flag("tasks"), "running sweep");
    let report = jobs.reclaim_dead(cutoff).await?;
    let tasks = if sub_m.get_flag("tasks") {
        Some(coordinator.executor().sweep_stale(cutoff).await?)
    } else {
        None
    };

    let data = json!({
        "cutoff_secs": cutoff.as_secs(),
        "jobs": &report,
        "tasks": &tasks,
    });
    emit(format, "sweep", data, |_| {
        let mut text = format!(
            "Scanned {} job(s), reclaimed {} worker(s), {} failure(s)",
            report.scanned,
            report.reclaimed.len(),
            report.failed
        );
        if let Some(tasks) = &tasks {
            text.push_str(&format!(
                "\nDropped {} stale fingerprint(s), requeued {} task(s)",
                tasks.fingerprints.len(),
                tasks.requeued.len()
            ));
        }
        text
    })
}

pub async fn handle_queue_stats(coordinator: &Coordinator, format: OutputFormat) -> Result<()> {
    let stats = coordinator.queue().stats().await?;
    emit(format, "queue-stats", stats, |s| {
        format!(
            "total: {}  pending: {}  claimed: {}  done: {}",
            s.total, s.pending, s.claimed, s.done
        )
    })
}
