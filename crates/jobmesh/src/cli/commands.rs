//! CLI command definitions using `clap`

use clap::{value_parser, Arg, ArgAction, Command as ClapCommand};

pub fn after_help_text(examples: &[&str]) -> String {
    let mut text = String::from("EXAMPLES:\n");
    for example in examples {
        text.push_str("  ");
        text.push_str(example);
        text.push('\n');
    }
    text
}

fn json_flag() -> Arg {
    Arg::new("json")
        .long("json")
        .global(true)
        .action(ArgAction::SetTrue)
        .help("Output as JSON")
}

fn force_flag(help: &'static str) -> Arg {
    Arg::new("force")
        .long("force")
        .short('f')
        .action(ArgAction::SetTrue)
        .help(help)
}

pub fn cmd_register() -> ClapCommand {
    ClapCommand::new("register")
        .about("Register jobs from JSON parameter objects")
        .long_about(
            "Register one job per JSON object. The job id is derived from the \
             parameters, so registering the same parameters twice is a no-op.",
        )
        .arg(
            Arg::new("parameters")
                .required(true)
                .num_args(1..)
                .help("Job parameters as a JSON object"),
        )
        .after_help(after_help_text(&[
            r#"jobmesh register '{"a": 1, "b": 2}'"#,
            r#"jobmesh register '{"seed": 1}' '{"seed": 2}' --json"#,
        ]))
}

pub fn cmd_find() -> ClapCommand {
    ClapCommand::new("find")
        .about("List job ids whose parameters match a filter")
        .arg(
            Arg::new("filter")
                .required(false)
                .help("JSON object of parameter values to match (default: all jobs)"),
        )
        .after_help(after_help_text(&[
            "jobmesh find",
            r#"jobmesh find '{"a": 1}' --json"#,
        ]))
}

pub fn cmd_show() -> ClapCommand {
    ClapCommand::new("show")
        .about("Show the stored document of one job")
        .arg(Arg::new("job_id").required(true).help("64-character job id"))
}

pub fn cmd_remove() -> ClapCommand {
    ClapCommand::new("remove")
        .about("Remove a job and its storage areas")
        .arg(Arg::new("job_id").required(true).help("64-character job id"))
        .arg(force_flag("Remove even when the job is locked"))
}

pub fn cmd_clear() -> ClapCommand {
    ClapCommand::new("clear")
        .about("Remove every job")
        .arg(
            Arg::new("develop")
                .long("develop")
                .action(ArgAction::SetTrue)
                .help("Only remove jobs flagged as develop"),
        )
        .arg(force_flag("Remove locked jobs too"))
}

pub fn cmd_pulse() -> ClapCommand {
    ClapCommand::new("pulse").about("List the last heartbeat of every worker")
}

pub fn cmd_active() -> ClapCommand {
    ClapCommand::new("active")
        .about("List jobs with at least one executing worker")
        .arg(
            Arg::new("count")
                .long("count")
                .action(ArgAction::SetTrue)
                .help("Print only the number of active jobs"),
        )
}

pub fn cmd_sweep() -> ClapCommand {
    ClapCommand::new("sweep")
        .about("Reclaim workers that stopped beating")
        .arg(
            Arg::new("cutoff")
                .long("cutoff")
                .value_name("SECONDS")
                .value_parser(value_parser!(u64).range(1..))
                .help("Age after which a worker counts as dead (default: heartbeat.dead_after_secs)"),
        )
        .arg(
            Arg::new("tasks")
                .long("tasks")
                .action(ArgAction::SetTrue)
                .help("Also requeue tasks whose executor stopped touching them"),
        )
        .after_help(after_help_text(&[
            "jobmesh sweep",
            "jobmesh sweep --cutoff 600 --tasks --json",
        ]))
}

pub fn cmd_queue_stats() -> ClapCommand {
    ClapCommand::new("queue-stats").about("Show task queue counts by status")
}

pub fn build_cli() -> ClapCommand {
    ClapCommand::new("jobmesh")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Inspect and maintain a jobmesh coordination store")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(json_flag())
        .subcommand(cmd_register())
        .subcommand(cmd_find())
        .subcommand(cmd_show())
        .subcommand(cmd_remove())
        .subcommand(cmd_clear())
        .subcommand(cmd_pulse())
        .subcommand(cmd_active())
        .subcommand(cmd_sweep())
        .subcommand(cmd_queue_stats())
}
