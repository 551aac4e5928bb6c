//! CLI module
//!
//! This module provides the command-line interface for cortexpropel.

use std::io;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use colored::Colorize;

use crate::{
    api::HttpGateway,
    config::Config,
    manager::{ChatOutcome, TaskManager},
    models::{Priority, TaskFields, TaskNode, TaskQuery, TaskStatus, TaskTree, ROOT_ID},
    reconcile::{OperationEffect, Strategy, TaskSummary},
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding the task tree and the metadata database
    #[arg(short, long, env = "CORTEX_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Allow completed or cancelled tasks to be re-opened
    #[arg(long)]
    allow_reopen: bool,

    /// Do not recompute parent progress after changes
    #[arg(long)]
    no_rollup: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Describe a change in natural language and let the model apply it
    Chat {
        /// What you want to do, e.g. "明天要买菜和做饭"
        #[arg(required = true)]
        text: Vec<String>,
    },

    /// Add a task directly
    Add {
        /// Task title
        title: String,

        /// Parent task id
        #[arg(short, long, default_value = ROOT_ID)]
        parent: String,

        /// Task description
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Print the task tree
    List,

    /// Show one task with its metadata row
    Show {
        /// Task id
        id: String,
    },

    /// Update fields of a task
    Update {
        /// Task id
        id: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        description: Option<String>,

        /// pending, in_progress, completed or cancelled
        #[arg(long)]
        status: Option<TaskStatus>,

        /// low, medium, high or critical
        #[arg(long)]
        priority: Option<Priority>,

        /// 0-100
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
        progress: Option<u8>,

        #[arg(long)]
        assignee: Option<String>,

        #[arg(long)]
        estimated_hours: Option<f64>,
    },

    /// Search tasks by text and filters
    Find {
        /// Text to look for in titles and descriptions
        text: Option<String>,

        #[arg(long)]
        status: Option<TaskStatus>,

        #[arg(long)]
        priority: Option<Priority>,

        /// Required tag, may be repeated
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Only direct children of this task
        #[arg(long)]
        parent: Option<String>,
    },

    /// Delete a task and all of its subtasks
    Delete {
        /// Task id
        id: String,
    },

    /// Drop every task and start from an empty root
    Reset,

    /// Rebuild the metadata database from the task tree
    Sync,

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    fn config(&self) -> Result<Config, Box<dyn std::error::Error>> {
        let mut config = Config::from_env()?;
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if self.allow_reopen {
            config.reconcile.allow_reopen = true;
        }
        if self.no_rollup {
            config.reconcile.auto_rollup = false;
        }
        Ok(config)
    }
}

/// Run the CLI application
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        let bin_name = cmd.get_name().to_string();
        generate(*shell, &mut cmd, bin_name, &mut io::stdout());
        return Ok(());
    }

    let config = cli.config()?;
    let mut manager: TaskManager = TaskManager::open(&config)?;

    match cli.command {
        Commands::Chat { text } => {
            let gateway = HttpGateway::new(config.gateway.clone())?;
            let mut manager = manager.with_gateway(gateway);
            let outcome = manager.process_input(&text.join(" ")).await?;
            print_outcome(&outcome);
        }

        Commands::Add {
            title,
            parent,
            description,
        } => {
            let mut fields = TaskFields::titled(title);
            fields.description = description;
            let id = manager.add_task(&parent, fields)?;
            println!("Added task {}", id.cyan());
        }

        Commands::List => {
            let tree = manager.tree()?;
            print_tree(&tree);
            let overview = manager.overview()?;
            let stats = &overview.stats;
            println!();
            println!(
                "{} tasks, average progress {}%, {} metadata rows",
                stats.total, stats.average_progress, overview.mirror_rows
            );
            for (status, count) in &stats.by_status {
                println!("  {}: {}", paint_status(*status), count);
            }
        }

        Commands::Show { id } => match manager.task(&id)? {
            Some(task) => {
                print_task_detail(&task);
                if let Some(record) = manager.record(&id)? {
                    if let Some(assignee) = &record.assigned_to {
                        println!("Assigned to: {}", assignee);
                    }
                    if let Some(hours) = record.estimated_hours {
                        println!("Estimated hours: {}", hours);
                    }
                    if let Some(hours) = record.actual_hours {
                        println!("Actual hours: {}", hours);
                    }
                    if !record.dependencies.is_empty() {
                        println!("Depends on: {}", record.dependencies.join(", "));
                    }
                    if let Some(notes) = &record.notes {
                        println!("Notes: {}", notes);
                    }
                }
            }
            None => println!("No task with id {}", id.red()),
        },

        Commands::Update {
            id,
            title,
            description,
            status,
            priority,
            progress,
            assignee,
            estimated_hours,
        } => {
            let mut fields = TaskFields {
                title,
                description,
                status,
                priority,
                progress,
                ..TaskFields::default()
            };
            fields.extension.assigned_to = assignee;
            fields.extension.estimated_hours = estimated_hours;
            manager.update_task(&id, fields)?;
            if let Some(task) = manager.task(&id)? {
                print_task_detail(&task);
            }
        }

        Commands::Find {
            text,
            status,
            priority,
            tags,
            parent,
        } => {
            let query = TaskQuery {
                text,
                status,
                priority,
                tags: (!tags.is_empty()).then_some(tags),
                parent_id: parent,
                ..TaskQuery::default()
            };
            let matches = manager.query(&query)?;
            if matches.is_empty() {
                println!("No matching tasks");
            }
            for task in &matches {
                print_summary(task);
            }
        }

        Commands::Delete { id } => {
            let count = manager.delete_task(&id)?;
            println!("Deleted {} task(s)", count);
        }

        Commands::Reset => {
            manager.reset_tree()?;
            println!("Task tree reset");
        }

        Commands::Sync => {
            let report = manager.resync()?;
            println!(
                "Synced {} row(s), removed {} stale row(s)",
                report.upserted, report.removed
            );
        }

        Commands::Completions { .. } => {}
    }
    Ok(())
}

fn paint_status(status: TaskStatus) -> colored::ColoredString {
    match status {
        TaskStatus::Pending => status.as_str().normal(),
        TaskStatus::InProgress => status.as_str().yellow(),
        TaskStatus::Completed => status.as_str().green(),
        TaskStatus::Cancelled => status.as_str().dimmed(),
    }
}

fn print_outcome(outcome: &ChatOutcome) {
    if let Some(message) = &outcome.message {
        println!("{}", message.bold());
    }
    if let Some(diagnostic) = &outcome.diagnostic {
        println!("{} {}", "warning:".yellow(), diagnostic);
    }

    match outcome.strategy {
        Strategy::OperationList => {
            for item in &outcome.report.outcomes {
                match &item.result {
                    Ok(OperationEffect::Added { id }) => println!("  + added {}", id.cyan()),
                    Ok(OperationEffect::Updated { id }) => println!("  ~ updated {}", id.cyan()),
                    Ok(OperationEffect::Deleted { id, count }) => {
                        println!("  - deleted {} ({} task(s))", id.cyan(), count)
                    }
                    Ok(OperationEffect::Queried { matches }) => {
                        println!("  ? {} match(es)", matches.len());
                        for task in matches {
                            print!("    ");
                            print_summary(task);
                        }
                    }
                    Err(err) => println!("  {} operation {}: {}", "!".red(), item.index, err),
                }
            }
        }
        Strategy::FullReplacement => {
            println!(
                "Replaced the task tree ({} new id(s) assigned)",
                outcome.report.mapping.generated()
            );
        }
    }

    println!();
    print_tree(&outcome.tree);
}

fn print_summary(task: &TaskSummary) {
    println!(
        "  {} {} [{}] {}%",
        task.id.cyan(),
        task.title,
        paint_status(task.status),
        task.progress
    );
}

fn print_tree(tree: &TaskTree) {
    println!("{}", tree.root().title().bold());
    if tree.is_empty() {
        println!("  No tasks yet. Add some with 'cortexpropel chat' or 'cortexpropel add'");
        return;
    }
    for task in tree.root().subtasks() {
        print_task(task, 1);
    }
}

/// Recursively prints a task and its subtasks with indentation
fn print_task(task: &TaskNode, depth: usize) {
    let indent = "  ".repeat(depth);
    let marker = match task.status() {
        TaskStatus::Completed => "[✓]",
        TaskStatus::Cancelled => "[x]",
        TaskStatus::InProgress => "[~]",
        TaskStatus::Pending => "[ ]",
    };
    println!(
        "{}{} {} {}% ({})",
        indent,
        marker,
        task.title(),
        task.progress(),
        task.id().dimmed()
    );
    for subtask in task.subtasks() {
        print_task(subtask, depth + 1);
    }
}

fn print_task_detail(task: &TaskNode) {
    println!("{} {}", task.title().bold(), task.id().dimmed());
    if !task.description().is_empty() {
        println!("{}", task.description());
    }
    println!("Status: {}  Progress: {}%", paint_status(task.status()), task.progress());
    if let Some(priority) = task.priority() {
        println!("Priority: {}", priority);
    }
    if let Some(due) = task.due_date() {
        println!("Due: {}", due);
    }
    if let Some(tags) = task.tags() {
        println!("Tags: {}", tags.join(", "));
    }
    println!("Subtasks: {}", task.subtasks().len());
    println!(
        "Created: {}  Updated: {}",
        task.created_at().to_rfc3339(),
        task.updated_at().to_rfc3339()
    );
}
