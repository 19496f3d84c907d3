use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use excise::{
    BackendKind, CancellationToken, Config, ConflictPolicy, HistoryRewriter, LocalCliBackend,
    MergeOutcome, RepoId, RewriteOptions,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "excise")]
#[command(about = "Remove commits from a branch's history")]
struct Cli {
    /// Configuration file (default: ./excise.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging; repeat for trace output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Remove commits from a branch and force-update it
    Remove {
        /// Repository as owner/name
        #[arg(long)]
        repo: RepoId,

        #[arg(long)]
        branch: String,

        /// Backend to try, in order (can be specified multiple times)
        #[arg(long = "backend", value_name = "KIND")]
        backends: Vec<BackendKind>,

        /// Give up after this many seconds (overrides the config file)
        #[arg(long)]
        deadline_secs: Option<u64>,

        /// Commits to remove, full or abbreviated
        #[arg(required = true)]
        commits: Vec<String>,
    },

    /// Show what `remove` would do without changing anything
    Plan {
        #[arg(long)]
        repo: RepoId,

        #[arg(long)]
        branch: String,

        #[arg(long = "backend", value_name = "KIND")]
        backends: Vec<BackendKind>,

        #[arg(required = true)]
        commits: Vec<String>,
    },

    /// List the commits of a branch, newest first
    Log {
        #[arg(long)]
        repo: RepoId,

        #[arg(long)]
        branch: String,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long = "backend", value_name = "KIND")]
        backends: Vec<BackendKind>,

        /// Print commits as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show how far one branch is ahead of and behind another
    Compare {
        #[arg(long)]
        repo: RepoId,

        #[arg(long)]
        base: String,

        #[arg(long)]
        head: String,

        /// Print the comparison as JSON
        #[arg(long)]
        json: bool,
    },

    /// Cherry-pick a single commit onto a branch in a private clone and push it
    Apply {
        #[arg(long)]
        repo: RepoId,

        #[arg(long)]
        branch: String,

        /// Commit to apply, full or abbreviated
        commit: String,
    },

    /// Merge one branch into another through the hosted API
    Merge {
        #[arg(long)]
        repo: RepoId,

        /// Branch receiving the merge
        #[arg(long)]
        base: String,

        /// Branch being merged
        #[arg(long)]
        head: String,

        /// Merge commit message (default: "Merge <head> into <base>")
        #[arg(long)]
        message: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;
    let token = config.token();

    match cli.command {
        Command::Remove {
            repo,
            branch,
            backends,
            deadline_secs,
            commits,
        } => {
            let cancel = CancellationToken::new();
            let options = RewriteOptions {
                deadline: deadline_secs
                    .map(Duration::from_secs)
                    .or_else(|| config.deadline()),
                cancel: cancel.clone(),
            };
            let rewriter = HistoryRewriter::new(
                config.build_backends(&pick_backends(&config, backends), token),
            )
            .with_options(options);

            println!(
                "Removing {} commit(s) from {repo}:{branch} using {}",
                commits.len(),
                rewriter.backend_names().join(" → ")
            );

            let mut task = tokio::task::spawn_blocking(move || {
                rewriter.rewrite_history(&repo, &branch, &commits)
            });
            let result = tokio::select! {
                joined = &mut task => joined.context("rewrite task panicked")?,
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("Cancelling; the branch is left untouched unless it was already published...");
                    cancel.cancel();
                    task.await.context("rewrite task panicked")?
                }
            };

            let result = result?;
            println!(
                "✓ {} → {} via {} ({} removed, {} replayed)",
                result.old_tip.short(),
                result.new_tip.short(),
                result.backend,
                result.removed.len(),
                result.replayed
            );
        }

        Command::Plan {
            repo,
            branch,
            backends,
            commits,
        } => {
            let rewriter = HistoryRewriter::new(
                config.build_backends(&pick_backends(&config, backends), token),
            );
            let plan = tokio::task::spawn_blocking(move || {
                rewriter.plan(&repo, &branch, &commits)
            })
            .await
            .context("plan task panicked")??;

            for commit in &plan.removed {
                println!("  drop   {} {}", commit.id.short(), commit.summary());
            }
            if plan.reroot_base {
                println!("  root   {} {}", plan.base.id.short(), plan.base.summary());
            } else {
                println!("  base   {} {}", plan.base.id.short(), plan.base.summary());
            }
            for step in &plan.steps {
                println!("  replay {} {}", step.commit.id.short(), step.commit.summary());
            }
        }

        Command::Log {
            repo,
            branch,
            limit,
            backends,
            json,
        } => {
            let rewriter = HistoryRewriter::new(
                config.build_backends(&pick_backends(&config, backends), token),
            );
            let commits = tokio::task::spawn_blocking(move || rewriter.log(&repo, &branch))
                .await
                .context("log task panicked")??;

            if json {
                let shown: Vec<_> = commits.iter().take(limit).collect();
                println!("{}", serde_json::to_string_pretty(&shown)?);
                return Ok(());
            }
            for commit in commits.iter().take(limit) {
                let marker = if commit.is_merge() { "M" } else { " " };
                println!(
                    "{marker} {} {} ({})",
                    commit.id.short(),
                    commit.summary(),
                    commit.author.name
                );
            }
        }

        Command::Compare {
            repo,
            base,
            head,
            json,
        } => {
            let client = config.hosted_backend(token).client(&repo);
            let label = format!("{base}...{head}");
            let comparison = tokio::task::spawn_blocking(move || client.compare(&base, &head))
                .await
                .context("compare task panicked")??;

            if json {
                println!("{}", serde_json::to_string_pretty(&comparison)?);
                return Ok(());
            }
            println!(
                "{label}: {} ({} ahead, {} behind)",
                comparison.status, comparison.ahead_by, comparison.behind_by
            );
            for commit in &comparison.commits {
                println!(
                    "  {} {} ({})",
                    commit.id.short(),
                    commit.summary(),
                    commit.author.name
                );
            }
        }

        Command::Apply {
            repo,
            branch,
            commit,
        } => {
            let backend = LocalCliBackend::new(config.local.clone(), token, ConflictPolicy::Abort);
            let applied = tokio::task::spawn_blocking(move || {
                backend.apply_commit(&repo, &branch, &commit)
            })
            .await
            .context("apply task panicked")??;
            println!("✓ Applied as {} {}", applied.id.short(), applied.summary());
        }

        Command::Merge {
            repo,
            base,
            head,
            message,
        } => {
            let client = config.hosted_backend(token).client(&repo);
            let outcome = tokio::task::spawn_blocking(move || {
                excise::merge_branches(&client, &base, &head, message.as_deref())
            })
            .await
            .context("merge task panicked")??;

            match outcome {
                MergeOutcome::AlreadyMerged => println!("Already merged, nothing to do."),
                MergeOutcome::Merged { sha } => println!("✓ Merged as {}", sha.short()),
                MergeOutcome::Conflict { message } => {
                    anyhow::bail!("merge conflict: {message}")
                }
            }
        }
    }

    Ok(())
}

fn pick_backends(config: &Config, requested: Vec<BackendKind>) -> Vec<BackendKind> {
    if requested.is_empty() {
        config.backends.clone()
    } else {
        requested
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "excise=info",
        1 => "excise=debug",
        _ => "excise=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
