use std::path::PathBuf;

use chrono::NaiveDate;
use clap::Parser;
use gpu_quota_data::report::ReportMode;
use tracing::Level;

/// GPU usage, cost and fair-share limits from the SLURM accounting database.
#[derive(Debug, Clone, PartialEq, Parser)]
#[command(version, about)]
pub struct Args {
    /// User to report on. Only the superuser may name someone else.
    #[arg(short, long)]
    pub username: Option<String>,

    /// Same as `--username`.
    #[arg(value_name = "USERNAME", conflicts_with = "username")]
    pub positional_username: Option<String>,

    /// First day of the report, YYYY-MM-DD [default: first of the current month]
    #[arg(short = 'S', long)]
    pub start: Option<NaiveDate>,

    /// Last day of the report (inclusive), YYYY-MM-DD [default: today]
    #[arg(short = 'E', long)]
    pub end: Option<NaiveDate>,

    /// Restrict the report to one account. Coordinators of the account see all its members.
    #[arg(short = 'A', long)]
    pub account: Option<String>,

    /// `user-cost` or `account-hours` [default: from the configuration]
    #[arg(long)]
    pub mode: Option<ReportMode>,

    /// Print the aggregates as JSON instead of tables
    #[arg(long)]
    pub json: bool,

    /// Additional configuration file, applied after the system wide one
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long, default_value_t = Level::WARN)]
    pub log_level: Level,
}

impl Args {
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref().or(self.positional_username.as_deref())
    }
}
