use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{Datelike as _, Duration, NaiveDate};
use color_eyre::eyre::{bail, ensure};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::access::AccessDecision;
use crate::limits::{LimitShape, LimitTable};
use crate::slurm::{CommandRunner, UsageQuery};
use crate::usage::{CostTable, UsageAggregator, UsageReport};

/// Which report to produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportMode {
    /// GPU minutes and cost per user and partition, with per-user limits.
    #[default]
    UserCost,
    /// GPU hours per account and partition, against the account limit.
    AccountHours,
}

impl ReportMode {
    pub const ALL: [ReportMode; 2] = [ReportMode::UserCost, ReportMode::AccountHours];

    pub fn name(self) -> &'static str {
        match self {
            ReportMode::UserCost => "user-cost",
            ReportMode::AccountHours => "account-hours",
        }
    }

    pub fn limit_shape(self) -> LimitShape {
        match self {
            ReportMode::UserCost => LimitShape::PerUser,
            ReportMode::AccountHours => LimitShape::AccountOnly,
        }
    }
}

impl Display for ReportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReportMode {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match ReportMode::ALL.into_iter().find(|mode| mode.name() == s) {
            Some(mode) => Ok(mode),
            None => bail!("unknown report mode `{s}` (expected `user-cost` or `account-hours`)"),
        }
    }
}

/// Inclusive range of days to report on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        ensure!(start <= end, "start date {start} is after end date {end}");
        Ok(DateRange { start, end })
    }

    /// First of the month up to `today`.
    pub fn month_to_date(today: NaiveDate) -> Self {
        DateRange {
            start: today.with_day(1).unwrap_or(today),
            end: today,
        }
    }

    /// End date to hand to `sacct`: the last instant of `end`, pushed back by `lag` so that jobs the
    /// accounting database hasn't caught up with yet still land in the range.
    pub fn query_end(&self, lag: Duration) -> NaiveDate {
        (Duration::days(1) - Duration::nanoseconds(1))
            .checked_add(&lag)
            .zip(self.end.and_hms_opt(0, 0, 0))
            .and_then(|(offset, midnight)| midnight.checked_add_signed(offset))
            .map_or(self.end, |end| end.date())
    }

    /// Recent jobs may not be accounted for yet if the range ends today.
    pub fn ends_on(&self, today: NaiveDate) -> bool {
        self.end == today
    }
}

/// Everything a report needs besides the access decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportParams {
    pub range: DateRange,
    pub accounting_lag: Duration,
    /// QOS labels the job query is restricted to.
    pub qos: Vec<String>,
    pub mode: ReportMode,
    pub costs: CostTable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub range: DateRange,
    pub mode: ReportMode,
    pub access: AccessDecision,
    pub usage: UsageReport,
    pub limits: LimitTable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    /// No GPU job matched; not an error.
    NoUsage,
    Ready(Report),
}

/// Fetch usage, aggregate it, then fetch the limits of every account that showed up.
///
/// Only the usage query can fail the report. Limit lookups degrade per account.
#[tracing::instrument(skip(runner, params), fields(mode = %params.mode))]
pub fn generate(runner: &impl CommandRunner, access: &AccessDecision, params: &ReportParams) -> Result<ReportOutcome> {
    let query = UsageQuery {
        start: params.range.start,
        end: params.range.query_end(params.accounting_lag),
        account: access.account.as_deref(),
        users: access.user_filter(),
        qos: &params.qos,
    };
    let jobs = query.fetch(runner)?;

    let usage = UsageAggregator::new(params.mode, &params.costs).aggregate(jobs.lines());
    if usage.is_empty() {
        info!("no GPU usage in range");
        return Ok(ReportOutcome::NoUsage);
    }
    info!(entities = usage.entities.len(), accounts = usage.accounts.len(), "aggregated usage");

    let limit_user = match params.mode.limit_shape() {
        LimitShape::PerUser => access.limit_user(),
        LimitShape::AccountOnly => None,
    };
    let limits = LimitTable::lookup(
        runner,
        usage.accounts.iter().map(String::as_str),
        limit_user,
        params.mode.limit_shape(),
    );

    Ok(ReportOutcome::Ready(Report {
        range: params.range,
        mode: params.mode,
        access: access.clone(),
        usage,
        limits,
    }))
}
