//! Text and JSON output of a finished [`Report`].

use color_eyre::{eyre::Context as _, Result};
use comfy_table::{presets::UTF8_FULL, Cell, CellAlignment, Table};
use itertools::Itertools as _;

use crate::limits::GpuLimit;
use crate::report::{Report, ReportMode};
use crate::usage::UsageAggregate;

const NOT_AVAILABLE: &str = "N/A";

fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(header.to_vec());
    table
}

fn right(content: impl ToString) -> Cell {
    Cell::new(content).set_alignment(CellAlignment::Right)
}

fn partition_costs(aggregate: &UsageAggregate) -> Table {
    let mut partitions = table(&["Partition", "GPU Minutes", "Cost"]);
    for (partition, usage) in &aggregate.partitions {
        partitions.add_row(vec![
            Cell::new(partition),
            right(format!("{:.0}", usage.gpu_minutes())),
            right(format!("${:.2}", usage.cost().unwrap_or(0.0))),
        ]);
    }
    partitions
}

fn partition_hours(aggregate: &UsageAggregate) -> Table {
    let mut partitions = table(&["Partition", "GPU Hours"]);
    for (partition, usage) in &aggregate.partitions {
        partitions.add_row(vec![Cell::new(partition), right(format!("{:.2}", usage.gpu_hours()))]);
    }
    partitions
}

/// The user's limit in each of their accounts, prefixed by the account if there is more than one.
fn user_limits(report: &Report, user: &str, aggregate: &UsageAggregate) -> String {
    let limit = |account: &str| {
        report
            .limits
            .user(account, user)
            .map_or_else(|| NOT_AVAILABLE.to_owned(), GpuLimit::to_string)
    };
    match aggregate.accounts.iter().collect_vec().as_slice() {
        [account] => limit(account.as_str()),
        accounts => accounts
            .iter()
            .map(|account| format!("{account}: {}", limit(account.as_str())))
            .join("\n"),
    }
}

fn user_cost_table(report: &Report) -> Table {
    let mut users = table(&["User", "Account", "Partition Details", "Total Cost", "GPU Limit"]);
    for (user, aggregate) in &report.usage.entities {
        users.add_row(vec![
            Cell::new(user),
            Cell::new(aggregate.accounts.iter().join("\n")),
            Cell::new(partition_costs(aggregate)),
            right(format!("${:.2}", aggregate.total())),
            Cell::new(user_limits(report, user, aggregate)),
        ]);
    }
    users.add_row(vec![
        Cell::new("Total"),
        Cell::new(""),
        Cell::new(""),
        right(format!("${:.2}", report.usage.total())),
        Cell::new(""),
    ]);
    users
}

fn account_limit_summary(report: &Report) -> String {
    let lines = report.usage.accounts.iter().map(|account| match report.limits.account(account) {
        Some(GpuLimit { used, total: Some(total) }) => {
            format!("  Account {account}: Used: {:.0}, Total: {total:.0}\n", used.unwrap_or(0.0))
        }
        _ => format!("  Account {account}: {NOT_AVAILABLE}\n"),
    });
    format!("Account-level GPU Limits:\n{}", lines.collect::<String>())
}

fn account_hours_table(report: &Report) -> Table {
    let mut accounts = table(&["Account", "Partition Details", "Usage (GPU Hours)"]);
    for (account, aggregate) in &report.usage.entities {
        let limit = report
            .limits
            .account(account)
            .and_then(GpuLimit::total_hours)
            .map_or_else(|| "n/a".to_owned(), |hours| format!("{hours:.2}"));
        accounts.add_row(vec![
            Cell::new(account),
            Cell::new(partition_hours(aggregate)),
            right(format!("{:.2} / {limit}", aggregate.total())),
        ]);
    }
    accounts
}

/// Human readable report, as printed on the terminal.
pub fn text(report: &Report) -> String {
    let heading = format!("GPU Usage report from {} to {}", report.range.start, report.range.end);
    match report.mode {
        ReportMode::UserCost => format!(
            "{heading}\n{}\n\n{}",
            user_cost_table(report),
            account_limit_summary(report)
        ),
        ReportMode::AccountHours => format!("{heading}\n{}\n", account_hours_table(report)),
    }
}

pub fn json(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).context("serializing report")
}
