use std::collections::BTreeSet;
use std::fmt::Debug;
use std::process::Command;

use chrono::NaiveDate;
use color_eyre::eyre::{eyre, Context as _};
use color_eyre::{Result, Section as _, SectionExt as _};
use derive_more::derive::{Deref, Display, From, Into};
use itertools::Itertools as _;
use serde::Serialize;
use tracing::debug;

use crate::limits::LimitShape;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deref, Display, From, Into, Serialize)]
pub struct SlurmUser(pub String);

impl From<&str> for SlurmUser {
    fn from(value: &str) -> Self {
        SlurmUser(value.to_owned())
    }
}

/// `sacct` takes plain `YYYY-MM-DD` dates and interprets them as local midnight.
pub fn format_date_for_slurm(date: NaiveDate) -> String {
    const FMT: &str = "%Y-%m-%d";
    date.format(FMT).to_string()
}

/// Runs an external SLURM client and returns its stdout.
///
/// Everything that talks to the accounting database goes through this, so the pipeline can be fed
/// canned output in tests.
pub trait CommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String>;
}

/// [`CommandRunner`] backed by the SLURM command line tools on `$PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlurmCli;

impl CommandRunner for SlurmCli {
    #[tracing::instrument(skip(self))]
    fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .wrap_err_with(|| format!("executing `{program}`"))?;

        if !output.status.success() {
            return Err(eyre!("{program} failed with status {:?}", output.status.code())
                .with_section(|| format!("{program} {}", args.join(" ")).header("Command:"))
                .note(String::from_utf8_lossy(&output.stderr).trim().to_string().header("Stderr:")));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!(program, lines = stdout.lines().count(), "query finished");
        Ok(stdout)
    }
}

/// Fields requested from `sacct`, in the order the usage aggregator expects them.
pub const SACCT_FORMAT: &str = "JobID,User,ElapsedRaw,AllocTRES,Partition,Account";

/// Whose jobs a usage query returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserFilter {
    User(SlurmUser),
    /// Every user the account database lets us see (`sacct -a`).
    AllUsers,
}

/// `sacct` invocation for all allocations in a date range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageQuery<'a> {
    pub start: NaiveDate,
    /// Already includes the accounting lag buffer.
    pub end: NaiveDate,
    pub account: Option<&'a str>,
    pub users: UserFilter,
    pub qos: &'a [String],
}

impl UsageQuery<'_> {
    pub const PROGRAM: &'static str = "sacct";

    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-n", "-P", "-X"].into_iter().map(String::from).collect();
        args.extend([
            "-S".to_owned(),
            format_date_for_slurm(self.start),
            "-E".to_owned(),
            format_date_for_slurm(self.end),
            format!("--format={SACCT_FORMAT}"),
        ]);
        if !self.qos.is_empty() {
            args.push(format!("--qos={}", self.qos.iter().join(",")));
        }
        args.push("--truncate".to_owned());

        if let Some(account) = self.account {
            args.extend(["-A".to_owned(), account.to_owned()]);
        }
        match &self.users {
            UserFilter::AllUsers => args.push("-a".to_owned()),
            UserFilter::User(user) => args.extend(["-u".to_owned(), user.to_string()]),
        }
        args
    }

    /// Raw job lines. A failure here is fatal for the report, so it's propagated.
    #[tracing::instrument(skip(runner))]
    pub fn fetch(&self, runner: &impl CommandRunner) -> Result<String> {
        runner
            .run(Self::PROGRAM, &self.args())
            .wrap_err("querying job accounting data")
    }
}

/// `sacctmgr show account <account> withcoord`
pub fn coordinator_query_args(account: &str) -> Vec<String> {
    ["show", "account", account, "withcoord", "-n", "-P"].into_iter().map(String::from).collect()
}

/// Coordinators of `account`, from `account|description|organization|coord1,coord2` rows.
///
/// Rows for other accounts (`sacctmgr` matches case-insensitively) and rows with fewer than four
/// fields are ignored.
pub fn parse_coordinators(output: &str, account: &str) -> BTreeSet<SlurmUser> {
    output
        .lines()
        .map(|line| line.split('|').collect_vec())
        .filter(|fields| fields.len() >= 4 && fields[0].trim() == account)
        .flat_map(|fields| {
            fields[3]
                .split(',')
                .map(str::trim)
                .filter(|coord| !coord.is_empty())
                .map(SlurmUser::from)
                .collect_vec()
        })
        .collect()
}

#[tracing::instrument(skip(runner))]
pub fn coordinators(runner: &impl CommandRunner, account: &str) -> Result<BTreeSet<SlurmUser>> {
    let output = runner
        .run("sacctmgr", &coordinator_query_args(account))
        .wrap_err_with(|| format!("checking coordinators of account {account}"))?;
    Ok(parse_coordinators(&output, account))
}

/// `sshare` invocation for the fair-share limits of one account.
pub fn limit_query_args(account: &str, user: Option<&SlurmUser>, shape: LimitShape) -> Vec<String> {
    let mut args: Vec<String> = ["-A", account, "-n", "-P", "-o", shape.format()]
        .into_iter()
        .map(String::from)
        .collect();
    if let Some(user) = user {
        args.extend(["-u".to_owned(), user.to_string()]);
    }
    args
}

#[allow(non_snake_case)]
#[cfg(test)]
mod test {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn UsageQuery__args__single_user() {
        let qos = vec!["normal_qos".to_owned(), "large_qos".to_owned()];
        let query = UsageQuery {
            start: date(2024, 3, 1),
            end: date(2024, 3, 16),
            account: None,
            users: UserFilter::User("alice".into()),
            qos: &qos,
        };
        assert_eq!(
            query.args().join(" "),
            "-n -P -X -S 2024-03-01 -E 2024-03-16 --format=JobID,User,ElapsedRaw,AllocTRES,Partition,Account \
             --qos=normal_qos,large_qos --truncate -u alice"
        );
    }

    #[test]
    fn UsageQuery__args__account_wide_never_filters_user() {
        let query = UsageQuery {
            start: date(2024, 3, 1),
            end: date(2024, 3, 2),
            account: Some("acctA"),
            users: UserFilter::AllUsers,
            qos: &[],
        };
        let args = query.args();
        assert!(!args.iter().any(|arg| arg == "-u"));
        assert!(!args.iter().any(|arg| arg.starts_with("--qos")));
        assert!(args.ends_with(&["-A".to_owned(), "acctA".to_owned(), "-a".to_owned()]));
    }

    #[test]
    fn parse_coordinators__matches_exact_account() {
        let output = "acctA|Group A|org|bob,carol\nacctAB|Other|org|dave\nbroken|line\n";
        let coords = parse_coordinators(output, "acctA");
        assert_eq!(coords, BTreeSet::from(["bob".into(), "carol".into()]));
        assert!(parse_coordinators(output, "acctC").is_empty());
    }

    #[test]
    fn parse_coordinators__no_coordinators() {
        assert!(parse_coordinators("acctA|Group A|org|\n", "acctA").is_empty());
    }

    #[test]
    fn limit_query_args__shapes() {
        let alice = SlurmUser::from("alice");
        assert_eq!(
            limit_query_args("acctA", Some(&alice), LimitShape::PerUser).join(" "),
            "-A acctA -n -P -o Account,User,GrpTRESRaw,GrpTRESMins -u alice"
        );
        assert_eq!(
            limit_query_args("acctA", None, LimitShape::AccountOnly).join(" "),
            "-A acctA -n -P -o Account,GrpTRESMins"
        );
    }
}
