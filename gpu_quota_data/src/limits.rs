//! Fair-share GPU limits (`sshare`), per account and per user.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use derive_more::derive::{Deref, Into};
use itertools::Itertools as _;
use serde::Serialize;
use tracing::{debug, warn};

use crate::misc::parsing::tres::{self, TresList};
use crate::slurm::{self, CommandRunner, SlurmUser};

/// Which `sshare` columns are requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitShape {
    /// `Account|User|GrpTRESRaw|GrpTRESMins`, one row for the account plus one per user.
    PerUser,
    /// `Account|GrpTRESMins`, only the configured limit.
    AccountOnly,
}

impl LimitShape {
    pub fn format(self) -> &'static str {
        match self {
            LimitShape::PerUser => "Account,User,GrpTRESRaw,GrpTRESMins",
            LimitShape::AccountOnly => "Account,GrpTRESMins",
        }
    }
}

/// GPU-minutes used towards a limit, and the limit itself. `None` means SLURM reported nothing
/// usable, which is different from zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GpuLimit {
    pub used: Option<f64>,
    pub total: Option<f64>,
}

impl GpuLimit {
    fn from_fields(used: Option<&str>, total: &str) -> Self {
        GpuLimit {
            used: used.and_then(|used| TresList::parse(used).amount(tres::GPU)),
            total: TresList::parse(total).amount(tres::GPU),
        }
    }

    pub fn total_hours(&self) -> Option<f64> {
        self.total.map(|minutes| minutes / 60.0)
    }
}

impl Display for GpuLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total {
            Some(total) => write!(f, "{:.0}/{:.0}", self.used.unwrap_or(0.0), total),
            None => f.write_str("N/A"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AccountLimits {
    /// The `sshare` query for this account failed.
    Unavailable,
    Known {
        account: Option<GpuLimit>,
        users: BTreeMap<String, GpuLimit>,
    },
}

impl AccountLimits {
    pub fn account(&self) -> Option<&GpuLimit> {
        match self {
            AccountLimits::Known { account, .. } => account.as_ref(),
            AccountLimits::Unavailable => None,
        }
    }

    pub fn user(&self, user: &str) -> Option<&GpuLimit> {
        match self {
            AccountLimits::Known { users, .. } => users.get(user),
            AccountLimits::Unavailable => None,
        }
    }
}

/// Parse `sshare -n -P` output for `account`.
///
/// `sshare` indents account names by their depth in the hierarchy, so the account field is trimmed
/// before comparing. Rows belonging to other (sub-)accounts and rows with too few fields are
/// skipped.
pub fn parse_limits(output: &str, account: &str, shape: LimitShape) -> AccountLimits {
    let mut account_limit = None;
    let mut users = BTreeMap::new();

    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        let fields = line.split('|').collect_vec();
        match (shape, fields.as_slice()) {
            (LimitShape::PerUser, &[acc, user, used, total, ..]) => {
                if acc.trim() != account {
                    debug!(line, account, "skipping sshare row of another account");
                    continue;
                }
                let limit = GpuLimit::from_fields(Some(used), total);
                match user.trim() {
                    "" => {
                        account_limit.get_or_insert(limit);
                    }
                    user => {
                        users.insert(user.to_owned(), limit);
                    }
                }
            }
            (LimitShape::AccountOnly, &[acc, total, ..]) => {
                if acc.trim() == account && account_limit.is_none() {
                    account_limit = Some(GpuLimit::from_fields(None, total));
                }
            }
            _ => debug!(line, account, "unexpected sshare output format, skipping"),
        }
    }

    AccountLimits::Known {
        account: account_limit,
        users,
    }
}

/// Limits of every queried account, keyed by account name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deref, Into)]
pub struct LimitTable(BTreeMap<String, AccountLimits>);

impl LimitTable {
    /// Query `sshare` once per account. A failed query only marks that account
    /// [`AccountLimits::Unavailable`].
    #[tracing::instrument(skip(runner, accounts))]
    pub fn lookup<'a>(
        runner: &impl CommandRunner,
        accounts: impl IntoIterator<Item = &'a str>,
        user: Option<&SlurmUser>,
        shape: LimitShape,
    ) -> Self {
        let table = accounts
            .into_iter()
            .map(|account| {
                let limits = match runner.run("sshare", &slurm::limit_query_args(account, user, shape)) {
                    Ok(output) => parse_limits(&output, account, shape),
                    Err(e) => {
                        warn!("querying GPU limits of account {account}: {e:#}");
                        AccountLimits::Unavailable
                    }
                };
                (account.to_owned(), limits)
            })
            .collect();
        LimitTable(table)
    }

    pub fn account(&self, account: &str) -> Option<&GpuLimit> {
        self.0.get(account)?.account()
    }

    pub fn user(&self, account: &str, user: &str) -> Option<&GpuLimit> {
        self.0.get(account)?.user(user)
    }
}

impl FromIterator<(String, AccountLimits)> for LimitTable {
    fn from_iter<T: IntoIterator<Item = (String, AccountLimits)>>(iter: T) -> Self {
        LimitTable(iter.into_iter().collect())
    }
}
