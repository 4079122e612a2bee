//! Who may see whose usage.

use std::collections::BTreeSet;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::slurm::{SlurmUser, UserFilter};

/// The user running the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub identity: SlurmUser,
    /// Only the configured superuser may look at other users' usage.
    pub privileged: bool,
}

impl Caller {
    pub fn new(identity: SlurmUser, superuser: &str) -> Self {
        let privileged = identity.as_str() == superuser;
        Caller { identity, privileged }
    }
}

/// What was asked for on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessRequest {
    pub username: Option<SlurmUser>,
    pub account: Option<String>,
}

/// What the report is allowed to query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    pub username: Option<SlurmUser>,
    pub account: Option<String>,
    /// The user coordinates `account`: show every member, not just the user.
    pub broaden_to_all_account_members: bool,
}

impl AccessDecision {
    /// Account-wide visibility supersedes the username.
    pub fn user_filter(&self) -> UserFilter {
        match &self.username {
            Some(user) if !self.broaden_to_all_account_members => UserFilter::User(user.clone()),
            _ => UserFilter::AllUsers,
        }
    }

    /// User to restrict the limit lookup to, if any.
    pub fn limit_user(&self) -> Option<&SlurmUser> {
        match self.user_filter() {
            UserFilter::User(_) => self.username.as_ref(),
            UserFilter::AllUsers => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("You don't have permission to view {requested}'s usage.")]
    PermissionDenied { caller: SlurmUser, requested: SlurmUser },
    #[error("As {caller}, you must specify either a username or an account.")]
    InvalidArguments { caller: SlurmUser },
}

/// Decide what `caller` may see of `request`.
///
/// `coordinators_of` is only asked when both an account and a username are in play. If it fails,
/// the caller is treated as a plain member of the account.
pub fn resolve<F>(caller: &Caller, request: AccessRequest, coordinators_of: F) -> Result<AccessDecision, AccessError>
where
    F: FnOnce(&str) -> color_eyre::Result<BTreeSet<SlurmUser>>,
{
    let AccessRequest { username, account } = request;

    let username = if caller.privileged {
        if username.is_none() && account.is_none() {
            return Err(AccessError::InvalidArguments {
                caller: caller.identity.clone(),
            });
        }
        username
    } else {
        if let Some(requested) = username.filter(|requested| *requested != caller.identity) {
            return Err(AccessError::PermissionDenied {
                caller: caller.identity.clone(),
                requested,
            });
        }
        Some(caller.identity.clone())
    };

    let broaden_to_all_account_members = match (&account, &username) {
        (Some(account), Some(user)) => match coordinators_of(account) {
            Ok(coordinators) => coordinators.contains(user),
            Err(e) => {
                warn!("{e:#}");
                warn!("treating {user} as a regular member of {account}");
                false
            }
        },
        _ => false,
    };
    if broaden_to_all_account_members {
        info!(?username, ?account, "coordinator, reporting all account members");
    }

    Ok(AccessDecision {
        username,
        account,
        broaden_to_all_account_members,
    })
}
