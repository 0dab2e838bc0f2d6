//! Entry points a host invokes against a namespace's record tables.
//!
//! Every handler runs inside one [`RecordRepository::transact`] call, so a
//! failing invocation leaves no trace in the backend.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{LedgerError, Result};
use crate::model::{Table, TestRecord};
use crate::name::Name;
use crate::repository::RecordRepository;
use crate::storage::Backend;

pub const ADD_TEST: Name = Name::constant("addtest");
pub const ADD_TIME_TEST: Name = Name::constant("addtimetest");
pub const CLEAR_ALL: Name = Name::constant("clearall");
pub const CLEAR_ALL_TIMED: Name = Name::constant("clralltimes");

const ACTIVE: Name = Name::constant("active");

fn active_permission() -> Name {
    ACTIVE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub actor: Name,
    #[serde(default = "active_permission")]
    pub permission: Name,
}

impl Authorization {
    pub fn active(actor: Name) -> Self {
        Self { actor, permission: ACTIVE }
    }
}

/// Who an invocation runs as and which actors vouched for it. Actors are
/// taken at their word; nothing here checks signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionContext {
    pub receiver: Name,
    pub authorizations: Vec<Name>,
}

impl ActionContext {
    pub fn new(receiver: Name, authorizations: impl IntoIterator<Item = Name>) -> Self {
        Self {
            receiver,
            authorizations: authorizations.into_iter().collect(),
        }
    }

    pub fn has_auth(&self, actor: Name) -> bool {
        self.authorizations.contains(&actor)
    }

    pub fn require_auth(&self, actor: Name) -> Result<()> {
        if self.has_auth(actor) {
            Ok(())
        } else {
            Err(LedgerError::Unauthorized(actor))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddTestArgs {
    pub creator: Name,
    pub testid: Name,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub results: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearArgs {
    pub user: Name,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    AddTest(AddTestArgs),
    AddTimeTest(AddTestArgs),
    ClearAll(ClearArgs),
    ClearAllTimed(ClearArgs),
}

impl Action {
    /// Decodes the JSON argument object of the action called `name`.
    pub fn from_request(name: Name, data: serde_json::Value) -> Result<Self> {
        let bad_args = |e: serde_json::Error| LedgerError::InvalidArgument(format!("{}: {}", name, e));
        match name {
            n if n == ADD_TEST => Ok(Action::AddTest(serde_json::from_value(data).map_err(bad_args)?)),
            n if n == ADD_TIME_TEST => Ok(Action::AddTimeTest(serde_json::from_value(data).map_err(bad_args)?)),
            n if n == CLEAR_ALL => Ok(Action::ClearAll(serde_json::from_value(data).map_err(bad_args)?)),
            n if n == CLEAR_ALL_TIMED => Ok(Action::ClearAllTimed(serde_json::from_value(data).map_err(bad_args)?)),
            other => Err(LedgerError::UnknownAction(other)),
        }
    }

    pub fn name(&self) -> Name {
        match self {
            Action::AddTest(_) => ADD_TEST,
            Action::AddTimeTest(_) => ADD_TIME_TEST,
            Action::ClearAll(_) => CLEAR_ALL,
            Action::ClearAllTimed(_) => CLEAR_ALL_TIMED,
        }
    }

    pub fn data(&self) -> Result<serde_json::Value> {
        let value = match self {
            Action::AddTest(args) | Action::AddTimeTest(args) => serde_json::to_value(args)?,
            Action::ClearAll(args) | Action::ClearAllTimed(args) => serde_json::to_value(args)?,
        };
        Ok(value)
    }
}

/// An action as it arrives over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub account: Name,
    pub name: Name,
    #[serde(default)]
    pub authorization: Vec<Authorization>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ActionRequest {
    pub fn new(account: Name, action: &Action, authorization: Vec<Authorization>) -> Result<Self> {
        Ok(Self {
            account,
            name: action.name(),
            authorization,
            data: action.data()?,
        })
    }

    pub fn context(&self) -> ActionContext {
        ActionContext::new(self.account, self.authorization.iter().map(|a| a.actor))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddTestReceipt {
    pub id: u64,
    /// Number of results stored with the record
    pub size: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Added(AddTestReceipt),
    Cleared { removed: u64 },
}

/// The handlers for one repository. The namespace of every call is the
/// context's receiver.
pub struct Contract<B> {
    repo: RecordRepository<B>,
}

impl<B: Backend> Contract<B> {
    pub fn new(repo: RecordRepository<B>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &RecordRepository<B> {
        &self.repo
    }

    pub fn repository_mut(&mut self) -> &mut RecordRepository<B> {
        &mut self.repo
    }

    pub fn add_test(&mut self, ctx: &ActionContext, args: AddTestArgs) -> Result<AddTestReceipt> {
        self.add_to(Table::Tests, ctx, args)
    }

    pub fn add_time_test(&mut self, ctx: &ActionContext, args: AddTestArgs) -> Result<AddTestReceipt> {
        self.add_to(Table::TimedTests, ctx, args)
    }

    pub fn clear_all(&mut self, ctx: &ActionContext, args: ClearArgs) -> Result<u64> {
        self.clear(Table::Tests, ctx, args)
    }

    pub fn clear_all_timed(&mut self, ctx: &ActionContext, args: ClearArgs) -> Result<u64> {
        self.clear(Table::TimedTests, ctx, args)
    }

    pub fn dispatch(&mut self, ctx: &ActionContext, action: Action) -> Result<ActionOutcome> {
        debug!(receiver = %ctx.receiver, action = %action.name(), "dispatching");
        match action {
            Action::AddTest(args) => self.add_test(ctx, args).map(ActionOutcome::Added),
            Action::AddTimeTest(args) => self.add_time_test(ctx, args).map(ActionOutcome::Added),
            Action::ClearAll(args) => self.clear_all(ctx, args).map(|removed| ActionOutcome::Cleared { removed }),
            Action::ClearAllTimed(args) => {
                self.clear_all_timed(ctx, args).map(|removed| ActionOutcome::Cleared { removed })
            }
        }
    }

    fn add_to(&mut self, table: Table, ctx: &ActionContext, args: AddTestArgs) -> Result<AddTestReceipt> {
        ctx.require_auth(args.creator)?;
        let scope = ctx.receiver;
        let AddTestArgs { creator, testid, description, results } = args;
        let size = results.len() as u64;

        let receipt = self.repo.transact(|repo| {
            let mut timestamp = 0;
            let id = repo.table(table, scope).insert(|stamp| {
                timestamp = stamp.created_at;
                TestRecord::new(stamp, creator, testid, description, results)
            })?;
            Ok(AddTestReceipt { id, size, timestamp })
        })?;

        info!(
            scope = %scope,
            table = %table.name(),
            id = receipt.id,
            creator = %creator,
            testid = %testid,
            "test recorded"
        );
        Ok(receipt)
    }

    fn clear(&mut self, table: Table, ctx: &ActionContext, args: ClearArgs) -> Result<u64> {
        ctx.require_auth(ctx.receiver)?;
        let scope = ctx.receiver;
        let removed = self.repo.transact(|repo| repo.table(table, scope).drain_all())?;
        info!(scope = %scope, table = %table.name(), user = %args.user, removed, "table cleared");
        Ok(removed)
    }
}
