//! Integration tests for `dispatchcore`
//!
//! This crate wires the command, query and event buses to the in-memory
//! transaction manager the way an application would. The fixture below is
//! a small bank shared by the tests under `tests/`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use async_trait::async_trait;
use dispatchcore::{
    get_event_provider, install_unit_of_work, AggregateRoot, BoxError, CommandBus, CommandHandler,
    Context, EventBus, EventBusConfig, Message, Payload, QueryBus, QueryHandler, RegistrationError,
    TransactionManager,
};
use dispatchcore_memory::{InMemoryTransaction, InMemoryTransactionManager};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Domain failures of the bank.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BankError {
    /// An account with this owner already exists.
    #[error("account {0} already exists")]
    AccountExists(String),
    /// No account with this owner exists.
    #[error("account {0} not found")]
    UnknownAccount(String),
    /// Deposits must be positive.
    #[error("deposit amount must be positive, got {0}")]
    InvalidAmount(i64),
    /// The command ran without the transaction middleware.
    #[error("no transaction in scope")]
    NoTransaction,
}

/// Opens an account.
#[derive(Debug, Clone)]
pub struct OpenAccount {
    /// Account owner; also the storage key.
    pub owner: String,
    /// Initial balance.
    pub opening_balance: i64,
}
impl Message for OpenAccount {}

/// Adds money to an account.
#[derive(Debug, Clone)]
pub struct Deposit {
    /// Account owner.
    pub owner: String,
    /// Amount to add.
    pub amount: i64,
}
impl Message for Deposit {}

/// Emitted when an account was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountOpened {
    /// Account owner.
    pub owner: String,
    /// Initial balance.
    pub balance: i64,
}
impl Message for AccountOpened {}

/// Emitted when money was deposited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deposited {
    /// Account owner.
    pub owner: String,
    /// Amount added.
    pub amount: i64,
    /// Balance after the deposit.
    pub balance: i64,
}
impl Message for Deposited {}

/// Asks for the committed balance of an account.
#[derive(Debug, Clone)]
pub struct GetBalance {
    /// Account owner.
    pub owner: String,
}
impl Message for GetBalance {}

/// Answer to [`GetBalance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balance(pub i64);
impl Message for Balance {}

/// Stored form of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Account owner.
    pub owner: String,
    /// Current balance.
    pub balance: i64,
}

/// Account aggregate; records the events its operations raise.
#[derive(Debug)]
struct Account {
    record: AccountRecord,
    pending: Vec<Payload>,
}

impl Account {
    fn open(owner: &str, balance: i64) -> Self {
        Self {
            record: AccountRecord {
                owner: owner.to_string(),
                balance,
            },
            pending: vec![Payload::new(AccountOpened {
                owner: owner.to_string(),
                balance,
            })],
        }
    }

    const fn load(record: AccountRecord) -> Self {
        Self {
            record,
            pending: Vec::new(),
        }
    }

    fn deposit(&mut self, amount: i64) -> Result<(), BankError> {
        if amount <= 0 {
            return Err(BankError::InvalidAmount(amount));
        }
        self.record.balance += amount;
        self.pending.push(Payload::new(Deposited {
            owner: self.record.owner.clone(),
            amount,
            balance: self.record.balance,
        }));
        Ok(())
    }

    fn save(&self, transaction: &InMemoryTransaction) -> Result<(), BoxError> {
        transaction.put(self.record.owner.clone(), &self.record)?;
        Ok(())
    }
}

impl AggregateRoot for Account {
    fn take_events(&mut self) -> Vec<Payload> {
        std::mem::take(&mut self.pending)
    }
}

fn transaction_in(
    transactions: &InMemoryTransactionManager,
    ctx: &Context,
) -> Result<InMemoryTransaction, BankError> {
    transactions.transaction(ctx).ok_or(BankError::NoTransaction)
}

fn publish_from(ctx: &Context, account: &mut Account) {
    if let Some(provider) = get_event_provider(ctx) {
        provider.collect_from(account);
    }
}

struct OpenAccountHandler {
    transactions: InMemoryTransactionManager,
}

#[async_trait]
impl CommandHandler<OpenAccount> for OpenAccountHandler {
    async fn handle(&self, ctx: Context, command: Arc<OpenAccount>) -> Result<(), BoxError> {
        let transaction = transaction_in(&self.transactions, &ctx)?;
        if transaction.get::<AccountRecord>(&command.owner)?.is_some() {
            return Err(BankError::AccountExists(command.owner.clone()).into());
        }

        let mut account = Account::open(&command.owner, command.opening_balance);
        account.save(&transaction)?;
        publish_from(&ctx, &mut account);
        debug!(owner = %command.owner, "Opened account");
        Ok(())
    }
}

struct DepositHandler {
    transactions: InMemoryTransactionManager,
}

#[async_trait]
impl CommandHandler<Deposit> for DepositHandler {
    async fn handle(&self, ctx: Context, command: Arc<Deposit>) -> Result<(), BoxError> {
        let transaction = transaction_in(&self.transactions, &ctx)?;
        let record = transaction
            .get::<AccountRecord>(&command.owner)?
            .ok_or_else(|| BankError::UnknownAccount(command.owner.clone()))?;

        let mut account = Account::load(record);
        account.deposit(command.amount)?;
        account.save(&transaction)?;
        publish_from(&ctx, &mut account);
        Ok(())
    }
}

struct BalanceHandler {
    transactions: InMemoryTransactionManager,
}

#[async_trait]
impl QueryHandler<GetBalance> for BalanceHandler {
    type Output = Balance;

    async fn handle(&self, _ctx: Context, query: Arc<GetBalance>) -> Result<Balance, BoxError> {
        let record = self
            .transactions
            .store()
            .get::<AccountRecord>(&query.owner)?
            .ok_or_else(|| BankError::UnknownAccount(query.owner.clone()))?;
        Ok(Balance(record.balance))
    }
}

/// The three buses and the transaction manager, wired together.
#[derive(Debug)]
pub struct Bank {
    /// Command bus with the unit-of-work middleware installed.
    pub commands: Arc<CommandBus>,
    /// Query bus reading committed state.
    pub queries: QueryBus,
    /// Event bus receiving events after commit.
    pub events: Arc<EventBus>,
    /// Transaction manager over the bank's store.
    pub transactions: InMemoryTransactionManager,
}

impl Bank {
    /// Creates a bank with the default event bus configuration.
    pub fn new() -> Result<Self, RegistrationError> {
        Self::with_config(EventBusConfig::default())
    }

    /// Creates a bank whose event bus uses `config`.
    pub fn with_config(config: EventBusConfig) -> Result<Self, RegistrationError> {
        let transactions = InMemoryTransactionManager::new();
        let events = Arc::new(EventBus::with_config(config));
        let commands = Arc::new(CommandBus::new());
        install_unit_of_work(&commands, Arc::clone(&events), transactions.clone());

        commands.register_handler(OpenAccountHandler {
            transactions: transactions.clone(),
        })?;
        commands.register_handler(DepositHandler {
            transactions: transactions.clone(),
        })?;

        let queries = QueryBus::new();
        queries.register_handler(BalanceHandler {
            transactions: transactions.clone(),
        })?;

        Ok(Self {
            commands,
            queries,
            events,
            transactions,
        })
    }

    /// Committed record of `owner`.
    pub fn account(&self, owner: &str) -> Option<AccountRecord> {
        self.transactions
            .store()
            .get::<AccountRecord>(owner)
            .ok()
            .flatten()
    }
}
