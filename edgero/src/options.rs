//! Retry, transaction and session options.
use std::{
    collections::{BTreeMap, HashMap},
    fmt::{self, Write},
    sync::Arc,
    time::Duration,
};

use crate::{Error, ErrorKind};

/// Backoff function, maps the attempt number (starting at 1) to a delay.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Exponential backoff with jitter: `2^attempt * 100ms + random(0..100)ms`.
pub fn default_backoff(attempt: u32) -> Duration {
    let base = 2u64.saturating_pow(attempt).saturating_mul(100);
    Duration::from_millis(base + rand::random_range(0..100))
}

/// Category of retryable errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryCondition {
    /// Transaction conflict other than a deadlock.
    SerializationError,
    Deadlock,
    /// Connection errors.
    NetworkError,
}

/// Number of attempts and the delay between them.
#[derive(Clone)]
pub struct RetryRule {
    pub attempts: u32,
    pub backoff: BackoffFn,
}

impl RetryRule {
    pub fn new(attempts: u32, backoff: impl Fn(u32) -> Duration + Send + Sync + 'static) -> RetryRule {
        Self { attempts, backoff: Arc::new(backoff) }
    }

    /// Delay before the given attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        (self.backoff)(attempt)
    }
}

impl Default for RetryRule {
    fn default() -> Self {
        Self::new(3, default_backoff)
    }
}

impl fmt::Debug for RetryRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryRule").field("attempts", &self.attempts).finish_non_exhaustive()
    }
}

/// Retry rules for each [`RetryCondition`].
///
/// ```
/// use edgero::{RetryCondition, RetryOptions, RetryRule};
/// use std::time::Duration;
///
/// let options = RetryOptions::defaults()
///     .with_rule(RetryCondition::NetworkError, RetryRule::new(5, |_| Duration::from_millis(10)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    default: RetryRule,
    overrides: HashMap<RetryCondition, RetryRule>,
}

impl RetryOptions {
    pub fn new(attempts: u32, backoff: impl Fn(u32) -> Duration + Send + Sync + 'static) -> RetryOptions {
        Self { default: RetryRule::new(attempts, backoff), overrides: HashMap::new() }
    }

    /// Three attempts with [`default_backoff`].
    pub fn defaults() -> RetryOptions {
        Self::default()
    }

    /// Returns new options with the rule for `condition` replaced.
    pub fn with_rule(&self, condition: RetryCondition, rule: RetryRule) -> RetryOptions {
        let mut me = self.clone();
        me.overrides.insert(condition, rule);
        me
    }

    /// Returns new options with the default rule replaced.
    pub fn with_default(&self, rule: RetryRule) -> RetryOptions {
        Self { default: rule, overrides: self.overrides.clone() }
    }

    /// Select the rule applied to `err`.
    pub fn rule_for(&self, err: &Error) -> &RetryRule {
        let condition = if err.is(ErrorKind::TransactionDeadlock) {
            RetryCondition::Deadlock
        } else if err.is(ErrorKind::TransactionConflict) {
            RetryCondition::SerializationError
        } else if err.is(ErrorKind::Client) {
            RetryCondition::NetworkError
        } else {
            return &self.default;
        };
        self.overrides.get(&condition).unwrap_or(&self.default)
    }
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    Serializable,
    RepeatableRead,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::Serializable => "SERIALIZABLE",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for `START TRANSACTION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionOptions {
    pub isolation: IsolationLevel,
    pub readonly: bool,
    pub deferrable: bool,
}

impl TransactionOptions {
    pub fn new() -> TransactionOptions {
        Self::default()
    }

    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn deferrable(mut self, deferrable: bool) -> Self {
        self.deferrable = deferrable;
        self
    }

    /// Returns the `START TRANSACTION` statement.
    pub fn start_statement(&self) -> String {
        format!(
            "START TRANSACTION ISOLATION {}, {}, {}DEFERRABLE",
            self.isolation,
            if self.readonly { "READ ONLY" } else { "READ WRITE" },
            if self.deferrable { "" } else { "NOT " },
        )
    }
}

const DEFAULT_MODULE: &str = "default";

/// Session state applied to a connection before it runs queries.
///
/// Config and global values are EdgeQL expressions, for example
/// `"<duration>'10 seconds'"`. Global names without a module are
/// qualified with [`module`][Session::module].
///
/// ```
/// use edgero::options::Session;
///
/// let session = Session::new()
///     .with_module_aliases([("module", "app"), ("sys", "schema")])
///     .with_config([("allow_user_specified_id", "true")])
///     .with_globals([("current_user", "'alice'")]);
///
/// assert_eq!(session.module(), "app");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    module: String,
    aliases: BTreeMap<String, String>,
    config: BTreeMap<String, String>,
    globals: BTreeMap<String, String>,
}

impl Session {
    pub fn new() -> Session {
        Self::default()
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn module_aliases(&self) -> &BTreeMap<String, String> {
        &self.aliases
    }

    pub fn config(&self) -> &BTreeMap<String, String> {
        &self.config
    }

    pub fn globals(&self) -> &BTreeMap<String, String> {
        &self.globals
    }

    /// Returns a session with the given aliases added, the `module` alias
    /// replaces the default module.
    pub fn with_module_aliases<I, K, V>(&self, aliases: I) -> Session
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut me = self.clone();
        for (alias, module) in aliases {
            let (alias, module) = (alias.into(), module.into());
            match alias.as_str() {
                "module" => me.module = module,
                _ => {
                    me.aliases.insert(alias, module);
                }
            }
        }
        me
    }

    /// Returns a session with the given session config added.
    pub fn with_config<I, K, V>(&self, config: I) -> Session
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut me = self.clone();
        me.config.extend(config.into_iter().map(|(k, v)| (k.into(), v.into())));
        me
    }

    /// Returns a session with the given globals added.
    pub fn with_globals<I, K, V>(&self, globals: I) -> Session
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut me = self.clone();
        me.globals.extend(globals.into_iter().map(|(k, v)| (k.into(), v.into())));
        me
    }

    pub fn is_default(&self) -> bool {
        self == &Session::default()
    }

    fn qualified_globals(&self) -> BTreeMap<String, &str> {
        self.globals
            .iter()
            .map(|(name, value)| match name.contains("::") {
                true => (name.clone(), value.as_str()),
                false => (format!("{}::{name}", self.module), value.as_str()),
            })
            .collect()
    }

    /// Returns the script turning the `current` session state into this one,
    /// [`None`] if they are the same.
    pub(crate) fn transition_script(&self, current: &Session) -> Option<String> {
        if self == current {
            return None;
        }

        let mut script = String::new();
        // infallible writes into a `String`
        let mut push = |args: fmt::Arguments<'_>| {
            let _ = script.write_fmt(args);
        };

        if self.module != current.module {
            push(format_args!("SET MODULE {};\n", self.module));
        }

        for alias in current.aliases.keys().filter(|a| !self.aliases.contains_key(*a)) {
            push(format_args!("RESET ALIAS {alias};\n"));
        }
        for (alias, module) in &self.aliases {
            if current.aliases.get(alias) != Some(module) {
                push(format_args!("SET ALIAS {alias} AS MODULE {module};\n"));
            }
        }

        for name in current.config.keys().filter(|n| !self.config.contains_key(*n)) {
            push(format_args!("CONFIGURE SESSION RESET {name};\n"));
        }
        for (name, value) in &self.config {
            if current.config.get(name) != Some(value) {
                push(format_args!("CONFIGURE SESSION SET {name} := {value};\n"));
            }
        }

        let (target, current) = (self.qualified_globals(), current.qualified_globals());
        for name in current.keys().filter(|n| !target.contains_key(*n)) {
            push(format_args!("RESET GLOBAL {name};\n"));
        }
        for (name, value) in &target {
            if current.get(name) != Some(value) {
                push(format_args!("SET GLOBAL {name} := {value};\n"));
            }
        }

        // same state once global names are qualified
        (!script.is_empty()).then_some(script)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self {
            module: DEFAULT_MODULE.into(),
            aliases: BTreeMap::new(),
            config: BTreeMap::new(),
            globals: BTreeMap::new(),
        }
    }
}

/// Options of a [`Client`][crate::Client].
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub retry: RetryOptions,
    pub transaction: TransactionOptions,
    pub session: Session,
}

impl Options {
    pub fn with_retry_options(&self, retry: RetryOptions) -> Options {
        Self { retry, ..self.clone() }
    }

    pub fn with_transaction_options(&self, transaction: TransactionOptions) -> Options {
        Self { transaction, ..self.clone() }
    }

    pub fn with_session(&self, session: Session) -> Options {
        Self { session, ..self.clone() }
    }
}
