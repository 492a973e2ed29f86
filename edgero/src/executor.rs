//! The [`Executor`] trait.
use crate::{
    Error, ErrorKind, Result,
    codec::QueryArgs,
    protocol::OutputFormat,
    value::Value,
};

/// Expected result set size of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Expect {
    /// Any number of elements.
    Many,
    /// Zero or one element.
    AtMostOne,
    /// Exactly one element.
    One,
    /// One or more elements.
    AtLeastOne,
}

impl Expect {
    pub fn is_single(&self) -> bool {
        matches!(self, Expect::AtMostOne | Expect::One)
    }

    /// Returns `true` if an empty result is an error.
    pub fn is_required(&self) -> bool {
        matches!(self, Expect::One | Expect::AtLeastOne)
    }
}

/// A query to be run by an [`Executor`].
#[derive(Debug, Clone)]
pub struct Request<'a> {
    pub query: &'a str,
    pub args: QueryArgs,
    pub format: OutputFormat,
    pub expect: Expect,
}

impl<'a> Request<'a> {
    pub fn new(query: &'a str, args: QueryArgs, format: OutputFormat, expect: Expect) -> Self {
        Self { query, args, format, expect }
    }

    /// Name of the query method, used in error messages.
    pub(crate) fn method(&self) -> &'static str {
        match (self.expect, self.format) {
            (Expect::Many, OutputFormat::Binary) => "query()",
            (Expect::Many, OutputFormat::Json) => "query_json()",
            (Expect::AtMostOne, OutputFormat::Binary) => "query_single()",
            (Expect::AtMostOne, OutputFormat::Json) => "query_single_json()",
            (Expect::One, OutputFormat::Binary) => "query_required_single()",
            (Expect::One, OutputFormat::Json) => "query_required_single_json()",
            (Expect::AtLeastOne, OutputFormat::Binary) => "query_required()",
            (Expect::AtLeastOne, OutputFormat::Json) => "query_required_json()",
        }
    }
}

/// Check the number of returned elements against the expected cardinality.
pub(crate) fn check_cardinality(expect: Expect, values: &[Value]) -> Result<()> {
    match (expect, values.len()) {
        (Expect::One | Expect::AtLeastOne, 0) => Err(Error::new(ErrorKind::NoData, "query returned no data")),
        (Expect::AtMostOne | Expect::One, 2..) => Err(Error::new(
            ErrorKind::ResultCardinalityMismatch,
            "the query is expected to return at most one element, got more",
        )),
        _ => Ok(()),
    }
}

fn single_json(mut values: Vec<Value>) -> Option<String> {
    match values.pop()? {
        Value::Str(s) | Value::Json(s) => Some(s),
        _ => None,
    }
}

fn is_empty_array(json: &str) -> bool {
    json.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .is_some_and(|inner| inner.trim().is_empty())
}

/// A type that can run queries.
///
/// Implemented by [`RawConnection`][crate::RawConnection],
/// [`PoolConnection`][crate::pool::PoolConnection],
/// [`Transaction`][crate::Transaction] and [`Client`][crate::Client].
///
/// # Example
///
/// ```no_run
/// use edgero::{Executor, Value};
///
/// # async fn app<E: Executor>(mut e: E) -> edgero::Result<()> {
/// let users = e.query("SELECT User { name } FILTER .age > <int64>$0", vec![Value::Int64(21)]).await?;
/// let count = e.query_required_single("SELECT count(User)", ()).await?;
/// # Ok(())
/// # }
/// ```
pub trait Executor: Send {
    /// Run a query, returning all decoded elements.
    ///
    /// The number of elements is already checked against [`Request::expect`].
    fn fetch(&mut self, request: Request<'_>) -> impl Future<Output = Result<Vec<Value>>> + Send;

    /// Run a script without arguments, discarding its result.
    fn execute(&mut self, script: &str) -> impl Future<Output = Result<()>> + Send;

    /// Run a query returning any number of elements.
    fn query(
        &mut self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> impl Future<Output = Result<Vec<Value>>> + Send {
        self.fetch(Request::new(query, args.into(), OutputFormat::Binary, Expect::Many))
    }

    /// Run a query returning one or more elements.
    fn query_required(
        &mut self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> impl Future<Output = Result<Vec<Value>>> + Send {
        self.fetch(Request::new(query, args.into(), OutputFormat::Binary, Expect::AtLeastOne))
    }

    /// Run a query returning at most one element.
    fn query_single(
        &mut self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> impl Future<Output = Result<Option<Value>>> + Send {
        let request = Request::new(query, args.into(), OutputFormat::Binary, Expect::AtMostOne);
        async move { Ok(self.fetch(request).await?.pop()) }
    }

    /// Run a query returning exactly one element.
    fn query_required_single(
        &mut self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> impl Future<Output = Result<Value>> + Send {
        let request = Request::new(query, args.into(), OutputFormat::Binary, Expect::One);
        async move {
            self.fetch(request)
                .await?
                .pop()
                .ok_or_else(|| Error::new(ErrorKind::NoData, "query returned no data"))
        }
    }

    /// Run a query returning the result set as a JSON array.
    fn query_json(
        &mut self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> impl Future<Output = Result<String>> + Send {
        let request = Request::new(query, args.into(), OutputFormat::Json, Expect::Many);
        async move { Ok(single_json(self.fetch(request).await?).unwrap_or_else(|| "[]".into())) }
    }

    /// Run a query returning a non empty result set as a JSON array.
    fn query_required_json(
        &mut self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> impl Future<Output = Result<String>> + Send {
        let request = Request::new(query, args.into(), OutputFormat::Json, Expect::AtLeastOne);
        async move {
            single_json(self.fetch(request).await?)
                .filter(|json| !is_empty_array(json))
                .ok_or_else(|| Error::new(ErrorKind::NoData, "query returned no data"))
        }
    }

    /// Run a query returning at most one element as JSON, `null` if empty.
    fn query_single_json(
        &mut self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> impl Future<Output = Result<String>> + Send {
        let request = Request::new(query, args.into(), OutputFormat::Json, Expect::AtMostOne);
        async move { Ok(single_json(self.fetch(request).await?).unwrap_or_else(|| "null".into())) }
    }

    /// Run a query returning exactly one element as JSON.
    fn query_required_single_json(
        &mut self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> impl Future<Output = Result<String>> + Send {
        let request = Request::new(query, args.into(), OutputFormat::Json, Expect::One);
        async move {
            single_json(self.fetch(request).await?)
                .ok_or_else(|| Error::new(ErrorKind::NoData, "query returned no data"))
        }
    }
}

impl<E: Executor> Executor for &mut E {
    fn fetch(&mut self, request: Request<'_>) -> impl Future<Output = Result<Vec<Value>>> + Send {
        E::fetch(self, request)
    }

    fn execute(&mut self, script: &str) -> impl Future<Output = Result<()>> + Send {
        E::execute(self, script)
    }
}
