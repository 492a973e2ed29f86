use edgero::{Client, Executor, Result, RetryCondition, RetryOptions, RetryRule};
use std::time::Duration;
use tracing::{Instrument, trace_span};

pub async fn main() -> Result<()> {
    // will read the `EDGEDB_*` environment variables
    let client = Client::connect_env().await?;
    let mut handles = vec![];

    client.clone().execute("CREATE TYPE Counter { CREATE PROPERTY value: int64 }").await?;
    client.clone().execute("INSERT Counter { value := 0 }").await?;

    for id in 0..24 {
        // cloning client is cheap and share the same connection pool
        let mut client = client.clone();

        handles.push(tokio::spawn(async move {
            client.execute(&format!("UPDATE Counter SET {{ value := .value + {id} }}")).await
        }.instrument(trace_span!("thread",id))));
    }

    for h in handles {
        h.await.unwrap()?;
    }

    // conflicting transactions are retried
    let client = client.with_retry_options(
        RetryOptions::defaults()
            .with_rule(RetryCondition::SerializationError, RetryRule::new(10, |_| Duration::from_millis(5))),
    );

    let value = client
        .transaction(async |tx| {
            tx.query_required_single("SELECT (UPDATE Counter SET { value := .value + 1 }).value", ())
                .await
        })
        .await?;

    tracing::info!("counter: {value:?}");

    client.clone().execute("DROP TYPE Counter").await?;
    client.close().await?;

    Ok(())
}
