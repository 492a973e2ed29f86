use edgero::{Executor, RawConnection, Result, TransactionOptions, Value};

pub async fn main() -> Result<()> {
    let mut conn = RawConnection::connect_env().await?;

    // Execute

    conn.execute("CREATE TYPE Post { CREATE PROPERTY name: str }").await?;
    conn.execute("INSERT Post { name := 'Deez' }").await?;

    // Queries

    let datas = conn.query("SELECT Post.name", ()).await?;

    assert_eq!(datas.len(), 1);

    let name = conn
        .query_required_single("SELECT <str>$0", vec![Value::Str("Foo".into())])
        .await?;

    assert_eq!(name, Value::Str("Foo".into()));

    let data = conn.query_single("SELECT Post.name LIMIT 0", ()).await?;

    assert!(data.is_none());

    let json = conn.query_json("SELECT Post { name }", ()).await?;

    assert!(json.starts_with('['));

    {
        let mut tx = conn.transaction(TransactionOptions::default()).await?;
        tx.execute("INSERT Post { name := 'Foo' }").await?;
        tx.commit().await?;
    }

    // Error case

    conn.query("SELECT foo(", ()).await.unwrap_err();
    conn.query_required_single("SELECT Post LIMIT 0", ()).await.unwrap_err();
    conn.execute("START TRANSACTION").await.unwrap_err();

    conn.execute("DROP TYPE Post").await?;

    Ok(())
}
