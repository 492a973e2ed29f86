use std::env::var;
use edgero::{Client, Executor, Pool, PoolConfig, RawConnection, Result};


pub async fn main() -> Result<()> {

    let mut conn = RawConnection::connect_dsn(&var("EDGEDB_DSN").unwrap()).await?;
    conn.query("SELECT 1", ()).await?;
    conn.close().await?;

    let mut conn = RawConnection::connect_env().await?;
    conn.query("SELECT 1", ()).await?;
    conn.close().await?;

    let pool = Pool::connect(&var("EDGEDB_DSN").unwrap()).await?;
    pool.run(async |conn| conn.query("SELECT 1", ()).await).await?;
    pool.close().await?;

    let pool = PoolConfig::from_env().min_size(2).max_size(4).connect().await?;
    let stats = pool.get_stats();
    assert_eq!(stats.open_connections, 2);
    pool.close().await?;

    let client = Client::connect_env().await?;
    client.ensure_connected().await?;
    client.close().await?;

    Ok(())
}
