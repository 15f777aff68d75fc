//! Scoped leases on a bounded client pool: the lease derefs to the
//! client and goes back to the pool at the end of the scope.

use redmux::{ClientOptions, ClientPool};
use std::time::Duration;

#[tokio::main]
async fn main() -> redmux::Result<()> {
    let pool = ClientPool::new(
        Some(10),
        Some(Duration::from_secs(60)),
        true,
        ClientOptions::default(),
    );
    pool.preconnect(Some(5)).await?;
    println!("{} clients warmed up", pool.idle_count());

    for round in 0..3 {
        let lease = pool.connected_client().await;
        let reply = lease.call(vec!["PING".into()]).await?;
        println!("round {}: {:?}", round, reply);
        // the lease drops here and the client is parked again
    }

    pool.destroy();
    Ok(())
}
