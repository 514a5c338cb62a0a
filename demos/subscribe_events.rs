use std::error::Error;
use std::time::Duration;

use noderpc_sdk::endpoint::Endpoint;
use noderpc_sdk::stream::client::{StreamConnection, StreamOptions};
use serde_json::json;

fn main() -> Result<(), Box<dyn Error>> {
    let endpoint = Endpoint::new("https://fullnode.example", None)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let connection = StreamConnection::for_endpoint(&endpoint, StreamOptions::default());
        connection.connect().await?;

        let subscription = connection
            .subscribe(json!({"kind": "all"}), |event| {
                println!("event: {event}");
            })
            .await?;
        println!("subscribed as {subscription}");

        tokio::time::sleep(Duration::from_secs(60)).await;

        connection.unsubscribe(subscription).await;
        connection.close();
        Ok::<(), Box<dyn Error>>(())
    })?;

    Ok(())
}
