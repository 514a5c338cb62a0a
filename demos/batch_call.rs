use std::error::Error;

use noderpc_sdk::http::{HttpClient, RpcCall};
use serde_json::{json, Value};

fn main() -> Result<(), Box<dyn Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = HttpClient::new("https://fullnode.example")?;

        let height = client
            .call("getLatestHeight", vec![], Value::is_u64)
            .await?;
        println!("height: {height}");

        let results = client
            .batch_call(vec![
                RpcCall::new("getObject", vec![json!("0x2")]).with_validator(Value::is_object),
                RpcCall::new("getObject", vec![json!("0x5")]).with_validator(Value::is_object),
            ])
            .await?;
        for object in results {
            println!("object: {object}");
        }

        Ok::<(), Box<dyn Error>>(())
    })?;

    Ok(())
}
