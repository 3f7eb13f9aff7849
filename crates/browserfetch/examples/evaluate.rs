//! Evaluate one expression in a browser tab.
//!
//! Install the userscript first (`browserfetch script`), open a page it
//! matches, then run:
//!   cargo run --example evaluate -- example.com 'document.title'

use std::time::Duration;

use browserfetch::{Broker, BrokerConfig, EvaluateRequest};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "example.com".to_string());
    let code = args.next().unwrap_or_else(|| "document.title".to_string());

    let broker = Broker::start(BrokerConfig::default()).await?;
    eprintln!("Broker role: {:?}", broker.role());

    let request = EvaluateRequest::new(code, host.as_str()).timeout(Duration::from_secs(30));
    let result = broker.evaluate_with(request).await;
    broker.shutdown();

    println!("{}", result?);
    Ok(())
}
