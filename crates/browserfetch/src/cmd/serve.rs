use std::time::Duration;

use browserfetch_broker::{Broker, Role};
use tracing::info;

use crate::cmd::{parse_duration, runtime, BrokerArgs, ServeArgs};
use crate::exit::{broker_error, io_error, CliResult, SUCCESS};
use crate::output::{print_status, OutputFormat};

const ELECTION_GRACE: Duration = Duration::from_secs(5);

pub fn run(args: ServeArgs, broker_args: BrokerArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let config = broker_args.config(timeout);

    runtime()?.block_on(async move {
        let broker = Broker::start(config)
            .await
            .map_err(|err| broker_error("failed to start broker", err))?;

        // A relay needs a moment to reach the primary; report whatever
        // role it settled on.
        let _ = tokio::time::timeout(ELECTION_GRACE, async {
            tokio::select! {
                _ = broker.wait_for_role(Role::Primary) => {}
                _ = broker.wait_for_role(Role::Relay) => {}
            }
        })
        .await;
        info!(role = ?broker.role(), addr = %broker.config().addr(), "serving");
        print_status(&broker.status(), format);

        let signal = tokio::signal::ctrl_c().await;
        broker.shutdown();
        signal.map_err(|err| io_error("failed to listen for interrupt", err))?;
        Ok(SUCCESS)
    })
}
