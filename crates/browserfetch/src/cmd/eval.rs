use browserfetch_broker::{Broker, EvaluateRequest};
use serde_json::Value;

use crate::cmd::{parse_duration, runtime, BrokerArgs, EvalArgs};
use crate::exit::{broker_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_value, OutputFormat};

pub fn run(args: EvalArgs, broker_args: BrokerArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let mut request = EvaluateRequest::new(args.code, args.host.clone()).timeout(timeout);
    if let Some(arg) = parse_arg(args.arg.as_deref())? {
        request = request.arg(arg);
    }
    let config = broker_args.config(timeout);

    let value = runtime()?.block_on(async move {
        let broker = Broker::start(config)
            .await
            .map_err(|err| broker_error("failed to start broker", err))?;
        let result = broker.evaluate_with(request).await;
        broker.shutdown();
        result.map_err(|err| broker_error("evaluate failed", err))
    })?;

    print_value(&args.host, &value, format);
    Ok(SUCCESS)
}

fn parse_arg(arg: Option<&str>) -> CliResult<Option<Value>> {
    arg.map(serde_json::from_str)
        .transpose()
        .map_err(|err| CliError::new(USAGE, format!("--arg is not valid JSON: {err}")))
}
