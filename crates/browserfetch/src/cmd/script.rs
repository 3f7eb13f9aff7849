use crate::cmd::{BrokerArgs, ScriptArgs};
use crate::exit::{CliResult, SUCCESS};
use crate::output::print_raw;

pub fn run(args: ScriptArgs, broker: BrokerArgs) -> CliResult<i32> {
    let addr = broker.config(browserfetch::broker::DEFAULT_TIMEOUT).addr();
    let script = browserfetch::userscript_for(&addr, args.host_name.as_deref());
    print_raw(script.as_bytes());
    Ok(SUCCESS)
}
