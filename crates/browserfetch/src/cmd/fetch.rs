use std::fs;

use browserfetch_broker::{Broker, FetchRequest};

use crate::cmd::{parse_duration, runtime, BrokerArgs, FetchArgs};
use crate::exit::{broker_error, io_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_fetch, OutputFormat};

pub fn run(args: FetchArgs, broker_args: BrokerArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let request = build_request(&args)?.timeout(timeout);
    // Reject unusable URLs before taking part in the election.
    request
        .target_url()
        .map_err(|err| broker_error("fetch failed", err))?;
    let config = broker_args.config(timeout);

    let response = runtime()?.block_on(async move {
        let broker = Broker::start(config)
            .await
            .map_err(|err| broker_error("failed to start broker", err))?;
        let result = broker.fetch(request).await;
        broker.shutdown();
        result.map_err(|err| broker_error("fetch failed", err))
    })?;

    print_fetch(&response, format);
    Ok(SUCCESS)
}

fn build_request(args: &FetchArgs) -> CliResult<FetchRequest> {
    let mut request = FetchRequest::new(args.url.clone());
    if let Some(host) = &args.host {
        request = request.host(host.clone());
    }
    if let Some(method) = &args.method {
        request = request.method(method);
    }
    for header in &args.headers {
        let (name, value) = header.split_once(':').ok_or_else(|| {
            CliError::new(USAGE, format!("--header expects NAME:VALUE, got `{header}`"))
        })?;
        request = request.header(name.trim(), value.trim());
    }
    for param in &args.params {
        let (key, value) = param.split_once('=').ok_or_else(|| {
            CliError::new(USAGE, format!("--param expects KEY=VALUE, got `{param}`"))
        })?;
        request = request.param(key, value);
    }
    if let Some(data) = &args.data {
        request = request.body(data.clone());
    }
    if let Some(path) = &args.file {
        let body = fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
        request = request.body(body);
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn args(url: &str) -> FetchArgs {
        FetchArgs {
            url: url.to_string(),
            host: None,
            method: None,
            headers: Vec::new(),
            params: Vec::new(),
            data: None,
            file: None,
            timeout: "95s".to_string(),
        }
    }

    #[test]
    fn build_request_applies_flags() {
        let request = build_request(&FetchArgs {
            method: Some("post".to_string()),
            headers: vec!["Content-Type: text/plain".to_string()],
            params: vec!["q=rust".to_string()],
            data: Some("hello".to_string()),
            host: Some("example.com".to_string()),
            ..args("https://api.example.com/search")
        })
        .unwrap();

        assert_eq!(request.host.as_deref(), Some("example.com"));
        assert_eq!(request.options["method"], json!("POST"));
        assert_eq!(
            request.options["headers"]["Content-Type"],
            json!("text/plain")
        );
        assert_eq!(request.body.as_deref(), Some(&b"hello"[..]));
        assert_eq!(
            request.target_url().unwrap().as_str(),
            "https://api.example.com/search?q=rust"
        );
    }

    #[test]
    fn malformed_pairs_are_usage_errors() {
        let err = build_request(&FetchArgs {
            headers: vec!["no-colon".to_string()],
            ..args("https://example.com/")
        })
        .unwrap_err();
        assert_eq!(err.code, USAGE);

        let err = build_request(&FetchArgs {
            params: vec!["no-equals".to_string()],
            ..args("https://example.com/")
        })
        .unwrap_err();
        assert_eq!(err.code, USAGE);
    }
}
