use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use streamrpc_channel::{
    CallError, ChannelConfig, Controller, JsonCodec, Method, MuxChannel, NoResponse, ServiceRegistry,
    SyncChannel,
};
use streamrpc_transport::{connect, Endpoint, RpcStream};

use crate::cmd::CallArgs;
use crate::exit::{call_error, transport_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_call, CallReport, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let endpoint: Endpoint = args
        .endpoint
        .parse()
        .map_err(|err| transport_error("invalid endpoint", err))?;
    let request = parse_request(args.json.as_deref())?;
    let timeout = parse_duration(&args.timeout)?;
    let config = ChannelConfig::default().with_call_timeout(timeout);

    let stream = connect(&endpoint).map_err(|err| transport_error("connect failed", err))?;
    let started = Instant::now();
    let response = if args.mux {
        call_mux(stream, &args.method, &request, args.no_response, config)
    } else {
        call_sync(stream, &args.method, &request, args.no_response, config)
    }
    .map_err(|err| call_error("call failed", err))?;

    let report = CallReport::new(
        endpoint.to_string(),
        &args.method,
        if args.mux { "mux" } else { "sync" },
        started.elapsed(),
        response.as_ref(),
    );
    print_call(&report, format);
    Ok(SUCCESS)
}

fn call_sync(
    stream: RpcStream,
    method: &str,
    request: &Value,
    no_response: bool,
    config: ChannelConfig,
) -> Result<Option<Value>, CallError> {
    let mut channel = SyncChannel::with_config(stream, JsonCodec, config)?;
    let result = if no_response {
        channel
            .call(&Method::<Value, NoResponse>::named(method), request)
            .map(|_| None)
    } else {
        channel
            .call(&Method::<Value, Value>::named(method), request)
            .map(Some)
    };
    if let Err(err) = channel.close() {
        tracing::debug!(error = %err, "disconnect not sent");
    }
    result
}

fn call_mux(
    stream: RpcStream,
    method: &str,
    request: &Value,
    no_response: bool,
    config: ChannelConfig,
) -> Result<Option<Value>, CallError> {
    let channel = MuxChannel::with_services(stream, ServiceRegistry::<JsonCodec>::new(), config)?;
    let controller = Arc::new(Controller::new());
    if no_response {
        channel
            .call_blocking(&Method::<Value, NoResponse>::named(method), request, &controller)
            .map(|_| None)
    } else {
        channel
            .call_blocking(&Method::<Value, Value>::named(method), request, &controller)
            .map(Some)
    }
}

fn parse_request(json: Option<&str>) -> CliResult<Value> {
    match json {
        None => Ok(Value::Null),
        Some(text) => serde_json::from_str(text)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}"))),
    }
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn request_defaults_to_null() {
        assert_eq!(parse_request(None).unwrap(), Value::Null);
        assert_eq!(parse_request(Some("[1]")).unwrap(), serde_json::json!([1]));
        assert_eq!(parse_request(Some("{oops")).unwrap_err().code, USAGE);
    }

    #[cfg(unix)]
    #[test]
    fn sync_and_mux_calls_reach_demo_service() {
        use std::os::unix::net::UnixStream;

        for mux in [false, true] {
            let (left, right) = UnixStream::pair().unwrap();
            let _server = MuxChannel::with_services(
                right,
                crate::cmd::serve::demo_services(),
                ChannelConfig::default(),
            )
            .unwrap();

            let request = serde_json::json!({"n": 1});
            let config = ChannelConfig::default().with_call_timeout(Duration::from_secs(5));
            let stream = RpcStream::from(left);
            let response = if mux {
                call_mux(stream, "Echo", &request, false, config)
            } else {
                call_sync(stream, "Echo", &request, false, config)
            }
            .unwrap();
            assert_eq!(response, Some(request));
        }
    }
}
