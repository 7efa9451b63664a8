use std::process;
use std::time::Duration;

use anyhow::Context;
use portlet::{BridgeConfig, Session};
use serde_json::Value;

struct Invocation {
    module: String,
    function: String,
    args: Vec<Value>,
    cast: bool,
    timeout: Option<Duration>,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let invocation = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: portlet-call <module> <function> [json-args] [--cast] [--timeout-ms <n>]");
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <module>           Worker module, e.g. math or os.path");
            eprintln!("  <function>         Function name within the module");
            eprintln!("  [json-args]        JSON array of arguments [default: []]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --cast             Send a notification and do not wait for a result");
            eprintln!("  --timeout-ms <n>   Call timeout in milliseconds");
            eprintln!();
            eprintln!("The worker is configured from PORTLET_* environment variables.");
            process::exit(2);
        }
    };

    portlet::logging::init_tracing();

    if let Err(e) = run(invocation).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Invocation, String> {
    let mut positional: Vec<&str> = Vec::new();
    let mut cast = false;
    let mut timeout = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--cast" => cast = true,
            "--timeout-ms" => {
                i += 1;
                let raw = args.get(i).ok_or("--timeout-ms requires a value")?;
                let ms: u64 = raw
                    .parse()
                    .map_err(|_| format!("invalid --timeout-ms value: {raw}"))?;
                timeout = Some(Duration::from_millis(ms));
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with("--") => return Err(format!("unknown flag: {arg}")),
            arg => positional.push(arg),
        }
        i += 1;
    }

    let (module, function, raw_args) = match positional.as_slice() {
        [module, function] => (*module, *function, "[]"),
        [module, function, raw_args] => (*module, *function, *raw_args),
        [] | [_] => return Err("missing required arguments: <module> <function>".to_string()),
        [_, _, _, extra, ..] => return Err(format!("unexpected argument: {extra}")),
    };

    let args = match serde_json::from_str::<Value>(raw_args) {
        Ok(Value::Array(items)) => items,
        Ok(_) => return Err("json-args must be a JSON array".to_string()),
        Err(e) => return Err(format!("invalid json-args: {e}")),
    };

    Ok(Invocation {
        module: module.to_string(),
        function: function.to_string(),
        args,
        cast,
        timeout,
    })
}

async fn run(invocation: Invocation) -> anyhow::Result<()> {
    let config = BridgeConfig::from_env().context("invalid worker configuration")?;
    let session = Session::start(config).context("failed to start worker")?;

    let outcome = if invocation.cast {
        session
            .cast(&invocation.module, &invocation.function, invocation.args)
            .await
            .map(|()| None)
    } else {
        let timeout = invocation.timeout.unwrap_or(session.default_timeout());
        session
            .call_with_timeout(
                &invocation.module,
                &invocation.function,
                invocation.args,
                timeout,
            )
            .await
            .map(Some)
    };

    // Stop even when the call failed, so the worker is not left behind.
    session.stop().await?;

    let target = format!("{}.{}", invocation.module, invocation.function);
    if let Some(value) = outcome.with_context(|| format!("{target} failed"))? {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
