use ffidyn::{logging, FfiConfig, FfiContext, Session, Value};
use std::path::PathBuf;
use tracing::{debug, error, info};

#[derive(Debug)]
enum Command {
    Info { topic: String, operand: Option<String> },
    Call { library: String, symbol: String, ret: String, args: Vec<(String, String)> },
}

#[derive(Debug)]
struct Config {
    config_file: Option<PathBuf>,
    json: bool,
    command: Command,
}

impl Config {
    fn from_args() -> Result<Self, String> {
        let args: Vec<String> = std::env::args().collect();
        let prog = args.first().map(String::as_str).unwrap_or("ffidyn");

        let mut config_file = None;
        let mut json = false;
        let mut rest = Vec::new();

        let mut iter = args.iter().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--help" | "-h" => return Err(Self::usage(prog)),
                "--json" => json = true,
                "--config" => {
                    let path = iter.next().ok_or("--config needs a file argument")?;
                    config_file = Some(PathBuf::from(path));
                }
                opt if opt.starts_with("--") && rest.is_empty() => {
                    return Err(format!("Unknown option: {}\n\n{}", opt, Self::usage(prog)))
                }
                word => rest.push(word.to_string()),
            }
        }

        let command = match rest.first().map(String::as_str) {
            Some("info") => {
                let topic = rest.get(1).cloned().ok_or_else(|| Self::usage(prog))?;
                Command::Info { topic, operand: rest.get(2).cloned() }
            }
            Some("call") if rest.len() >= 4 => {
                let args = rest[4..]
                    .iter()
                    .map(|pair| {
                        pair.split_once('=')
                            .map(|(t, v)| (t.to_string(), v.to_string()))
                            .ok_or_else(|| format!("argument must be TYPE=VALUE: {}", pair))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Command::Call {
                    library: rest[1].clone(),
                    symbol: rest[2].clone(),
                    ret: rest[3].clone(),
                    args,
                }
            }
            _ => return Err(Self::usage(prog)),
        };

        Ok(Self { config_file, json, command })
    }

    fn usage(prog: &str) -> String {
        format!(
            "ffidyn - call native functions described at run time\n\n\
            USAGE:\n    \
            {prog} [OPTIONS] info <typedefs|signatures|libraries|protocols|features>\n    \
            {prog} [OPTIONS] info <sizeof|alignof|format> <TYPE>\n    \
            {prog} [OPTIONS] call <LIBRARY> <SYMBOL> <RETURN> [TYPE=VALUE...]\n\n\
            OPTIONS:\n    \
            -h, --help        Print help information\n    \
            --config <FILE>   Read configuration from FILE instead of ffidyn.toml\n    \
            --json            Print results as JSON\n\n\
            A LIBRARY of \"-\" names the running program.\n\n\
            EXAMPLES:\n    \
            {prog} info sizeof \"long double\"\n    \
            {prog} call libm.so.6 cos double double=0.5\n    \
            {prog} --config ffidyn.toml info format point"
        )
    }
}

fn run_info(ctx: &FfiContext, topic: &str, operand: Option<&str>) -> Result<serde_json::Value, String> {
    let need = |what: &str| operand.ok_or_else(|| format!("info {} needs a type name", what));
    let value = match topic {
        "typedefs" => serde_json::json!(ctx.typedefs()),
        "signatures" => serde_json::json!(ctx.signature_keys()),
        "libraries" => serde_json::json!(ctx.libraries()),
        "protocols" => serde_json::json!(ffidyn::interop::protocol_names()),
        "features" => {
            let features = ctx.features();
            serde_json::json!({
                "callbacks": features.callbacks,
                "int64": features.int64,
                "long_double": features.long_double,
                "host": features.host,
            })
        }
        "sizeof" => serde_json::json!(ctx.size_of(need("sizeof")?).map_err(|e| e.to_string())?),
        "alignof" => serde_json::json!(ctx.align_of(need("alignof")?).map_err(|e| e.to_string())?),
        "format" => serde_json::json!(ctx.format(need("format")?).map_err(|e| e.to_string())?),
        other => return Err(format!("unknown info topic: {}", other)),
    };
    Ok(value)
}

fn run_call(
    ctx: &FfiContext,
    library: &str,
    symbol: &str,
    ret: &str,
    args: &[(String, String)],
) -> Result<Value, String> {
    let library = if library == "-" { "" } else { library };
    let types: Vec<&str> = args.iter().map(|(t, _)| t.as_str()).collect();
    let values: Vec<Value> = args.iter().map(|(_, v)| Value::string(v)).collect();

    // SAFETY: the user asserts the symbol has the declared signature
    unsafe { ctx.bind_symbol(symbol, library, symbol, &types, ret, None) }
        .map_err(|e| e.to_string())?;
    let result = ctx.call(symbol, &values).map_err(|e| e.to_string());
    let _ = ctx.unbind_outbound(symbol);
    result
}

fn print(value: serde_json::Value, json: bool) {
    match value {
        serde_json::Value::Array(items) if !json => {
            for item in items {
                match item {
                    serde_json::Value::String(s) => println!("{}", s),
                    other => println!("{}", other),
                }
            }
        }
        serde_json::Value::String(s) if !json => println!("{}", s),
        other => println!("{}", other),
    }
}

fn main() {
    let config = match Config::from_args() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let settings = match &config.config_file {
        Some(path) => match FfiConfig::from_file(path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        },
        None => FfiConfig::discover(),
    };

    logging::init_with_config(settings.logging.to_log_config());
    info!("ffidyn CLI starting");
    debug!(command = ?config.command, "Configuration loaded");

    let ctx = match FfiContext::from_config(Session::new(), &settings) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "Failed to apply configuration");
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let outcome = match &config.command {
        Command::Info { topic, operand } => run_info(&ctx, topic, operand.as_deref()),
        Command::Call { library, symbol, ret, args } => {
            run_call(&ctx, library, symbol, ret, args).map(|value| match value {
                Value::Int(i) => serde_json::json!(i),
                Value::Double(d) => serde_json::json!(d),
                other => serde_json::json!(other.to_string()),
            })
        }
    };

    match outcome {
        Ok(value) => print(value, config.json),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
