//! Subcommand dispatch: flags in, JSON on stdout.

use serde_json::json;

use crate::cli::{CaptureArgs, Cli, Commands, KeyArgs, ListArgs, ReplayArgs, ServeArgs};
use crate::config::{EnvConfig, resolve_env};
use crate::error::{CmError, Result};
use crate::server;
use cm::{CookieMonster, StoreKey, headers};
use cm_protocol::{
    BodySource, CaptureConfig, HeaderMap, KeySource, ReplayConfig, RetryConfig, Selector,
};

pub async fn dispatch(cli: Cli) -> Result<()> {
    let env = resolve_env();
    match cli.command {
        Commands::Capture(args) => capture(args, &env).await,
        Commands::Replay(args) => replay(args, &env).await,
        Commands::Serve(args) => serve(args, &env).await,
        Commands::List(args) => list(args, &env),
    }
}

/// Inline flag wins, then key file, then the environment fallback.
fn key_source(args: &KeyArgs, env: &EnvConfig) -> KeySource {
    if let Some(key) = &args.key_inline {
        KeySource::Inline(key.clone())
    } else if let Some(path) = &args.key_file {
        KeySource::File(path.clone())
    } else if let Some(key) = &env.encryption_key {
        KeySource::Inline(key.clone())
    } else {
        KeySource::None
    }
}

async fn capture(args: CaptureArgs, env: &EnvConfig) -> Result<()> {
    let config = CaptureConfig {
        browser_host: args.browser_host,
        browser_port: args.browser_port,
        target_hint: args.target_hint,
        duration_seconds: args.duration,
        max_records: args.max_records,
        include_all_headers: args.all_headers,
        capture_post_data: args.post_data,
        capture_responses: args.responses,
        host_filter: args.host_filter,
        method_filter: args.method_filter,
        resource_type_filter: args.resource_type_filter,
        output_file: args.output,
        encryption_key_source: key_source(&args.key, env),
    };

    let summary = CookieMonster::new().capture(&config).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn replay(args: ReplayArgs, env: &EnvConfig) -> Result<()> {
    let mut extra_headers = HeaderMap::new();
    for raw in &args.headers {
        let Some((name, value)) = raw.split_once(':') else {
            return Err(CmError::Usage(format!(
                "header '{raw}' is not NAME:VALUE"
            )));
        };
        extra_headers.insert(name.trim().to_string(), value.trim().to_string());
    }

    let body = if let Some(raw) = &args.body_json {
        BodySource::Json(serde_json::from_str(raw)?)
    } else if let Some(path) = &args.body_file {
        BodySource::File(path.clone())
    } else if args.body_captured {
        BodySource::Captured
    } else {
        BodySource::None
    };

    let config = ReplayConfig {
        capture_file: args.file,
        selector: Selector {
            url_contains: args.url_contains,
            method: args.select_method,
            resource_type: None,
            index: args.index,
        },
        request_url: args.url,
        method: args.method,
        body,
        extra_headers,
        enforce_capture_host: args.enforce_capture_host,
        adapter: args.adapter,
        retry: RetryConfig {
            attempts: args.attempts,
            backoff_seconds: args.backoff,
            jitter: args.jitter,
        },
        timeout_seconds: args.timeout,
        redirect_limit: 10,
        encryption_key_source: key_source(&args.key, env),
    };

    let result = CookieMonster::new().replay(&config).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn serve(args: ServeArgs, env: &EnvConfig) -> Result<()> {
    let config = server::ServerConfig {
        bind: args.bind,
        api_token: args.api_token.clone().or_else(|| env.api_token.clone()),
        allow_remote: args.allow_remote || env.allow_remote,
    };

    let plane = server::start(config, CookieMonster::new(), server::Collaborators::default())
        .await?;
    println!(
        "{}",
        json!({"listening": plane.local_addr().to_string()})
    );

    tokio::signal::ctrl_c().await?;
    plane.shutdown();
    Ok(())
}

fn list(args: ListArgs, env: &EnvConfig) -> Result<()> {
    let key = StoreKey::resolve(&key_source(&args.key, env)).map_err(CmError::Engine)?;
    let (records, stats) = cm::load_all(&args.file, key.as_ref())?;

    let entries: Vec<serde_json::Value> = cm::summarize(&records)
        .into_iter()
        .zip(records.iter())
        .map(|(summary, record)| {
            let mut entry = serde_json::to_value(&summary).unwrap_or_default();
            if args.show_headers {
                // Values never leave the store unredacted.
                let redacted = headers::redact_headers(&record.headers);
                entry["headers"] = serde_json::to_value(redacted).unwrap_or_default();
            }
            entry
        })
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "records": entries,
            "corrupt_lines": stats.corrupt_lines,
            "auth_failures": stats.auth_failures,
        }))?
    );
    Ok(())
}
