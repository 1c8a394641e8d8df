use std::{path::Path, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use http::Method;
use tether::{
    BytesBody, HttpClient, Request, RequestBody,
    config::{
        ClientConfig, ClientConfigValidator,
        loader::{load_config, load_config_unchecked, to_toml},
    },
    tracing_setup,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Commands,

    /// Log filter, e.g. `debug` or `tether=trace`. Defaults to `RUST_LOG`, then `warn`.
    #[clap(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[clap(long, global = true)]
    json_logs: bool,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Execute one request and print the response
    Fetch {
        url: String,
        /// Request method
        #[clap(short = 'X', long, default_value = "GET")]
        method: String,
        /// Extra header as `name: value`; may repeat
        #[clap(short = 'H', long = "header")]
        headers: Vec<String>,
        /// Request body
        #[clap(short, long)]
        data: Option<String>,
        /// Configuration file to use
        #[clap(short, long)]
        config: Option<String>,
        /// Connect, read and write timeout, e.g. `5s` or `250ms`
        #[clap(long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "tether.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "tether.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let installed = match (&args.log_level, args.json_logs) {
        (Some(level), json) => tracing_setup::init_tracing_with_config(level, json, true),
        (None, true) => tracing_setup::init_tracing(),
        (None, false) => tracing_setup::init_console_tracing(),
    };
    installed.map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    match args.command {
        Commands::Fetch {
            url,
            method,
            headers,
            data,
            config,
            timeout,
        } => fetch_command(&url, &method, &headers, data, config.as_deref(), timeout).await,
        Commands::Validate { config } => validate_config_command(&config).await,
        Commands::Init { config } => init_config_command(&config).await,
    }
}

async fn fetch_command(
    url: &str,
    method: &str,
    headers: &[String],
    data: Option<String>,
    config_path: Option<&str>,
    timeout: Option<Duration>,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => load_config(path).await?,
        None => ClientConfig::default(),
    };
    if let Some(timeout) = timeout {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        config.timeouts.connect_ms = millis;
        config.timeouts.read_ms = millis;
        config.timeouts.write_ms = millis;
    }

    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| eyre!("Invalid method: {method}"))?;
    let body = data.map(|data| Arc::new(BytesBody::text(data)) as Arc<dyn RequestBody>);
    let mut builder = Request::builder().url(url).method(method, body);
    for header in headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| eyre!("Header must look like 'name: value', got '{header}'"))?;
        builder = builder.header(name.trim(), value.trim());
    }
    let request = builder.build().wrap_err("Failed to build request")?;

    let client = HttpClient::builder()
        .config(config)
        .build()
        .wrap_err("Failed to create HTTP client")?;
    let response = client
        .execute(request)
        .await
        .wrap_err_with(|| format!("Request to {url} failed"))?;

    println!(
        "{} {} {}",
        response.protocol(),
        response.status().as_u16(),
        response.message()
    );
    for (name, value) in response.headers().iter() {
        println!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()));
    }
    println!();
    let body = response
        .bytes()
        .await
        .wrap_err("Failed to read response body")?;
    print!("{}", String::from_utf8_lossy(&body));
    Ok(())
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config_unchecked(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ClientConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!(
                "   • Timeouts (connect/read/write): {}ms / {}ms / {}ms",
                config.timeouts.connect_ms, config.timeouts.read_ms, config.timeouts.write_ms
            );
            println!(
                "   • Pool: {} idle connection(s), keep-alive {}s",
                config.pool.max_idle_connections, config.pool.keep_alive_secs
            );
            println!(
                "   • Retries: {} (max {})",
                config.retry.retry_on_connection_failure, config.retry.max_retries
            );
            println!(
                "   • Redirects: {} (max {})",
                config.redirects.follow_redirects, config.redirects.max_follow_ups
            );
            match &config.proxy {
                Some(proxy) => println!("   • Proxy: {}:{}", proxy.host, proxy.port),
                None => println!("   • Proxy: direct"),
            }
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let rendered = to_toml(&ClientConfig::default())?;
    let contents = format!("# Tether HTTP client configuration\n\n{rendered}");
    tokio::fs::write(path, contents)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'tether fetch --config {config_path} <url>' to use it");
    Ok(())
}
