use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use h1wire::client::TracingLogHook;
use h1wire::network::InsecureValidator;
use h1wire::service::setup_tracing;
use h1wire::{
    AppError, AppResult, Endpoint, Method, OutboundRequest, RequestExecutor, ResponseBody,
    TransportConfig,
};
use tokio::runtime;

#[derive(Parser)]
#[command(version, about = "Send one HTTP/1.1 request and print the response")]
pub struct CommandLine {
    /// request url, http:// or https://
    pub url: String,
    /// request method
    #[arg(short = 'X', long, default_value = "GET")]
    pub method: String,
    /// extra header as `name: value`, repeatable
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,
    /// request body
    #[arg(short = 'd', long = "data")]
    pub data: Option<String>,
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<PathBuf>,
    /// request timeout in milliseconds, overrides the config file
    #[arg(long)]
    pub timeout: Option<u64>,
    /// print the status line and headers before the body
    #[arg(short = 'i', long = "include")]
    pub include: bool,
    /// accept any server certificate
    #[arg(short = 'k', long)]
    pub insecure: bool,
    /// directory for the rolling log file
    #[arg(long, default_value = "./logs")]
    pub log_dir: PathBuf,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn build_request(commandline: &CommandLine) -> AppResult<OutboundRequest> {
    let mut request = OutboundRequest::new(Method::from(commandline.method.as_str()));
    for header in &commandline.headers {
        let (name, value) = header.split_once(':').ok_or_else(|| {
            AppError::InvalidValue(format!("header without ':' separator: {header}"))
        })?;
        request = request.with_header(name.trim(), value.trim());
    }
    if let Some(data) = &commandline.data {
        request = request.with_body(data.clone());
    }
    if let Some(timeout) = commandline.timeout {
        request = request.with_timeout(Duration::from_millis(timeout));
    }
    Ok(request)
}

fn main() -> AppResult<ExitCode> {
    dotenv().ok();
    let commandline = CommandLine::parse();
    let _guard = setup_tracing(&commandline.log_dir, commandline.verbose);

    let config = match &commandline.conf {
        Some(path) => TransportConfig::set_up_config(path)?,
        None => TransportConfig::default(),
    };
    let endpoint = Endpoint::parse(&commandline.url)?;
    let request = build_request(&commandline)?;

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(async move {
        let mut executor = RequestExecutor::new(endpoint, config)?;
        if commandline.insecure {
            executor = executor.with_validator(Arc::new(InsecureValidator))?;
        }
        if commandline.verbose > 0 {
            executor.hooks().subscribe(Arc::new(TracingLogHook));
        }

        let response = executor.execute_with_retry(request).await;
        let synthetic = response.is_synthetic();
        let mut stdout = std::io::stdout().lock();
        if commandline.include || synthetic {
            writeln!(stdout, "{}\r\n", response.raw_header())?;
        }
        match response.into_body() {
            ResponseBody::Empty => {}
            ResponseBody::Bytes(bytes) => stdout.write_all(&bytes)?,
            ResponseBody::Stream(mut stream) => {
                while let Some(block) = stream.read_more().await? {
                    stdout.write_all(&block)?;
                }
            }
        }
        stdout.flush()?;
        executor.close().await;

        Ok::<_, AppError>(if synthetic {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        })
    })
}
