use clap::Parser;
use log::{info, LevelFilter};
use redmux::{Client, ClientOptions, Pipeline, ReplyCallback};
use simple_logger::SimpleLogger;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

#[derive(Parser, Debug, Clone)]
#[command(name = "benchmark", about = "redmux benchmarking utility", disable_help_flag = true)]
struct Params {
    #[arg(long, action = clap::ArgAction::HelpLong, help = "Print help")]
    help: Option<bool>,

    /// Server hostname
    #[arg(short = 'h', long, default_value = "127.0.0.1")]
    hostname: String,

    /// Server port
    #[arg(short = 'p', long, default_value_t = 6379)]
    port: u16,

    /// Path to a unix socket to connect to (if set, overrides host/port)
    #[arg(short = 'u', long)]
    unix_socket: Option<PathBuf>,

    /// Password for redis AUTH
    #[arg(short = 'a', long)]
    password: Option<String>,

    /// Number of parallel connections
    #[arg(short = 'c', long, default_value_t = 5)]
    clients: usize,

    /// Total number of requests
    #[arg(short = 'n', long, default_value_t = 10000)]
    requests: usize,

    /// Number of requests to send in parallel
    #[arg(short = 'b', long)]
    batch_size: Option<usize>,

    /// Pipeline requests (honours batch-size if set)
    #[arg(short = 'P', long)]
    pipeline: bool,

    /// Data size of the SET value in bytes
    #[arg(short = 'd', long, default_value_t = 2)]
    data_size: usize,
}

impl Params {
    fn client_options(&self) -> ClientOptions {
        ClientOptions {
            host: self.hostname.clone(),
            port: self.port,
            unix_socket: self.unix_socket.clone(),
            password: self.password.clone(),
            autoconnect: false,
            tcp_nodelay: true,
            connect_timeout: Duration::from_secs(20),
            ..ClientOptions::default()
        }
    }
}

async fn multiple_set(
    params: Params,
    client_number: usize,
    requests_per_client: usize,
    value: String,
) -> redmux::Result<usize> {
    let client = Client::new(params.client_options());
    info!("Connect client {}", client_number);
    client.connect().await?;
    info!("Client {} connected", client_number);
    let batch_size = params.batch_size.unwrap_or(requests_per_client);
    let mut responses = 0usize;
    let mut remaining = requests_per_client;
    while remaining > 0 {
        let batch = batch_size.min(remaining);
        info!("Send {} requests with client {}", batch, client_number);
        let mut receivers = Vec::with_capacity(batch);
        for _ in 0..batch {
            let (tx, rx) = oneshot::channel();
            let callback: ReplyCallback = Box::new(move |reply| {
                let _ = tx.send(reply);
            });
            client
                .async_call(
                    vec!["SET".into(), "benchmark-key".into(), value.clone().into()],
                    Some(callback),
                    false,
                )
                .await?;
            receivers.push(rx);
        }
        for rx in receivers {
            if rx.await.is_ok() {
                responses += 1;
            }
        }
        info!(
            "Received {} responses with client {}",
            batch, client_number
        );
        remaining -= batch;
    }
    client.disconnect();
    Ok(responses)
}

async fn pipelined_multiple_set(
    params: Params,
    client_number: usize,
    requests_per_client: usize,
    value: String,
) -> redmux::Result<usize> {
    let client = Client::new(params.client_options());
    info!("Connect client {}", client_number);
    client.connect().await?;
    info!("Client {} connected", client_number);
    let pipeline_size = params.batch_size.unwrap_or(requests_per_client);
    let mut responses = 0usize;
    let mut pipeline = Pipeline::new();
    for _ in 0..requests_per_client {
        pipeline.stack_call(vec![
            "SET".into(),
            "benchmark-key".into(),
            value.clone().into(),
        ]);
        if pipeline.stacked_count() >= pipeline_size {
            responses += call_pipeline(&client, pipeline, client_number).await?;
            pipeline = Pipeline::new();
        }
    }
    if pipeline.stacked_count() > 0 {
        responses += call_pipeline(&client, pipeline, client_number).await?;
    }
    client.disconnect();
    Ok(responses)
}

async fn call_pipeline(
    client: &Client,
    pipeline: Pipeline,
    client_number: usize,
) -> redmux::Result<usize> {
    info!(
        "Send {} pipelined requests with client {}",
        pipeline.stacked_count(),
        client_number
    );
    let replies = client.call_pipeline(pipeline).await?;
    info!(
        "Received {} pipelined responses with client {}",
        replies.len(),
        client_number
    );
    Ok(replies.len())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    SimpleLogger::new().with_level(LevelFilter::Info).init()?;
    let params = Params::parse();
    if params.requests % params.clients != 0 {
        eprintln!("Number of requests must be a multiple of number of clients");
        std::process::exit(1);
    }
    let requests_per_client = params.requests / params.clients;
    let value = "*".repeat(params.data_size);
    info!("Max requests per client: {}", requests_per_client);

    let before = Instant::now();
    let mut handles = Vec::with_capacity(params.clients);
    for client_number in 0..params.clients {
        let params = params.clone();
        let value = value.clone();
        let handle = if params.pipeline {
            tokio::spawn(pipelined_multiple_set(
                params,
                client_number,
                requests_per_client,
                value,
            ))
        } else {
            tokio::spawn(multiple_set(
                params,
                client_number,
                requests_per_client,
                value,
            ))
        };
        handles.push(handle);
    }
    let mut responses = 0usize;
    for handle in handles {
        responses += handle.await??;
    }
    let seconds = before.elapsed().as_secs_f64();
    println!("{} responses in {:.3} seconds", responses, seconds);
    println!(
        "{} requests per second",
        (params.requests as f64 / seconds) as u64
    );
    Ok(())
}
