//! Tail a chunked JSON stream and print one payload per line.
//!
//! Logs go to stderr; set `RUST_LOG=chirpstream=debug` for details.

use chirpstream::{
    connect, Failure, ReconnectBackoff, StreamBuilder, StreamError, StreamEvent,
    StreamRequest, DEFAULT_HEARTBEAT_TIMEOUT,
};
use clap::Parser;
use http::Method;
use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Pause between polls when `--no-block` is given without `--timeout`.
const POLL_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(name = "stream-tail", version, about)]
struct Args {
    /// Stream URL, http or https
    #[arg(long)]
    url: String,

    /// Extra request header, `Name: value`; may be repeated
    #[arg(long = "header", short = 'H')]
    headers: Vec<String>,

    /// Form-encoded body; switches the request to POST
    #[arg(long, short = 'd')]
    data: Option<String>,

    /// Report an idle timeout after this many seconds without a message
    #[arg(long)]
    timeout: Option<f64>,

    /// Give up on a connection after this many silent seconds
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_TIMEOUT.as_secs_f64())]
    heartbeat_timeout: f64,

    /// Poll instead of blocking for messages
    #[arg(long)]
    no_block: bool,

    /// Reconnect with backoff when the stream ends
    #[arg(long)]
    reconnect: bool,
}

impl Args {
    fn request(&self) -> Result<StreamRequest, StreamError> {
        let method = if self.data.is_some() {
            Method::POST
        } else {
            Method::GET
        };
        let mut request = StreamRequest::new(method, &self.url)?;
        for header in &self.headers {
            match header.split_once(':') {
                Some((name, value)) => request = request.header(name.trim(), value.trim()),
                None => warn!(header = %header, "ignoring header without ':'"),
            }
        }
        if let Some(data) = &self.data {
            request = request
                .header("content-type", "application/x-www-form-urlencoded")
                .body(data.clone());
        }
        Ok(request)
    }

    fn stream_builder(&self) -> StreamBuilder {
        let mut builder = StreamBuilder::new()
            .block(!self.no_block)
            .heartbeat_timeout(seconds(self.heartbeat_timeout));
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(seconds(timeout));
        }
        builder
    }
}

/// Negative or unrepresentable values count as zero.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let request = match args.request() {
        Ok(request) => request,
        Err(err) => {
            error!(%err, "bad request");
            return ExitCode::FAILURE;
        }
    };
    let builder = args.stream_builder();
    let mut backoff = ReconnectBackoff::new();

    loop {
        let delay = match connect(&request, &builder).await {
            Ok(mut stream) => {
                info!(url = %args.url, "connected");
                let mut stdout = std::io::stdout();
                let mut last = None;
                while let Some(event) = stream.next_event().await {
                    match event {
                        StreamEvent::Message(msg) => {
                            backoff.reset();
                            if writeln!(stdout, "{}", msg.payload()).is_err() {
                                return ExitCode::SUCCESS;
                            }
                        }
                        StreamEvent::Timeout => {
                            debug!("idle");
                            if args.no_block {
                                tokio::time::sleep(POLL_PAUSE).await;
                            }
                        }
                        terminal => {
                            warn!(state = %stream.state(), "stream ended");
                            last = Failure::from_event(&terminal);
                        }
                    }
                }
                let _ = stdout.flush();
                last.map(|failure| backoff.next_delay(failure))
            }
            Err(err) => {
                error!(%err, "connect failed");
                backoff.delay_for_error(&err)
            }
        };

        match delay {
            Some(delay) if args.reconnect => {
                info!(delay_ms = delay.as_millis() as u64, "reconnecting");
                tokio::time::sleep(delay).await;
            }
            _ => return ExitCode::FAILURE,
        }
    }
}
