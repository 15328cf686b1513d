//! MJPEG relay example
//!
//! Accepts one MJPEG byte stream and serves it to any number of browsers as
//! `multipart/x-mixed-replace`.
//!
//! Run with: cargo run --example mjpeg_relay [SOURCE_ADDR] [HTTP_ADDR]
//!
//! Examples:
//!   cargo run --example mjpeg_relay                              # source 0.0.0.0:5000, http 0.0.0.0:8080
//!   cargo run --example mjpeg_relay 127.0.0.1:5001 0.0.0.0:8081
//!
//! ## Feeding a stream
//!
//! With ffmpeg:
//!   ffmpeg -re -i input.mp4 -c:v mjpeg -q:v 5 -f mjpeg tcp://localhost:5000
//!
//! ## Watching
//!
//! Open http://localhost:8080/ in a browser. Viewers joining late start at
//! the most recent image; a viewer that falls a full buffer behind is
//! disconnected.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use framecast::media::StreamFormat;
use framecast::relay::sink::DEFAULT_BOUNDARY;
use framecast::relay::{MultipartSink, RelayConfig, RelayEvent, StreamMultiplexer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn serve_viewer(
    mux: Arc<StreamMultiplexer>,
    mut socket: TcpStream,
    peer: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // The request itself is irrelevant; every path gets the stream
    let mut request = [0u8; 1024];
    let _ = socket.read(&mut request).await?;

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
        DEFAULT_BOUNDARY
    );
    socket.write_all(header.as_bytes()).await?;

    let handle = mux.join(MultipartSink::new(socket))?;
    println!("[viewer {}] joined from {}", handle.id(), peer);
    handle.closed().await;

    let stats = handle.stats();
    println!(
        "[viewer {}] left after {} bytes in {:?}",
        stats.id, stats.bytes_forwarded, stats.uptime
    );
    Ok(())
}

fn parse_addr(arg: Option<&String>, default: &str) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    Ok(arg.map(String::as_str).unwrap_or(default).parse()?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let source_addr = parse_addr(args.get(1), "0.0.0.0:5000")?;
    let http_addr = parse_addr(args.get(2), "0.0.0.0:8080")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("framecast=debug".parse()?)
                .add_directive("mjpeg_relay=debug".parse()?),
        )
        .init();

    let config = RelayConfig::with_format(StreamFormat::Mjpeg).read_timeout(Duration::from_secs(10));
    let mux = Arc::new(StreamMultiplexer::new(config));

    println!("Waiting for an MJPEG source on {}", source_addr);
    let source_listener = TcpListener::bind(source_addr).await?;
    let (source, source_peer) = source_listener.accept().await?;
    println!("Source connected from {}", source_peer);
    mux.start(source)?;

    let http = TcpListener::bind(http_addr).await?;
    println!("Serving viewers on http://{}/", http_addr);

    let mut events = mux.subscribe_events();
    let stats_mux = Arc::clone(&mux);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            let stats = stats_mux.stats();
            println!(
                "Stats: written={} frames={} viewers={} bitrate={}bps overruns={}",
                stats.total_written,
                stats.frames_seen,
                stats.active_tailers,
                stats.bitrate(),
                stats.overruns
            );
        }
    });

    loop {
        tokio::select! {
            accepted = http.accept() => {
                let (socket, peer) = accepted?;
                let mux = Arc::clone(&mux);
                tokio::spawn(async move {
                    if let Err(e) = serve_viewer(mux, socket, peer).await {
                        eprintln!("[{}] viewer error: {}", peer, e);
                    }
                });
            }
            event = events.recv() => {
                if let Ok(RelayEvent::Stopped) = event {
                    println!("Source ended");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down");
                break;
            }
        }
    }

    let _ = mux.stop().await;
    Ok(())
}
