//! End-to-end signaling benchmark for Confide.
//!
//! Registers user/confidant pairs against a running server and bounces
//! `ice-candidate` events between each pair over real WebSocket connections.
//!
//! ```bash
//! confide &
//! e2e_signaling 16
//! ```

use confide_protocol::{codec, ClientEvent, Role, ServerEvent};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

const DEFAULT_URL: &str = "ws://127.0.0.1:3000/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_pairs: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = std::env::var("CONFIDE_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());

    println!("Confide end-to-end signaling benchmark");
    println!("  Server: {}", url);
    println!("  Pairs:  {}", num_pairs);
    println!("  Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let relayed = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_pairs + 1));

    let mut handles = Vec::new();
    for pair in 0..num_pairs {
        let relayed = Arc::clone(&relayed);
        let barrier = Arc::clone(&barrier);
        let url = url.clone();

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_pair(&url, pair, relayed, barrier).await {
                eprintln!("Pair {} error: {}", pair, e);
            }
        }));
    }

    barrier.wait().await;
    println!("All {} pairs registered", num_pairs);

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    relayed.store(0, Ordering::SeqCst);
    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total = relayed.load(Ordering::SeqCst);
    let per_sec = total as f64 / elapsed.as_secs_f64();

    println!();
    println!("Results");
    println!("  Duration:        {:>10.2}s", elapsed.as_secs_f64());
    println!("  Relayed events:  {:>10}", total);
    println!("  Throughput:      {:>10.0} events/s", per_sec);
    println!("  Per pair:        {:>10.0} events/s", per_sec / num_pairs as f64);

    for handle in handles {
        handle.abort();
    }
}

/// Connect, wait for `connected`, and register.
async fn register(url: &str, peer_id: String, role: Role) -> Result<Socket, BoxError> {
    let (mut ws, _) = connect_async(url).await?;
    expect(&mut ws, |event| matches!(event, ServerEvent::Connected { .. })).await?;

    let register = codec::encode_text(&ClientEvent::register(peer_id, role, None))?;
    ws.send(Message::Text(register)).await?;
    expect(&mut ws, |event| matches!(event, ServerEvent::Registered { .. })).await?;

    Ok(ws)
}

/// Read until an event matching `pred` arrives.
async fn expect(ws: &mut Socket, pred: impl Fn(&ServerEvent) -> bool) -> Result<(), BoxError> {
    while let Some(msg) = ws.next().await {
        if let Message::Text(text) = msg? {
            let event: ServerEvent = codec::decode_text(&text)?;
            if pred(&event) {
                return Ok(());
            }
        }
    }
    Err("connection closed before expected event".into())
}

async fn run_pair(
    url: &str,
    pair: usize,
    relayed: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let confidant_id = format!("bench-confidant-{}", pair);
    let user_id = format!("bench-user-{}", pair);

    let confidant = register(url, confidant_id.clone(), Role::Confidant).await?;
    let user = register(url, user_id.clone(), Role::User).await?;

    barrier.wait().await;

    let (user_tx, user_rx) = user.split();
    let (confidant_tx, confidant_rx) = confidant.split();

    // The user starts the exchange; each side answers every candidate it receives.
    let first = candidate_message(&confidant_id)?;
    let user_side = bounce(user_tx, user_rx, confidant_id, Some(first), relayed.clone());
    let confidant_side = bounce(confidant_tx, confidant_rx, user_id, None, relayed);

    tokio::try_join!(user_side, confidant_side)?;
    Ok(())
}

fn candidate_message(target: &str) -> Result<Message, BoxError> {
    let event = ClientEvent::IceCandidate {
        target_id: target.to_string(),
        candidate: json!({"candidate": "candidate:1 1 udp 2122260223 10.0.0.2 49152 typ host"}),
    };
    Ok(Message::Text(codec::encode_text(&event)?))
}

async fn bounce(
    mut tx: SplitSink<Socket, Message>,
    mut rx: SplitStream<Socket>,
    target: String,
    first: Option<Message>,
    relayed: Arc<AtomicU64>,
) -> Result<(), BoxError> {
    if let Some(first) = first {
        tx.send(first).await?;
    }

    let reply = candidate_message(&target)?;
    while let Some(msg) = rx.next().await {
        let Message::Text(text) = msg? else {
            continue;
        };
        if let ServerEvent::IceCandidate { .. } = codec::decode_text(&text)? {
            relayed.fetch_add(1, Ordering::Relaxed);
            tx.send(reply.clone()).await?;
        }
    }
    Ok(())
}
