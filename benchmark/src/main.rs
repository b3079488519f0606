use clap::Parser;
use hdrhistogram::Histogram;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tonic::transport::Channel;

use pb::kv_service_client::KvServiceClient;
use pb::{ErrCode, GetRequest, KvReply, PutAppendRequest, WriteOp};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of concurrent clients
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// INTERVAL ms
    #[arg(short, long, default_value = "100")]
    interval: u64,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Comma separated server addresses, ordered by node id
    #[arg(
        short,
        long,
        default_value = "http://127.0.0.1:4001,http://127.0.0.1:4002,http://127.0.0.1:4003"
    )]
    servers: String,

    /// Number of distinct keys written
    #[arg(short, long, default_value = "16")]
    keys: u64,
}

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("kv");
}

/// A clerk that remembers the last known leader and retries a request with
/// the same sequence number until some leader answers it
struct Clerk {
    servers: Vec<String>,
    clients: Vec<Option<KvServiceClient<Channel>>>,
    leader: usize,
    client_id: u64,
    seq: u64,
}

impl Clerk {
    fn new(servers: Vec<String>) -> Self {
        let clients = servers.iter().map(|_| None).collect();
        Clerk {
            servers,
            clients,
            leader: 0,
            client_id: rand::random::<u64>(),
            seq: 0,
        }
    }

    async fn client(&mut self, i: usize) -> Option<KvServiceClient<Channel>> {
        if self.clients[i].is_none() {
            match KvServiceClient::connect(self.servers[i].clone()).await {
                Ok(client) => self.clients[i] = Some(client),
                Err(e) => {
                    eprintln!("Failed to connect to {}: {}", self.servers[i], e);
                    return None;
                }
            }
        }
        self.clients[i].clone()
    }

    /// Move on to the hinted leader, or the next server without a hint
    fn redirect(&mut self, reply: Option<&KvReply>) {
        match reply.map(|r| r.leader_hint as usize) {
            Some(hint) if hint >= 1 && hint <= self.servers.len() && hint - 1 != self.leader => {
                self.leader = hint - 1;
            }
            _ => self.leader = (self.leader + 1) % self.servers.len(),
        }
    }

    async fn put_append(&mut self, op: WriteOp, key: String, value: String) -> KvReply {
        self.seq += 1;
        loop {
            let leader = self.leader;
            let Some(mut client) = self.client(leader).await else {
                self.redirect(None);
                sleep(Duration::from_millis(50)).await;
                continue;
            };
            let request = tonic::Request::new(PutAppendRequest {
                client_id: self.client_id,
                seq: self.seq,
                op: op as i32,
                key: key.clone(),
                value: value.clone(),
            });
            match client.put_append(request).await {
                Ok(resp) => {
                    let reply = resp.into_inner();
                    if reply.err == ErrCode::Ok as i32 {
                        return reply;
                    }
                    self.redirect(Some(&reply));
                }
                Err(e) => {
                    eprintln!("Request to {} failed: {}", self.servers[leader], e);
                    self.clients[leader] = None;
                    self.redirect(None);
                    sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    async fn get(&mut self, key: String) -> KvReply {
        self.seq += 1;
        loop {
            let leader = self.leader;
            let Some(mut client) = self.client(leader).await else {
                self.redirect(None);
                sleep(Duration::from_millis(50)).await;
                continue;
            };
            let request = tonic::Request::new(GetRequest {
                client_id: self.client_id,
                seq: self.seq,
                key: key.clone(),
            });
            match client.get(request).await {
                Ok(resp) => {
                    let reply = resp.into_inner();
                    if reply.err == ErrCode::Ok as i32 || reply.err == ErrCode::NoKey as i32 {
                        return reply;
                    }
                    self.redirect(Some(&reply));
                }
                Err(e) => {
                    eprintln!("Request to {} failed: {}", self.servers[leader], e);
                    self.clients[leader] = None;
                    self.redirect(None);
                    sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let servers: Vec<String> = args
        .servers
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if servers.is_empty() {
        return Err("no servers given".into());
    }
    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3)?));
    let total_requests = Arc::new(Mutex::new(0u64));

    println!(
        "Starting benchmark with {} concurrent clients against {} servers, target INTERVAL: {}",
        args.concurrency,
        servers.len(),
        args.interval
    );

    // Spawn client tasks
    let mut handles = vec![];
    for worker in 0..args.concurrency {
        let servers = servers.clone();
        let histogram = histogram.clone();
        let total_requests = total_requests.clone();
        let keys = args.keys.max(1);
        let interval = args.interval;

        let handle = tokio::spawn(async move {
            let mut clerk = Clerk::new(servers);
            loop {
                let start = Instant::now();
                let key = format!("key-{}", rand::random::<u64>() % keys);
                clerk
                    .put_append(WriteOp::Append, key, format!("{},", worker))
                    .await;

                let duration = start.elapsed();
                let mut hist = histogram.lock().await;
                if let Err(e) = hist.record(duration.as_micros() as u64) {
                    eprintln!("Failed to record latency: {}", e);
                }
                let mut total = total_requests.lock().await;
                *total += 1;
                drop(total);
                drop(hist);

                sleep(Duration::from_millis(interval)).await;
            }
        });

        handles.push(handle);
    }

    // Run for specified duration
    sleep(Duration::from_secs(args.duration)).await;

    // Cancel all tasks
    for handle in handles {
        handle.abort();
    }

    // Read one key back through the leader as a sanity check
    let mut clerk = Clerk::new(servers);
    let reply = clerk.get("key-0".to_string()).await;
    println!("key-0 holds {} bytes", reply.value.len());

    // Print statistics
    let total = *total_requests.lock().await;
    let hist = histogram.lock().await;

    println!("\nBenchmark Results:");
    println!("Total Requests: {}", total);
    println!("Average TPS: {:.2}", total as f64 / args.duration as f64);
    println!("\nLatency Distribution (microseconds):");
    println!("p50: {}", hist.value_at_percentile(50.0));
    println!("p90: {}", hist.value_at_percentile(90.0));
    println!("p95: {}", hist.value_at_percentile(95.0));
    println!("p99: {}", hist.value_at_percentile(99.0));
    println!("p99.9: {}", hist.value_at_percentile(99.9));

    Ok(())
}
