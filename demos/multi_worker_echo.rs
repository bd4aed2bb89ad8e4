//! Echo server plus an in-process client swarm, showing connections being
//! spread over the worker pool. Run with `RUST_LOG=debug` to watch the
//! per-loop adoption messages.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strand_io::{ChannelHandler, Result, ServerConfig, TcpChannel, TcpServer};

struct CountingEcho {
    served: Arc<AtomicU64>,
}

impl ChannelHandler for CountingEcho {
    fn on_active(&self, channel: &TcpChannel) {
        println!(
            "[INFO] loop {} serving {:?}",
            channel.reactor().id(),
            channel.remote_addr()
        );
    }

    fn on_read(&self, channel: &TcpChannel, data: &[u8]) {
        self.served.fetch_add(data.len() as u64, Ordering::Relaxed);
        channel.write_and_flush(data.to_vec());
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let served = Arc::new(AtomicU64::new(0));
    let config = ServerConfig::builder().workers(4).build();
    let server = TcpServer::bind(
        config,
        CountingEcho {
            served: served.clone(),
        },
    )?;
    let addr = server.local_addr();
    println!("[INFO] Echo server listening on {addr} with 4 workers");

    let clients: Vec<_> = (0..16u8)
        .map(|i| {
            std::thread::spawn(move || {
                let mut stream = std::net::TcpStream::connect(addr).unwrap();
                let payload = format!("hello from client {i}");
                stream.write_all(payload.as_bytes()).unwrap();
                let mut echoed = vec![0u8; payload.len()];
                stream.read_exact(&mut echoed).unwrap();
                assert_eq!(echoed, payload.as_bytes());
            })
        })
        .collect();
    for client in clients {
        let _ = client.join();
    }

    println!(
        "[INFO] {} connections dispatched, {} bytes echoed",
        server.dispatched(),
        served.load(Ordering::Relaxed)
    );
    server.shutdown_gracefully(Duration::from_millis(100), Duration::from_secs(5));
    Ok(())
}
