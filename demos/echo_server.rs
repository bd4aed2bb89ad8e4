use std::time::Duration;

use strand_io::{ChannelHandler, Result, ServerConfig, TcpChannel, TcpServer};

/// A simple handler that echoes data back to the client.
struct EchoHandler;

impl ChannelHandler for EchoHandler {
    fn on_active(&self, channel: &TcpChannel) {
        println!("[INFO] New client connected: {:?}", channel.remote_addr());
    }

    fn on_read(&self, channel: &TcpChannel, data: &[u8]) {
        let message = String::from_utf8_lossy(data);
        println!(
            "[INFO] Received {} bytes from {:?}: {}",
            data.len(),
            channel.remote_addr(),
            message.trim_end()
        );
        channel.write_and_flush(data.to_vec());
    }

    fn on_inactive(&self, channel: &TcpChannel) {
        println!("[INFO] Client disconnected: {:?}", channel.remote_addr());
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let config = ServerConfig::builder()
        .address("127.0.0.1:8080".parse().unwrap())
        .workers(2)
        .build();
    let server = TcpServer::bind(config, EchoHandler)?;
    println!("[INFO] Echo server listening on {}", server.local_addr());
    println!("[INFO] Try: nc 127.0.0.1 8080");

    // Run until interrupted; Ctrl-C tears the process down.
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
