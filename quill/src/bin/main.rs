use quill::packet::MAX_PACKET_SIZE;
use quill::{Config, Endpoint};

use std::io::Write;
use std::time::Instant;

use clap::Parser;
use log::warn;

#[derive(Parser)]
struct Args {
    /// port number, default is 4433
    #[clap(short, long, default_value = "4433")]
    port: u16,

    /// Length of locally issued connection IDs.
    #[clap(short, long, default_value = "8")]
    cid_len: usize,

    /// Require a retry token on incoming Initials, answering a Retry when
    /// it is missing or stale.
    #[clap(short = 't', long)]
    check_token: bool,

    /// Require all coalesced segments of a datagram to share a
    /// destination connection ID.
    #[clap(long)]
    strict_coalescing: bool,

    /// Frequency to print the stats (every N datagrams).
    #[clap(short = 'i', long, default_value = "1000")]
    print_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    env_logger::builder()
        .format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()))
        .init();
    let args: Args = Args::parse();

    let mut config = Config::default();
    config.local_cid_len = args.cid_len;
    config.check_token = args.check_token;
    config.enforce_coalesced_cid = args.strict_coalescing;

    let socket = tokio::net::UdpSocket::bind(format!("0.0.0.0:{}", args.port))
        .await
        .map_err(|e| format!("error creating listening socket: {e}"))?;
    let local_addr = socket
        .local_addr()
        .map_err(|e| format!("error reading local address: {e}"))?;

    println!("listening on port {}", args.port);

    let mut endpoint = Endpoint::new(config);
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let mut last_print_stats = 0;

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!("error receiving datagram: {e}");
                continue;
            }
        };
        let recv_ts = Instant::now();

        endpoint.incoming_packet(&mut buf[..len], src, local_addr, recv_ts);

        // flush whatever the reception path wants said back
        while let Some(sp) = endpoint.next_stateless_packet() {
            if let Err(e) = socket.send_to(&sp.bytes, sp.peer_addr).await {
                warn!("error sending stateless response: {e}");
            }
        }

        if endpoint.stats().datagrams - last_print_stats >= args.print_interval {
            last_print_stats = endpoint.stats().datagrams;
            endpoint.print_stats();
        }
    }
}
