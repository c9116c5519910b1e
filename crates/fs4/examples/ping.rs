//! Health-check a backend: start a local backend that answers pings, then
//! ping it a few times through a pool.
//!
//! Run with `cargo run -p fs4 --example ping`.

use std::error::Error;
use std::thread;
use std::time::Duration;

use fs4::backend::BackendPool;
use fs4::packet::{Message, PacketReader, PacketType, PacketWriter, Ping, Pong};
use fs4::transport::{Endpoint, Fs4Listener};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(LevelFilter::DEBUG)
        .with_ansi(false)
        .with_target(false)
        .try_init();
}

fn spawn_backend() -> Result<Endpoint, Box<dyn Error>> {
    let listener = Fs4Listener::bind(&"127.0.0.1:0".parse()?)?;
    let endpoint = listener.local_endpoint().clone();

    thread::spawn(move || {
        while let Ok(stream) = listener.accept() {
            let Ok(read_half) = stream.try_clone() else {
                continue;
            };
            let mut reader = PacketReader::new(read_half);
            let mut writer = PacketWriter::new(stream);
            let mut docstamp = 0;
            while let Ok(frame) = reader.read_raw() {
                if frame.packet_code() != PacketType::Ping.code() {
                    continue;
                }
                docstamp += 1;
                let pong = Pong {
                    docstamp,
                    active_documents: Some(1_000),
                    ..Pong::default()
                };
                if writer.send(&Message::from(pong), 0).is_err() {
                    break;
                }
            }
        }
    });

    Ok(endpoint)
}

fn main() -> Result<(), Box<dyn Error>> {
    init_logging();

    let endpoint = spawn_backend()?;
    let pool = BackendPool::default();
    let channel = pool.open_ping_channel(&endpoint)?;

    for _ in 0..3 {
        if !channel.send(&Message::from(Ping::default()))? {
            warn!(%endpoint, "ping could not be sent");
            break;
        }
        for reply in channel.receive(Duration::from_secs(1), 1)? {
            if let Some(pong) = reply.as_pong() {
                info!(
                    %endpoint,
                    docstamp = pong.docstamp,
                    active_documents = ?pong.active_documents(),
                    "pong"
                );
            }
        }
        thread::sleep(Duration::from_millis(200));
    }

    println!("{}", serde_json::to_string_pretty(&pool.statistics())?);
    pool.shutdown();
    Ok(())
}
