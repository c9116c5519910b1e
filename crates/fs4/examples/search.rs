//! Run a query and fetch summaries for its hits against a local backend.
//!
//! Every frame is traced with a hex dump of its first bytes; run with
//! `cargo run -p fs4 --example search` and watch stderr.

use std::error::Error;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fs4::backend::{BackendConfig, BackendPool, PoolConfig, TracingListener};
use fs4::packet::{
    ChannelId, Coverage, Document, DocumentSummary, GetSummaries, GlobalId, Message, PacketReader,
    PacketType, PacketWriter, Query, QueryResult,
};
use fs4::transport::{Endpoint, Fs4Listener};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(LevelFilter::TRACE)
        .with_ansi(false)
        .with_target(false)
        .try_init();
}

fn hits() -> Vec<Document> {
    (1..=3u8)
        .map(|n| Document::new(GlobalId::new([n; 12]), 1.0 / f64::from(n)))
        .collect()
}

/// The channel id of a query frame, right after the code word.
fn query_channel(frame: &[u8]) -> ChannelId {
    frame
        .get(8..12)
        .and_then(|word| word.try_into().ok())
        .map_or(0, u32::from_be_bytes)
}

/// Answers queries on their channel and summary requests with one summary
/// per hit followed by an end-of-list marker.
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
            while let Ok(frame) = reader.read_raw() {
                let replies = match PacketType::from_code(frame.packet_code()) {
                    Some(PacketType::Query) => {
                        let result = QueryResult {
                            total_document_count: 3,
                            max_rank: 1.0,
                            documents: hits(),
                            coverage: Coverage::full(3),
                            ..QueryResult::default()
                        };
                        vec![(Message::from(result), query_channel(frame.as_bytes()))]
                    }
                    Some(PacketType::GetSummaries) => hits()
                        .into_iter()
                        .map(|doc| {
                            let body = format!("{{\"title\":\"document {}\"}}", doc.gid);
                            (Message::from(DocumentSummary::new(doc.gid, body)), 0)
                        })
                        .chain([(Message::Eol, 0)])
                        .collect(),
                    _ => Vec::new(),
                };
                for (reply, channel) in replies {
                    if writer.send(&reply, channel).is_err() {
                        return;
                    }
                }
            }
        }
    });

    Ok(endpoint)
}

fn main() -> Result<(), Box<dyn Error>> {
    init_logging();

    let endpoint = spawn_backend()?;
    let backend = BackendConfig::default()
        .with_listener(Arc::new(TracingListener::default()))
        .with_connect_timeout(Duration::from_secs(1));
    let pool = BackendPool::new(PoolConfig::default().with_backend_config(backend));
    let channel = pool.open_channel(&endpoint)?;

    let query = Query::new(0, 10, Duration::from_secs(1)).with_rank_profile("default");
    let Some(snapshot) = channel.send_query(&query)? else {
        warn!(%endpoint, "query could not be sent");
        return Ok(());
    };

    let replies = channel.receive(Duration::from_secs(1), 1)?;
    let Some(result) = replies.iter().find_map(Message::as_query_result) else {
        warn!(%endpoint, "backend did not answer with a result");
        return Ok(());
    };
    info!(
        hits = result.document_count(),
        total = result.total_document_count,
        coverage = result.coverage.docs,
        "query result"
    );

    let request = GetSummaries::for_documents(snapshot, &result.documents);
    channel.send(&Message::from(request))?;

    let mut done = false;
    while !done {
        for reply in channel.receive(Duration::from_secs(1), 1)? {
            match &reply {
                Message::DocumentSummary(summary) => {
                    println!("{} {}", summary.gid, String::from_utf8_lossy(&summary.data));
                }
                Message::Error(error) => warn!(code = error.error_code, "{}", error.message),
                _ => {}
            }
            done |= reply.is_terminal_reply();
        }
    }

    println!("{}", serde_json::to_string_pretty(&pool.statistics())?);
    Ok(())
}
