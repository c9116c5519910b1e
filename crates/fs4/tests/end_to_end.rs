mod common;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use fs4::backend::{
    BackendConfig, BackendError, BackendPool, ChannelState, PacketListener, PoolConfig,
};
use fs4::packet::{
    peek_declared_length, ChannelId, GetSummaries, Message, Ping, Query, QueryResult,
};

use common::{MockBackend, QUERY};

fn query(offset: u32, hits: u32) -> Message {
    Message::from(Query::new(offset, hits, Duration::from_millis(1000)))
}

#[test]
fn query_returns_result_on_its_channel() {
    let backend = MockBackend::standard();
    let pool = BackendPool::default();
    let channel = pool.open_channel(backend.endpoint()).unwrap();

    assert!(channel.send(&query(0, 10)).unwrap());
    let replies = channel.receive(Duration::from_millis(1000), 1).unwrap();

    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].code(), 217);
    assert_eq!(replies[0].document_count(), Some(2));
    let result = replies[0].as_query_result().unwrap();
    assert_eq!(result.coverage.docs, 5);
    assert_eq!(result.coverage.active, 5);
    assert_eq!(result.total_document_count, 5);
}

#[test]
fn ping_returns_pong() {
    let backend = MockBackend::standard();
    let pool = BackendPool::default();
    let channel = pool.open_ping_channel(backend.endpoint()).unwrap();

    assert!(channel.send(&Message::from(Ping::default())).unwrap());
    let replies = channel.receive(Duration::from_millis(1000), 1).unwrap();

    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].code(), 221);
    assert_eq!(replies[0].active_documents(), Some(1));
}

#[test]
fn concurrent_channels_see_only_their_replies() {
    let backend = MockBackend::standard();
    let pool = Arc::new(BackendPool::default());

    let workers: Vec<_> = (0..8u32)
        .map(|worker| {
            let pool = Arc::clone(&pool);
            let endpoint = backend.endpoint().clone();
            thread::spawn(move || {
                let channel = pool.open_channel(&endpoint).unwrap();
                let mut offsets = Vec::new();
                for round in 0..5 {
                    let offset = worker * 100 + round;
                    assert!(channel.send(&query(offset, 1)).unwrap());
                    for reply in channel.receive(Duration::from_secs(5), 1).unwrap() {
                        offsets.push(reply.as_query_result().unwrap().offset);
                    }
                }
                offsets
            })
        })
        .collect();

    for (worker, handle) in workers.into_iter().enumerate() {
        let worker = worker as u32;
        let expected: Vec<_> = (0..5).map(|round| worker * 100 + round).collect();
        assert_eq!(handle.join().unwrap(), expected);
    }
    assert_eq!(pool.statistics().total.connections_opened, 1);
}

#[test]
fn receive_times_out_within_bounds() {
    let backend = MockBackend::silent();
    let pool = BackendPool::default();
    let channel = pool.open_channel(backend.endpoint()).unwrap();
    assert!(channel.send(&query(0, 10)).unwrap());

    let timeout = Duration::from_millis(200);
    let started = Instant::now();
    let err = channel.receive(timeout, 1).unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, BackendError::ChannelTimeout { .. }));
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_secs(1));
    assert_eq!(channel.state(), ChannelState::AwaitingResponse);
}

#[test]
fn closed_channel_is_invalid() {
    let backend = MockBackend::standard();
    let pool = BackendPool::default();
    let channel = pool.open_channel(backend.endpoint()).unwrap();
    channel.close();

    assert!(matches!(
        channel.send(&query(0, 10)),
        Err(BackendError::InvalidChannel(_))
    ));
    assert!(matches!(
        channel.receive(Duration::from_millis(100), 1),
        Err(BackendError::InvalidChannel(_))
    ));
}

#[test]
fn summaries_follow_query() {
    let backend = MockBackend::standard();
    let pool = BackendPool::default();
    let channel = pool.open_channel(backend.endpoint()).unwrap();

    let snapshot = channel
        .send_query(&Query::new(0, 10, Duration::from_millis(1000)).with_rank_profile("default"))
        .unwrap()
        .unwrap();
    let replies = channel.receive(Duration::from_secs(1), 1).unwrap();
    let result: &QueryResult = replies[0].as_query_result().unwrap();

    let request = GetSummaries::for_documents(snapshot, &result.documents);
    assert!(channel.send(&Message::from(request)).unwrap());

    let mut summaries = Vec::new();
    loop {
        let batch = channel.receive(Duration::from_secs(1), 1).unwrap();
        let done = batch.iter().any(Message::is_terminal_reply);
        summaries.extend(batch);
        if done {
            break;
        }
    }
    assert_eq!(
        summaries.iter().map(Message::code).collect::<Vec<_>>(),
        vec![205, 205, 200]
    );
}

#[test]
fn replies_for_other_channels_are_not_delivered() {
    // Every query is answered twice: once on its own channel, once on an id
    // nobody opened.
    let backend = MockBackend::start(|frame| {
        let mut replies = common::standard_reply(frame);
        if frame.packet_code() == QUERY {
            replies.push((Message::from(QueryResult::default()), 0xdead));
        }
        replies
    });
    let pool = BackendPool::default();
    let channel = pool.open_channel(backend.endpoint()).unwrap();

    assert!(channel.send(&query(7, 10)).unwrap());
    let replies = channel.receive(Duration::from_secs(1), 1).unwrap();
    assert_eq!(replies[0].as_query_result().unwrap().offset, 7);

    // Give the stray reply time to arrive before checking it was dropped.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(channel.pending(), 0);
    assert_eq!(pool.statistics().total.dropped_packets, 1);
}

#[derive(Debug, Default)]
struct Recorder {
    events: Mutex<Vec<(&'static str, u32, usize)>>,
}

impl PacketListener for Recorder {
    fn on_send(&self, _channel: ChannelId, message: &Message, frame: &[u8]) {
        check_frame(frame);
        self.events
            .lock()
            .unwrap()
            .push(("send", message.code(), frame.len()));
    }

    fn on_receive(&self, _channel: Option<ChannelId>, message: &Message, frame: &[u8]) {
        check_frame(frame);
        self.events
            .lock()
            .unwrap()
            .push(("receive", message.code(), frame.len()));
    }
}

fn check_frame(frame: &[u8]) {
    assert_eq!(peek_declared_length(frame).unwrap() as usize, frame.len() - 4);
}

#[test]
fn listener_sees_raw_frames() {
    let backend = MockBackend::standard();
    let recorder = Arc::new(Recorder::default());
    let config = PoolConfig::default()
        .with_backend_config(BackendConfig::default().with_listener(recorder.clone()));
    let pool = BackendPool::new(config);

    let channel = pool.open_ping_channel(backend.endpoint()).unwrap();
    assert!(channel.send(&Message::from(Ping::default())).unwrap());
    channel.receive(Duration::from_secs(1), 1).unwrap();

    // The pong can be routed before the send hook runs.
    let mut events = recorder.events.lock().unwrap().clone();
    events.sort();
    assert_eq!(events.len(), 2);
    assert_eq!((events[0].0, events[0].1), ("receive", 221));
    assert_eq!((events[1].0, events[1].1), ("send", 220));
}

#[test]
fn pool_shutdown_closes_channels() {
    let backend = MockBackend::silent();
    let pool = Arc::new(BackendPool::default());
    let channel = pool.open_channel(backend.endpoint()).unwrap();

    let waiter = thread::spawn(move || channel.receive(Duration::from_secs(10), 1));
    thread::sleep(Duration::from_millis(50));
    pool.shutdown();

    assert!(matches!(
        waiter.join().unwrap(),
        Err(BackendError::InvalidChannel(_))
    ));
    assert!(matches!(
        pool.open_channel(backend.endpoint()),
        Err(BackendError::ShutDown)
    ));
}
