use chain_pulse::delivery::{ChannelSink, StreamEvent, Transport};
use chain_pulse::hub::SubscriptionHub;
use chain_pulse::model::{AnalyticsFrame, ChainSummary, TopicKey};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;

const EXPIRY: i64 = 4_102_444_800;

fn key() -> TopicKey {
    TopicKey {
        symbol: "BANKNIFTY".into(),
        expiry: EXPIRY,
    }
}

fn frame(seq: usize) -> Arc<AnalyticsFrame> {
    Arc::new(AnalyticsFrame {
        symbol: "BANKNIFTY".into(),
        expiry: EXPIRY,
        snapshot_timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000 + seq as i64, 0)
            .expect("timestamp"),
        spot: 50_000.0 + seq as f64,
        strikes: vec![],
        summary: ChainSummary::default(),
    })
}

fn drain_spots(rx: &mut Receiver<StreamEvent>) -> Vec<f64> {
    std::iter::from_fn(|| rx.try_recv().ok())
        .filter_map(|event| match event {
            StreamEvent::Frame(frame) => Some(frame.spot),
            StreamEvent::Error(_) => None,
        })
        .collect()
}

#[test]
fn every_subscriber_sees_every_frame_in_order() {
    const FRAMES: usize = 25;
    const SUBSCRIBERS: usize = 6;

    let hub = SubscriptionHub::new();
    let mut receivers = Vec::new();
    for i in 0..SUBSCRIBERS {
        let transport = if i % 2 == 0 {
            Transport::Push
        } else {
            Transport::EventStream
        };
        let (sink, rx) = ChannelSink::channel(transport, FRAMES);
        hub.subscribe(&key(), Arc::new(sink));
        receivers.push(rx);
    }

    for seq in 0..FRAMES {
        let report = hub.publish(&frame(seq));
        assert_eq!(report.delivered, SUBSCRIBERS);
        assert_eq!(report.lagged, 0);
    }

    let expected: Vec<f64> = (0..FRAMES).map(|seq| 50_000.0 + seq as f64).collect();
    for rx in receivers.iter_mut() {
        assert_eq!(drain_spots(rx), expected);
    }
}

#[test]
fn late_subscriber_gets_no_backlog() {
    let hub = SubscriptionHub::new();
    let (early, mut early_rx) = ChannelSink::channel(Transport::Push, 8);
    hub.subscribe(&key(), Arc::new(early));
    hub.publish(&frame(0));
    hub.publish(&frame(1));

    let (late, mut late_rx) = ChannelSink::channel(Transport::Push, 8);
    hub.subscribe(&key(), Arc::new(late));
    hub.publish(&frame(2));

    assert_eq!(drain_spots(&mut early_rx), vec![50_000.0, 50_001.0, 50_002.0]);
    assert_eq!(drain_spots(&mut late_rx), vec![50_002.0]);
}

#[test]
fn removal_during_broadcast_keeps_remaining_streams_whole() {
    const FRAMES: usize = 200;

    let hub = SubscriptionHub::new();
    let (keeper, mut keeper_rx) = ChannelSink::channel(Transport::Push, FRAMES);
    hub.subscribe(&key(), Arc::new(keeper));

    let mut leavers = Vec::new();
    for _ in 0..4 {
        let (sink, rx) = ChannelSink::channel(Transport::EventStream, FRAMES);
        let outcome = hub.subscribe(&key(), Arc::new(sink));
        leavers.push((outcome.id, rx));
    }

    std::thread::scope(|scope| {
        let publisher = scope.spawn(|| {
            for seq in 0..FRAMES {
                hub.publish(&frame(seq));
            }
        });
        for (n, (id, rx)) in leavers.drain(..).enumerate() {
            if n % 2 == 0 {
                assert!(!hub.unsubscribe(&key(), id));
            } else {
                // closed receiver is pruned by the next publish
                drop(rx);
            }
            std::thread::yield_now();
        }
        publisher.join().expect("publisher panicked");
    });

    let expected: Vec<f64> = (0..FRAMES).map(|seq| 50_000.0 + seq as f64).collect();
    assert_eq!(drain_spots(&mut keeper_rx), expected);
    assert!(hub.has_topic(&key()));
}

#[test]
fn topics_are_isolated() {
    let hub = SubscriptionHub::new();
    let other = TopicKey {
        symbol: "NIFTY".into(),
        expiry: EXPIRY,
    };
    let (a, mut a_rx) = ChannelSink::channel(Transport::Push, 4);
    let (b, mut b_rx) = ChannelSink::channel(Transport::Push, 4);
    hub.subscribe(&key(), Arc::new(a));
    hub.subscribe(&other, Arc::new(b));

    hub.publish(&frame(7));
    hub.publish_error(&other, "upstream down");

    assert_eq!(drain_spots(&mut a_rx), vec![50_007.0]);
    assert!(matches!(b_rx.try_recv(), Ok(StreamEvent::Error(_))));
    assert!(b_rx.try_recv().is_err());
    assert_eq!(hub.topics(), vec![key(), other]);
}
