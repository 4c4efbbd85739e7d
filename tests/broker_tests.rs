use std::sync::Arc;
use std::time::Duration;

use pinbroker::broker::{Broker, BrokerConfig, BrokerError};
use pinbroker::bus::SimulatedBus;
use pinbroker::protocol::{CommandValue, Verb};
use pinbroker::store::FetchOutcome;

const WAIT: Duration = Duration::from_secs(2);

fn fast_config() -> BrokerConfig {
    BrokerConfig {
        result_poll_interval: Duration::from_millis(2),
        idle_wait: Duration::from_millis(2),
        ..BrokerConfig::default()
    }
}

#[test]
fn test_identify_round_trip() {
    let bus = SimulatedBus::new();
    bus.add_board(0x20);

    let mut broker = Broker::new(fast_config());
    broker.start(bus).unwrap();

    assert_eq!(
        broker.submit_and_wait(Verb::Identify, 0x20, 0, WAIT).unwrap(),
        CommandValue::Flag(true)
    );
    assert_eq!(
        broker.submit_and_wait(Verb::Identify, 0x23, 0, WAIT).unwrap(),
        CommandValue::Flag(false)
    );

    broker.stop();
    assert!(!broker.is_running());
}

#[test]
fn test_setpin_then_getpin_reads_high() {
    let bus = SimulatedBus::new();
    bus.add_board(0x21);

    let mut broker = Broker::new(fast_config());
    broker.start(bus).unwrap();

    // Direction to output first, then drive and read back.
    assert_eq!(
        broker.submit_and_wait(Verb::ClrDirBit, 0x21, 7, WAIT).unwrap(),
        CommandValue::Flag(true)
    );
    assert_eq!(
        broker.submit_and_wait(Verb::SetPin, 0x21, 7, WAIT).unwrap(),
        CommandValue::Flag(true)
    );
    assert_eq!(
        broker.submit_and_wait(Verb::GetPin, 0x21, 7, WAIT).unwrap(),
        CommandValue::Bit(1)
    );
}

#[test]
fn test_fire_and_forget_submission() {
    let bus = SimulatedBus::new();
    bus.add_board(0x20);

    let mut broker = Broker::new(fast_config());
    broker.start(bus.clone()).unwrap();

    let token = broker.submit(Verb::SetPin, 0x20, 2).unwrap();

    // The caller may ignore the token entirely; the pin still moves.
    let deadline = std::time::Instant::now() + WAIT;
    loop {
        if let FetchOutcome::Ready(result) = broker.fetch_result(token) {
            assert_eq!(result.value, CommandValue::Flag(true));
            break;
        }
        assert!(std::time::Instant::now() < deadline, "no result published");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_wait_timeout_is_distinguished_from_failure() {
    // No worker started: nothing will ever answer.
    let broker = Broker::new(BrokerConfig {
        result_poll_interval: Duration::from_millis(2),
        ..BrokerConfig::default()
    });

    let outcome = broker.submit_and_wait(Verb::GetPin, 0x20, 0, Duration::from_millis(50));
    match outcome {
        Err(BrokerError::Timeout(_)) => {}
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[test]
fn test_stalled_broker_expires_rapid_duplicates() {
    let bus = SimulatedBus::new();
    bus.add_board(0x20);

    // Short command TTL, worker not yet running: the burst of
    // duplicate intents must die in the queue, not execute late.
    let mut broker = Broker::new(BrokerConfig {
        command_ttl: Duration::from_millis(50),
        result_poll_interval: Duration::from_millis(2),
        idle_wait: Duration::from_millis(2),
        ..BrokerConfig::default()
    });

    let mut tokens = Vec::new();
    for _ in 0..5 {
        tokens.push(broker.submit(Verb::ClrPin, 0x20, 3).unwrap());
    }

    // Stall past the TTL, then bring the worker up.
    std::thread::sleep(Duration::from_millis(100));
    broker.start(bus.clone()).unwrap();

    // Normal operation resumes for fresh commands.
    assert_eq!(
        broker.submit_and_wait(Verb::Identify, 0x20, 0, WAIT).unwrap(),
        CommandValue::Flag(true)
    );

    // None of the stale commands produced a result.
    for token in tokens {
        assert!(matches!(broker.fetch_result(token), FetchOutcome::NotReady));
    }

    let stats = broker.stats();
    assert_eq!(stats.store.commands_expired, 5);
    assert_eq!(stats.dispatcher.commands_executed, 1);
}

#[test]
fn test_concurrent_submitters_never_overlap_on_the_bus() {
    let bus = SimulatedBus::new();
    bus.add_board(0x20);
    bus.add_board(0x21);
    // Stretch each transaction so overlap would be observable.
    bus.set_latency(Duration::from_millis(2));

    let mut broker = Broker::new(BrokerConfig {
        command_ttl: Duration::from_secs(10),
        result_poll_interval: Duration::from_millis(2),
        idle_wait: Duration::from_millis(1),
        ..BrokerConfig::default()
    });
    broker.start(bus.clone()).unwrap();
    let broker = Arc::new(broker);

    let mut handles = Vec::new();
    for worker in 0..4u8 {
        let broker = Arc::clone(&broker);
        handles.push(std::thread::spawn(move || {
            for pin in 0..4u8 {
                let board = 0x20 + (worker % 2);
                broker
                    .submit_and_wait(Verb::SetPin, board, pin, WAIT)
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(!bus.overlap_detected());
    assert_eq!(broker.stats().dispatcher.commands_executed, 16);
}

#[test]
fn test_queue_full_surfaces_at_submission() {
    // Worker down so the queue can actually fill.
    let broker = Broker::new(BrokerConfig::default());

    for _ in 0..32 {
        broker.submit(Verb::GetPin, 0x20, 0).unwrap();
    }
    match broker.submit(Verb::GetPin, 0x20, 0) {
        Err(BrokerError::Store(_)) => {}
        other => panic!("expected queue-full error, got {other:?}"),
    }
}

#[test]
fn test_stats_json_shape() {
    let broker = Broker::new(BrokerConfig::default());
    broker.submit(Verb::GetPin, 0x20, 0).unwrap();

    let body = serde_json::to_value(broker.stats()).unwrap();
    assert_eq!(body["store"]["commands_enqueued"], 1);
    assert_eq!(body["dispatcher"]["commands_executed"], 0);
}
