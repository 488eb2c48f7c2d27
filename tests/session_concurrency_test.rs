//! Integration tests for transport exclusion between foreground queries and
//! the feedback poller.

use instrument_session::codec::{AddressFramedCodec, Value};
use instrument_session::config::{DeviceProfile, SessionConfig};
use instrument_session::sim::{
    DuplexConnector, SimulatedPump, TransportEvent, TransportEventKind, TransportLog,
};
use instrument_session::InstrumentSession;
use std::sync::Arc;
use std::time::Duration;

/// Pump session polling `codes` every 200 ms, recording all transport traffic.
fn recorded_pump_session(
    pump: &SimulatedPump,
    codes: &[&str],
) -> (Arc<InstrumentSession>, TransportLog) {
    let log = TransportLog::default();
    let connector = DuplexConnector::new(pump.clone()).with_recorder(log.clone());

    let mut config: SessionConfig = DeviceProfile::Pump.defaults();
    config.address = "sim://pump".to_string();
    config.feedback.codes = codes.iter().map(|c| c.to_string()).collect();
    config.feedback.interval = Duration::from_millis(200);
    config.query.settle_delay = Duration::from_millis(10);

    let session = InstrumentSession::new(
        Box::new(AddressFramedCodec::new(1).unwrap()),
        Arc::new(connector),
        config,
    );
    (Arc::new(session), log)
}

/// Every write must be followed by its reply before the next write starts.
fn assert_strictly_paired(events: &[TransportEvent]) {
    for (i, pair) in events.chunks(2).enumerate() {
        assert_eq!(
            pair[0].kind,
            TransportEventKind::Write,
            "event {} should be a write: {:?}",
            i * 2,
            events
        );
        if let Some(read) = pair.get(1) {
            assert_eq!(
                read.kind,
                TransportEventKind::Read,
                "write {:?} was interleaved: {:?}",
                pair[0].data,
                events
            );
            assert!(read.at >= pair[0].at);
        }
    }
}

#[tokio::test]
async fn test_foreground_and_poller_never_interleave() {
    let pump = SimulatedPump::new(1);
    pump.set_response_delay(Duration::from_millis(15));
    let (session, log) = recorded_pump_session(&pump, &["DS", "DN"]);

    session.connect_configured().await.unwrap();

    for steps in [10, 20, 30, 40, 50] {
        tokio::time::sleep(Duration::from_millis(70)).await;
        let reply = session
            .query(
                "RI",
                vec![Value::from(steps)],
                Duration::from_secs(1),
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        assert_eq!(reply.value(), Some("ok"));
    }

    tokio::time::sleep(Duration::from_millis(250)).await;
    session.disconnect().await;

    let events = log.lock().clone();
    let polls = events
        .iter()
        .filter(|e| e.kind == TransportEventKind::Write && e.data.starts_with("1D"))
        .count();
    assert!(polls >= 2, "poller should have run: {:?}", events);
    assert_strictly_paired(&events);
    assert_eq!(pump.position(), 150);
}

#[tokio::test]
async fn test_concurrent_foreground_callers_are_serialized() {
    let pump = SimulatedPump::new(1);
    pump.set_response_delay(Duration::from_millis(5));
    let (session, log) = recorded_pump_session(&pump, &["DS"]);
    session.connect_configured().await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            session
                .query("RI", vec![Value::from(1)], Duration::from_secs(1), Duration::ZERO)
                .await
        }));
    }
    for task in tasks {
        let reply = task.await.unwrap().unwrap();
        assert_eq!(reply.value(), Some("ok"));
    }

    assert!(!session.is_busy());
    assert!(!session.is_feedback_paused());
    session.disconnect().await;

    assert_strictly_paired(&log.lock());
    assert_eq!(pump.position(), 4);
}

#[tokio::test]
async fn test_actuation_mid_poll_scenario() {
    let pump = SimulatedPump::new(1);
    pump.set_response_delay(Duration::from_millis(20));
    let (session, log) = recorded_pump_session(&pump, &["DS"]);
    session.connect_configured().await.unwrap();

    // Let the poller get going, then issue the actuation mid-cycle.
    tokio::time::sleep(Duration::from_millis(310)).await;
    let reply = session
        .query(
            "RP",
            vec![Value::from(30)],
            Duration::from_secs(1),
            Duration::from_millis(100),
        )
        .await
        .unwrap();
    assert_eq!(reply.value(), Some("ok"));

    tokio::time::sleep(Duration::from_millis(450)).await;
    session.disconnect().await;

    let events = log.lock().clone();
    assert_strictly_paired(&events);

    let rp = events
        .iter()
        .position(|e| e.kind == TransportEventKind::Write && e.data == "1RP30º\r")
        .expect("RP frame written");
    assert_eq!(events[rp + 1].kind, TransportEventKind::Read);
    assert_eq!(events[rp + 1].data, "1okº");

    let polls_before = events[..rp]
        .iter()
        .filter(|e| e.kind == TransportEventKind::Write && e.data == "1DSº\r")
        .count();
    let next_poll = events[rp + 2..]
        .iter()
        .find(|e| e.kind == TransportEventKind::Write && e.data == "1DSº\r")
        .expect("poller resumed after the actuation");

    assert!(polls_before >= 1);
    assert!(next_poll.at >= events[rp + 1].at);
}
