//! Integration tests for the full connection handshake lifecycle

use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use rustcm::protocol::{Gid, Lid, PathRecord, ReplyParams, RequestParams, Role, ServiceId, State};
use rustcm::{CmConfig, CmDevice, CmError, CmEvent, CmEventKind};

const TEST_SID: ServiceId = ServiceId(0x0000_000f_f000_0000);

fn test_config() -> CmConfig {
    let mut config = CmConfig::default();
    config.timers.timewait_period = Duration::from_millis(50);
    config
}

fn sample_path() -> PathRecord {
    PathRecord::new(
        Gid::new(0xfe80_0000_0000_0000, 0x0005_ad00_0000_296c),
        Gid::new(0xfe80_0000_0000_0000, 0x0002_c902_0000_2179),
        Lid(0x3e1),
        Lid(0x1f9),
    )
}

fn sample_request() -> RequestParams {
    RequestParams {
        qp_number: 0xff00,
        starting_psn: 0x7000,
        ..RequestParams::default()
    }
}

async fn next_event(device: &CmDevice) -> CmEvent {
    timeout(Duration::from_secs(1), device.poll_event())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed")
}

#[tokio::test]
async fn test_full_handshake_lifecycle() {
    let device = CmDevice::new(test_config());

    let listener = device.create_id().unwrap();
    device.listen(listener, TEST_SID, 0).unwrap();

    let active = device.create_id().unwrap();
    device
        .connect(active, &sample_path(), TEST_SID, sample_request())
        .unwrap();
    assert_eq!(device.state(active).unwrap(), State::ReqSent);

    // The request mints a fresh passive-side identifier; the listener
    // keeps listening.
    let event = next_event(&device).await;
    let passive = event.id;
    assert_ne!(passive, listener);
    assert_ne!(passive, active);
    assert_eq!(event.state, State::ReqRcvd);
    match &event.kind {
        CmEventKind::ReqReceived {
            listener: l,
            service_id,
            remote_qpn,
            starting_psn,
            ..
        } => {
            assert_eq!(*l, listener);
            assert_eq!(*service_id, TEST_SID);
            assert_eq!(*remote_qpn, 0xff00);
            assert_eq!(*starting_psn, 0x7000);
        }
        other => panic!("expected ReqReceived, got {other:?}"),
    }
    device.release_event(event);
    assert_eq!(device.state(listener).unwrap(), State::Listening);

    // Accept echoes negotiated parameters back to the initiator.
    let reply = ReplyParams {
        qp_number: 0x0abc,
        starting_psn: 0x1234,
        ..ReplyParams::default()
    };
    device.accept(passive, reply).unwrap();
    assert_eq!(device.state(passive).unwrap(), State::RepSent);

    let event = next_event(&device).await;
    assert_eq!(event.id, active);
    assert_eq!(event.state, State::RepRcvd);
    match &event.kind {
        CmEventKind::RepReceived {
            remote_qpn,
            starting_psn,
            ..
        } => {
            assert_eq!(*remote_qpn, 0x0abc);
            assert_eq!(*starting_psn, 0x1234);
        }
        other => panic!("expected RepReceived, got {other:?}"),
    }
    device.release_event(event);

    // The ready-to-use notification establishes both sides; only the
    // passive side hears about it through an event.
    device.acknowledge(active).unwrap();
    assert_eq!(device.state(active).unwrap(), State::Established);

    let event = next_event(&device).await;
    assert_eq!(event.id, passive);
    assert_eq!(event.kind, CmEventKind::Established);
    assert_eq!(device.state(passive).unwrap(), State::Established);
    device.release_event(event);

    // Teardown initiated by the passive side.
    device.disconnect(passive, Bytes::new()).unwrap();
    assert_eq!(device.state(passive).unwrap(), State::DreqSent);

    let event = next_event(&device).await;
    assert_eq!(event.id, active);
    assert!(matches!(event.kind, CmEventKind::DreqReceived { .. }));
    device.release_event(event);

    device.disconnect_ack(active).unwrap();
    assert_eq!(device.state(active).unwrap(), State::TimeWait);

    let event = next_event(&device).await;
    assert_eq!(event.id, active);
    assert_eq!(event.kind, CmEventKind::TimeWait);
    device.release_event(event);

    let event = next_event(&device).await;
    assert_eq!(event.id, passive);
    assert_eq!(event.kind, CmEventKind::DrepReceived);
    assert_eq!(event.state, State::TimeWait);
    device.release_event(event);

    // Both identifiers recycle to Idle once the TimeWait period elapses.
    let mut idle_ids = Vec::new();
    for _ in 0..2 {
        let event = next_event(&device).await;
        assert_eq!(event.kind, CmEventKind::Idle);
        assert_eq!(event.state, State::Idle);
        idle_ids.push(event.id);
        device.release_event(event);
    }
    idle_ids.sort();
    let mut expected = vec![active, passive];
    expected.sort();
    assert_eq!(idle_ids, expected);

    assert_eq!(device.state(active).unwrap(), State::Idle);
    assert_eq!(device.state(passive).unwrap(), State::Idle);
    assert_eq!(device.outstanding_events(), 0);
}

#[tokio::test]
async fn test_recycled_id_reusable_after_timewait() {
    let device = CmDevice::new(test_config());

    let listener = device.create_id().unwrap();
    device.listen(listener, TEST_SID, 0).unwrap();

    let active = device.create_id().unwrap();
    device
        .connect(active, &sample_path(), TEST_SID, sample_request())
        .unwrap();

    let event = next_event(&device).await;
    let passive = event.id;
    device.release_event(event);

    device.accept(passive, ReplyParams::default()).unwrap();
    let event = next_event(&device).await;
    device.release_event(event);
    device.acknowledge(active).unwrap();
    let event = next_event(&device).await;
    device.release_event(event);

    device.disconnect(active, Bytes::new()).unwrap();
    let event = next_event(&device).await;
    device.release_event(event);
    device.disconnect_ack(passive).unwrap();

    // Drain TimeWait, DrepReceived, and both Idle events.
    for _ in 0..4 {
        let event = next_event(&device).await;
        device.release_event(event);
    }
    assert_eq!(device.state(active).unwrap(), State::Idle);

    // The same identifier can dial out again.
    device
        .connect(active, &sample_path(), TEST_SID, sample_request())
        .unwrap();
    assert_eq!(device.state(active).unwrap(), State::ReqSent);

    let event = next_event(&device).await;
    assert!(matches!(event.kind, CmEventKind::ReqReceived { .. }));
    device.release_event(event);
}

#[tokio::test]
async fn test_reject_returns_both_sides_to_idle() {
    let device = CmDevice::new(test_config());

    let listener = device.create_id().unwrap();
    device.listen(listener, TEST_SID, 0).unwrap();

    let active = device.create_id().unwrap();
    device
        .connect(active, &sample_path(), TEST_SID, sample_request())
        .unwrap();

    let event = next_event(&device).await;
    let passive = event.id;
    device.release_event(event);

    device
        .reject(passive, Bytes::from_static(b"no capacity"))
        .unwrap();
    assert_eq!(device.state(passive).unwrap(), State::Idle);

    let event = next_event(&device).await;
    assert_eq!(event.id, active);
    assert_eq!(event.state, State::Idle);
    match &event.kind {
        CmEventKind::RejectReceived { private_data } => {
            assert_eq!(private_data.as_ref(), b"no capacity");
        }
        other => panic!("expected RejectReceived, got {other:?}"),
    }
    device.release_event(event);
    assert_eq!(device.state(active).unwrap(), State::Idle);
}

#[tokio::test]
async fn test_unknown_service_request_times_out() {
    let device = CmDevice::new(test_config());

    let active = device.create_id().unwrap();
    let mut params = sample_request();
    params.response_timeouts.remote = Duration::from_millis(20);
    params.max_cm_retries = 1;
    device
        .connect(active, &sample_path(), ServiceId(0xdead_beef), params)
        .unwrap();
    assert_eq!(device.state(active).unwrap(), State::ReqSent);

    let event = next_event(&device).await;
    assert_eq!(event.id, active);
    assert_eq!(event.kind, CmEventKind::ReqTimeout);
    assert_eq!(event.state, State::Idle);
    device.release_event(event);
    assert_eq!(device.state(active).unwrap(), State::Idle);
}

#[tokio::test]
async fn test_second_request_while_first_established() {
    let device = CmDevice::new(test_config());

    let listener = device.create_id().unwrap();
    device.listen(listener, TEST_SID, 0).unwrap();

    let first = device.create_id().unwrap();
    device
        .connect(first, &sample_path(), TEST_SID, sample_request())
        .unwrap();

    let event = next_event(&device).await;
    let passive = event.id;
    device.release_event(event);
    device.accept(passive, ReplyParams::default()).unwrap();
    let event = next_event(&device).await;
    device.release_event(event);
    device.acknowledge(first).unwrap();
    let event = next_event(&device).await;
    device.release_event(event);
    assert_eq!(device.state(first).unwrap(), State::Established);

    // A second initiator gets its own passive-side identifier; the
    // established connection is untouched.
    let second = device.create_id().unwrap();
    device
        .connect(second, &sample_path(), TEST_SID, sample_request())
        .unwrap();

    let event = next_event(&device).await;
    assert_ne!(event.id, passive);
    assert!(matches!(event.kind, CmEventKind::ReqReceived { .. }));
    device.release_event(event);

    assert_eq!(device.state(listener).unwrap(), State::Listening);
    assert_eq!(device.state(first).unwrap(), State::Established);
    assert_eq!(device.state(passive).unwrap(), State::Established);
}

#[tokio::test]
async fn test_passive_id_links_back_to_initiator() {
    let device = CmDevice::new(test_config());

    let listener = device.create_id().unwrap();
    device.listen(listener, TEST_SID, 0).unwrap();

    let active = device.create_id().unwrap();
    device
        .connect(active, &sample_path(), TEST_SID, sample_request())
        .unwrap();

    let event = next_event(&device).await;
    let info = device.query(event.id).unwrap();
    assert_eq!(info.state, State::ReqRcvd);
    assert_eq!(info.role, Some(Role::Passive));
    assert_eq!(info.service_id, Some(TEST_SID));
    assert_eq!(info.peer, Some(active));
    assert_eq!(info.remote_qpn, Some(0xff00));
    assert_eq!(info.starting_psn, Some(0x7000));
    device.release_event(event);
}

#[tokio::test]
async fn test_operations_rejected_in_wrong_state() {
    let device = CmDevice::new(test_config());
    let id = device.create_id().unwrap();

    // Nothing but listen/connect is valid from Idle.
    assert!(matches!(
        device.accept(id, ReplyParams::default()),
        Err(CmError::InvalidState { .. })
    ));
    assert!(matches!(
        device.acknowledge(id),
        Err(CmError::InvalidState { .. })
    ));
    assert!(matches!(
        device.disconnect(id, Bytes::new()),
        Err(CmError::InvalidState { .. })
    ));
    assert!(matches!(
        device.disconnect_ack(id),
        Err(CmError::InvalidState { .. })
    ));

    device
        .connect(id, &sample_path(), TEST_SID, sample_request())
        .unwrap();

    // A second connect on the same identifier is refused and the state
    // is unchanged.
    assert!(matches!(
        device.connect(id, &sample_path(), TEST_SID, sample_request()),
        Err(CmError::InvalidState { .. })
    ));
    assert_eq!(device.state(id).unwrap(), State::ReqSent);

    // So is listening on an identifier mid-handshake.
    assert!(matches!(
        device.listen(id, ServiceId(42), 0),
        Err(CmError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_duplicate_listener_refused() {
    let device = CmDevice::new(test_config());

    let first = device.create_id().unwrap();
    device.listen(first, TEST_SID, 0).unwrap();

    let second = device.create_id().unwrap();
    assert!(matches!(
        device.listen(second, TEST_SID, 0),
        Err(CmError::InvalidAddress(_))
    ));
    // The failed listen leaves the identifier usable.
    assert_eq!(device.state(second).unwrap(), State::Idle);

    // Destroying the listener frees the service id.
    device.destroy(first).unwrap();
    device.listen(second, TEST_SID, 0).unwrap();
    assert_eq!(device.state(second).unwrap(), State::Listening);
}

#[tokio::test]
async fn test_destroyed_id_events_are_suppressed() {
    let device = CmDevice::new(test_config());

    let listener = device.create_id().unwrap();
    device.listen(listener, TEST_SID, 0).unwrap();

    let active = device.create_id().unwrap();
    device
        .connect(active, &sample_path(), TEST_SID, sample_request())
        .unwrap();

    let event = next_event(&device).await;
    let passive = event.id;
    device.release_event(event);

    // Queue a reply for the initiator, then destroy it before polling.
    device.accept(passive, ReplyParams::default()).unwrap();
    device.destroy(active).unwrap();

    // The queued RepReceived is dropped at poll time and its slot
    // reclaimed, leaving the stream empty.
    assert!(device.try_poll_event().unwrap().is_none());
    assert_eq!(device.outstanding_events(), 0);

    assert!(matches!(device.state(active), Err(CmError::NotFound(_))));
    assert!(matches!(device.destroy(active), Err(CmError::NotFound(_))));
}

#[tokio::test]
async fn test_stray_message_surfaces_unhandled_without_breaking_poll() {
    let device = CmDevice::new(test_config());

    let listener = device.create_id().unwrap();
    device.listen(listener, TEST_SID, 0).unwrap();

    // A tiny retry budget recycles the initiator to Idle before the
    // passive side gets around to answering.
    let active = device.create_id().unwrap();
    let mut params = sample_request();
    params.response_timeouts.remote = Duration::from_millis(20);
    params.max_cm_retries = 1;
    device
        .connect(active, &sample_path(), TEST_SID, params)
        .unwrap();

    let event = next_event(&device).await;
    let passive = event.id;
    assert!(matches!(event.kind, CmEventKind::ReqReceived { .. }));
    device.release_event(event);

    let event = next_event(&device).await;
    assert_eq!(event.id, active);
    assert_eq!(event.kind, CmEventKind::ReqTimeout);
    device.release_event(event);
    assert_eq!(device.state(active).unwrap(), State::Idle);

    // The late reply lands on an Idle identifier: no transition, just a
    // non-fatal Unhandled notification.
    device.accept(passive, ReplyParams::default()).unwrap();

    let event = next_event(&device).await;
    assert_eq!(event.id, active);
    assert_eq!(event.state, State::Idle);
    match &event.kind {
        CmEventKind::Unhandled { description } => {
            assert!(description.contains("Rep"), "description: {description}");
            assert!(description.contains("Idle"), "description: {description}");
        }
        other => panic!("expected Unhandled, got {other:?}"),
    }
    device.release_event(event);

    assert_eq!(device.state(active).unwrap(), State::Idle);
    assert_eq!(device.state(passive).unwrap(), State::RepSent);

    // The poll loop keeps delivering after the stray message.
    let retry = device.create_id().unwrap();
    device
        .connect(retry, &sample_path(), TEST_SID, sample_request())
        .unwrap();
    let event = next_event(&device).await;
    assert!(matches!(event.kind, CmEventKind::ReqReceived { .. }));
    device.release_event(event);
    assert_eq!(device.outstanding_events(), 0);
}

#[tokio::test]
async fn test_invalid_path_rejected() {
    let device = CmDevice::new(test_config());
    let id = device.create_id().unwrap();

    let mut path = sample_path();
    path.dlid = Lid(0);
    assert!(matches!(
        device.connect(id, &path, TEST_SID, sample_request()),
        Err(CmError::InvalidAddress(_))
    ));
    assert_eq!(device.state(id).unwrap(), State::Idle);
}

#[tokio::test]
async fn test_backlog_overflow_drops_request() {
    let mut config = test_config();
    config.cm.default_backlog = 1;
    let device = CmDevice::new(config);

    let listener = device.create_id().unwrap();
    device.listen(listener, TEST_SID, 0).unwrap();

    let first = device.create_id().unwrap();
    device
        .connect(first, &sample_path(), TEST_SID, sample_request())
        .unwrap();

    let event = next_event(&device).await;
    let passive = event.id;
    device.release_event(event);

    // The pending request fills the backlog; the second request is
    // dropped at the transport boundary with no event.
    let mut params = sample_request();
    params.response_timeouts.remote = Duration::from_millis(20);
    params.max_cm_retries = 1;
    let second = device.create_id().unwrap();
    device
        .connect(second, &sample_path(), TEST_SID, params)
        .unwrap();

    let event = next_event(&device).await;
    assert_eq!(event.id, second);
    assert_eq!(event.kind, CmEventKind::ReqTimeout);
    device.release_event(event);

    // Accepting the pending request frees the backlog slot.
    device.accept(passive, ReplyParams::default()).unwrap();
    let event = next_event(&device).await;
    assert!(matches!(event.kind, CmEventKind::RepReceived { .. }));
    device.release_event(event);

    let third = device.create_id().unwrap();
    device
        .connect(third, &sample_path(), TEST_SID, sample_request())
        .unwrap();
    let event = next_event(&device).await;
    assert!(matches!(event.kind, CmEventKind::ReqReceived { .. }));
    device.release_event(event);
}
