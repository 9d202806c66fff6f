//! Connection lifecycle against an in-memory transport.

mod common;

use common::{rig, statuses, Fault, FakeTransport, Hold};
use myo_link::error::{ConnectCause, ConnectStage, SessionError, TransportError};
use myo_link::protocol::{
    encode_enable_emg_command, encode_enable_imu_command, encode_haptic_command,
    encode_set_sampling_rate_command, CONTROL_CHARACTERISTIC, DEFAULT_SAMPLING_RATE_HZ,
};
use myo_link::types::{ConnectionState, ConnectionStatus};

use ConnectionStatus::{Connected, Connecting, Disconnected};

fn init_sequence() -> Vec<Vec<u8>> {
    vec![
        encode_enable_emg_command(),
        encode_enable_imu_command(),
        encode_set_sampling_rate_command(DEFAULT_SAMPLING_RATE_HZ),
    ]
}

// ── connect ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn connect_without_bluetooth_fails_silently() {
    let r = rig(FakeTransport::unsupported());
    let err = r.session.connect().await.unwrap_err();
    assert_eq!(err, SessionError::BluetoothUnsupported);
    assert!(statuses(&r.status).is_empty());
    assert_eq!(r.session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn connect_runs_init_sequence_in_order() {
    let r = rig(FakeTransport::new());
    let device = r.session.connect().await.unwrap();

    assert_eq!(device.name, "Myo-Test");
    assert_eq!(r.session.current_device_name().as_deref(), Some("Myo-Test"));
    assert_eq!(r.session.state(), ConnectionState::Connected);
    assert!(r.session.is_connected());
    assert_eq!(r.transport.writes(), init_sequence());
    assert_eq!(statuses(&r.status), vec![Connecting, Connected]);
}

#[tokio::test]
async fn unnamed_device_gets_default_name() {
    let r = rig(FakeTransport::new().unnamed());
    let device = r.session.connect().await.unwrap();
    assert_eq!(device.name, "Myo Armband");
}

#[tokio::test]
async fn declined_selection_is_reported_as_no_device() {
    let r = rig(FakeTransport::new().failing(Fault::Request(TransportError::NoDeviceSelected)));
    let err = r.session.connect().await.unwrap_err();
    assert_eq!(err, SessionError::NoDeviceSelected);
    assert_eq!(statuses(&r.status), vec![Connecting, Disconnected]);
    assert_eq!(r.transport.disconnect_calls(), 0);
}

#[tokio::test]
async fn gatt_failure_names_the_stage() {
    let r = rig(FakeTransport::new().failing(Fault::Gatt));
    let err = r.session.connect().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::ConnectionFailed {
            stage: ConnectStage::GattConnect,
            cause: ConnectCause::Transport(TransportError::GattConnectionFailed(_)),
        }
    ));
    assert_eq!(statuses(&r.status), vec![Connecting, Disconnected]);
}

#[tokio::test]
async fn missing_service_tears_the_link_down() {
    let r = rig(FakeTransport::new().failing(Fault::Service));
    let err = r.session.connect().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::ConnectionFailed {
            stage: ConnectStage::ResolveService,
            ..
        }
    ));
    assert_eq!(r.transport.disconnect_calls(), 1);
    assert_eq!(statuses(&r.status), vec![Connecting, Disconnected]);
    assert_eq!(r.session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn missing_control_characteristic_fails_resolution() {
    let r = rig(FakeTransport::new().failing(Fault::Characteristic(CONTROL_CHARACTERISTIC)));
    let err = r.session.connect().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::ConnectionFailed {
            stage: ConnectStage::ResolveCharacteristic,
            cause: ConnectCause::Transport(TransportError::CharacteristicNotFound(u)),
        } if u == CONTROL_CHARACTERISTIC
    ));
}

#[tokio::test]
async fn subscribe_failure_fails_connect() {
    let r = rig(FakeTransport::new().failing(Fault::Subscribe));
    let err = r.session.connect().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::ConnectionFailed {
            stage: ConnectStage::SubscribeNotifications,
            ..
        }
    ));
    assert!(r.transport.writes().is_empty());
}

#[tokio::test]
async fn failed_init_write_publishes_one_disconnected() {
    let r = rig(FakeTransport::new().failing(Fault::Write(1)));
    let err = r.session.connect().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::ConnectionFailed {
            stage: ConnectStage::Initialize,
            cause: ConnectCause::Transport(TransportError::WriteFailed { .. }),
        }
    ));
    // Only the EMG enable was acknowledged; the rate write never happened.
    assert_eq!(r.transport.writes(), vec![encode_enable_emg_command()]);
    assert_eq!(statuses(&r.status), vec![Connecting, Disconnected]);
    assert_eq!(r.session.state(), ConnectionState::Disconnected);
    assert!(r.session.device().is_none());
}

#[tokio::test]
async fn second_connect_is_rejected_while_active() {
    let r = rig(FakeTransport::new());
    r.session.connect().await.unwrap();
    let err = r.session.connect().await.unwrap_err();
    assert_eq!(
        err,
        SessionError::ConnectionFailed {
            stage: ConnectStage::RequestDevice,
            cause: ConnectCause::AlreadyActive,
        }
    );
    assert_eq!(r.session.state(), ConnectionState::Connected);
    assert_eq!(statuses(&r.status), vec![Connecting, Connected]);
}

#[tokio::test]
async fn reconnect_after_disconnect() {
    let r = rig(FakeTransport::new());
    r.session.connect().await.unwrap();
    r.session.disconnect().await.unwrap();
    r.session.connect().await.unwrap();
    assert_eq!(
        statuses(&r.status),
        vec![Connecting, Connected, Disconnected, Connecting, Connected]
    );
    assert!(r.session.is_connected());
}

// ── cancellation ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn disconnect_during_gatt_connect_cancels_the_attempt() {
    let (transport, gate) = FakeTransport::new().holding(Hold::Gatt);
    let r = rig(transport);

    let session = r.session.clone();
    let attempt = tokio::spawn(async move { session.connect().await });
    gate.entered.notified().await;
    assert_eq!(r.session.state(), ConnectionState::Connecting);

    r.session.disconnect().await.unwrap();
    assert_eq!(r.session.state(), ConnectionState::Disconnected);
    gate.release.notify_one();

    let err = attempt.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        SessionError::ConnectionFailed {
            cause: ConnectCause::Cancelled,
            ..
        }
    ));
    // The late GATT link is closed by the cancelled attempt itself.
    assert_eq!(r.transport.disconnect_calls(), 1);
    assert!(r.transport.writes().is_empty());
    assert_eq!(statuses(&r.status), vec![Connecting, Disconnected]);
}

#[tokio::test]
async fn link_drop_during_init_fails_with_link_lost() {
    let (transport, gate) = FakeTransport::new().holding(Hold::FirstWrite);
    let r = rig(transport);

    let session = r.session.clone();
    let attempt = tokio::spawn(async move { session.connect().await });
    gate.entered.notified().await;
    r.transport.drop_link();
    gate.release.notify_one();

    let err = attempt.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        SessionError::ConnectionFailed {
            stage: ConnectStage::Initialize,
            cause: ConnectCause::LinkLost,
        }
    ));
    assert_eq!(statuses(&r.status), vec![Connecting, Disconnected]);
    assert_eq!(r.session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn connect_during_cancelled_attempt_reports_both() {
    let (transport, gate) = FakeTransport::new().holding(Hold::Gatt);
    let r = rig(transport);

    let first = r.session.clone();
    let first = tokio::spawn(async move { first.connect().await });
    gate.entered.notified().await;
    r.session.disconnect().await.unwrap();

    // The cancelled attempt is still parked in its GATT connect.
    let second = r.session.clone();
    let second = tokio::spawn(async move { second.connect().await });
    gate.entered.notified().await;
    assert_eq!(r.session.state(), ConnectionState::Connecting);

    gate.release.notify_one();
    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        SessionError::ConnectionFailed {
            cause: ConnectCause::Cancelled,
            ..
        }
    ));
    assert_eq!(r.transport.disconnect_calls(), 0);

    gate.release.notify_one();
    second.await.unwrap().unwrap();
    assert_eq!(
        statuses(&r.status),
        vec![Connecting, Disconnected, Connecting, Connected]
    );
    assert!(r.session.is_connected());
}

// ── disconnect ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn late_drop_report_publishes_one_disconnected() {
    let r = rig(FakeTransport::new().deferring_drops());
    r.session.connect().await.unwrap();

    r.session.disconnect().await.unwrap();
    r.session.disconnect().await.unwrap();
    assert_eq!(r.session.state(), ConnectionState::Disconnected);
    assert_eq!(r.transport.disconnect_calls(), 1);
    assert_eq!(statuses(&r.status), vec![Connecting, Connected]);

    assert_eq!(r.transport.deliver_drop_reports(), 1);
    assert_eq!(r.transport.deliver_drop_reports(), 0);
    assert_eq!(statuses(&r.status), vec![Connecting, Connected, Disconnected]);
}

#[tokio::test]
async fn reconnect_before_drop_report_still_reports_disconnected() {
    let r = rig(FakeTransport::new().deferring_drops());
    r.session.connect().await.unwrap();
    r.session.disconnect().await.unwrap();
    r.session.connect().await.unwrap();

    // The first link's report arrives after the second session is up.
    assert_eq!(r.transport.deliver_drop_reports(), 1);

    assert_eq!(
        statuses(&r.status),
        vec![Connecting, Connected, Disconnected, Connecting, Connected]
    );
    assert_eq!(r.session.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let r = rig(FakeTransport::new());
    r.session.connect().await.unwrap();

    r.session.disconnect().await.unwrap();
    r.session.disconnect().await.unwrap();

    assert_eq!(r.transport.disconnect_calls(), 1);
    assert_eq!(statuses(&r.status), vec![Connecting, Connected, Disconnected]);
    assert!(r.session.device().is_none());
}

#[tokio::test]
async fn rejected_teardown_still_reports_disconnected() {
    let r = rig(FakeTransport::new().failing(Fault::Teardown));
    r.session.connect().await.unwrap();

    let err = r.session.disconnect().await.unwrap_err();
    assert!(matches!(err, SessionError::TeardownFailed(TransportError::Backend(_))));
    assert_eq!(r.session.state(), ConnectionState::Disconnected);
    assert_eq!(statuses(&r.status), vec![Connecting, Connected, Disconnected]);
}

#[tokio::test]
async fn disconnect_before_connect_does_nothing() {
    let r = rig(FakeTransport::new());
    r.session.disconnect().await.unwrap();
    assert_eq!(r.transport.disconnect_calls(), 0);
    assert!(statuses(&r.status).is_empty());
}

#[tokio::test]
async fn spontaneous_link_drop_publishes_one_disconnected() {
    let r = rig(FakeTransport::new());
    r.session.connect().await.unwrap();

    r.transport.drop_link();
    r.transport.drop_link();
    r.session.disconnect().await.unwrap();

    assert_eq!(r.session.state(), ConnectionState::Disconnected);
    assert_eq!(r.transport.disconnect_calls(), 0);
    assert_eq!(statuses(&r.status), vec![Connecting, Connected, Disconnected]);
}

// ── commands ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn haptic_without_device_writes_nothing() {
    let r = rig(FakeTransport::new());
    assert!(!r.session.set_haptic_feedback(true).await);
    assert!(r.transport.writes().is_empty());
}

#[tokio::test]
async fn haptic_feedback_is_written_and_recorded() {
    let r = rig(FakeTransport::new());
    r.session.connect().await.unwrap();

    assert!(r.session.set_haptic_feedback(true).await);
    assert!(r.session.settings().haptic_enabled);
    assert_eq!(r.transport.writes().last(), Some(&encode_haptic_command(true)));
}

#[tokio::test]
async fn failed_haptic_write_keeps_the_connection() {
    let r = rig(FakeTransport::new().failing(Fault::Write(3)));
    r.session.connect().await.unwrap();

    assert!(!r.session.set_haptic_feedback(true).await);
    assert!(!r.session.settings().haptic_enabled);
    assert_eq!(r.session.state(), ConnectionState::Connected);
    assert_eq!(statuses(&r.status), vec![Connecting, Connected]);

    assert!(r.session.set_haptic_feedback(true).await);
}

#[tokio::test]
async fn sampling_rate_change_requires_a_device() {
    let r = rig(FakeTransport::new());
    assert_eq!(
        r.session.set_sampling_rate(100).await,
        Err(SessionError::NotConnected)
    );

    r.session.connect().await.unwrap();
    r.session.set_sampling_rate(100).await.unwrap();
    assert_eq!(r.session.settings().sampling_rate_hz, 100);
    assert_eq!(
        r.transport.writes().last(),
        Some(&encode_set_sampling_rate_command(100))
    );
}

#[tokio::test]
async fn failed_rate_write_leaves_settings_alone() {
    let r = rig(FakeTransport::new().failing(Fault::Write(3)));
    r.session.connect().await.unwrap();
    let err = r.session.set_sampling_rate(100).await.unwrap_err();
    assert!(matches!(err, SessionError::CommandWriteFailed(_)));
    assert_eq!(r.session.settings().sampling_rate_hz, DEFAULT_SAMPLING_RATE_HZ);
    assert!(r.session.is_connected());
}
