use std::collections::BTreeMap;
use std::sync::Arc;

use edge_link::mock::{MockConnector, MockDevice};
use edge_link::{
    ChannelErrorCode, ChannelErrors, ConnectionManager, DeviceIdentity, DeviceResponse, Method,
    content_format, status,
};
use edge_monitor::pairing::{
    DeviceDetails, LOCAL_INITIAL_PATH, LOCAL_OPEN_PATH, ME_PATH, PAIRING_PATH,
    PASSWORD_OPEN_PATH,
};
use edge_monitor::{PairingRequest, PairingResult, pair_device};
use test_timeout::tokio_timeout_test;

const DISPLAY_NAME_PATH: &str = "/iam/users/alice/display-name";

fn identity() -> DeviceIdentity {
    DeviceIdentity::new("pr-1", "de-1")
}

fn setup() -> (Arc<MockConnector>, ConnectionManager, Arc<MockDevice>) {
    let connector = MockConnector::new();
    let manager = ConnectionManager::new(connector.clone());
    let device = connector.device(&identity());
    device.set_fingerprint("fp-1");
    (connector, manager, device)
}

fn cbor<T: serde::Serialize>(value: &T) -> DeviceResponse {
    DeviceResponse::new(status::CONTENT)
        .with_payload(content_format::CBOR, serde_cbor::to_vec(value).unwrap())
}

fn serve_details(device: &MockDevice, modes: &[&str], app: &str) {
    let details = DeviceDetails {
        modes: modes.iter().map(|mode| mode.to_string()).collect(),
        app_name: Some(app.into()),
        app_version: Some("1.0".into()),
        product_id: "pr-1".into(),
        device_id: "de-1".into(),
    };
    device.respond(Method::Get, PAIRING_PATH, cbor(&details));
}

fn serve_me(device: &MockDevice) {
    let me = BTreeMap::from([("Username", "alice"), ("Sct", "sct-1")]);
    device.respond(Method::Get, ME_PATH, cbor(&me));
}

/// Not paired on the first `/iam/me`, paired afterwards.
fn serve_me_after_pairing(device: &MockDevice) {
    device.respond_once(Method::Get, ME_PATH, DeviceResponse::new(404));
    serve_me(device);
    device.respond(Method::Put, DISPLAY_NAME_PATH, DeviceResponse::new(204));
}

fn request() -> PairingRequest {
    PairingRequest {
        username: "alice".into(),
        friendly_name: "Front door".into(),
        display_name: Some("Alice A".into()),
        ..PairingRequest::default()
    }
}

fn paths(device: &MockDevice) -> Vec<String> {
    device.requests().into_iter().map(|r| r.path).collect()
}

#[tokio_timeout_test(secs = 10, trace)]
async fn local_initial_pairing_names_the_user() {
    let (_connector, manager, device) = setup();
    serve_details(&device, &["LocalInitial", "PasswordOpen"], "edge-demo");
    serve_me_after_pairing(&device);
    device.respond(
        Method::Post,
        LOCAL_INITIAL_PATH,
        DeviceResponse::new(status::CREATED),
    );

    let result = pair_device(&manager, identity(), &request()).await;

    let PairingResult::Paired {
        already_paired,
        device: paired,
    } = result.clone()
    else {
        panic!("expected pairing to succeed, got {result:?}");
    };
    assert!(!already_paired);
    assert_eq!(paired.username, "alice");
    assert_eq!(paired.sct.as_deref(), Some("sct-1"));
    assert_eq!(paired.fingerprint.as_deref(), Some("fp-1"));
    assert_eq!(paired.friendly_name, "Front door");
    assert_eq!(paired.identity(), identity());

    assert_eq!(
        paths(&device),
        [
            PAIRING_PATH,
            ME_PATH,
            LOCAL_INITIAL_PATH,
            ME_PATH,
            DISPLAY_NAME_PATH
        ]
    );
    let rename = device.requests().pop().unwrap();
    assert_eq!(rename.method, Method::Put);
    let name: String = serde_cbor::from_slice(&rename.payload).unwrap();
    assert_eq!(name, "Alice A");
    assert!(!manager.is_tracked(&identity()));
}

#[tokio_timeout_test(secs = 10)]
async fn already_paired_user_skips_pairing() {
    let (_connector, manager, device) = setup();
    serve_details(&device, &["LocalInitial"], "edge-demo");
    serve_me(&device);

    let result = pair_device(&manager, identity(), &request()).await;

    assert!(matches!(
        result,
        PairingResult::Paired {
            already_paired: true,
            ..
        }
    ));
    assert_eq!(paths(&device), [PAIRING_PATH, ME_PATH]);
}

#[tokio_timeout_test(secs = 10)]
async fn password_open_authenticates_before_pairing() {
    let (_connector, manager, device) = setup();
    serve_details(&device, &["PasswordOpen"], "edge-demo");
    serve_me_after_pairing(&device);
    device.set_password("open-sesame");
    device.respond(
        Method::Post,
        PASSWORD_OPEN_PATH,
        DeviceResponse::new(status::CREATED),
    );
    let request = PairingRequest {
        password: Some("open-sesame".into()),
        ..request()
    };

    let result = pair_device(&manager, identity(), &request).await;

    assert!(result.is_success(), "{result:?}");
    assert_eq!(device.authenticated(), [""]);
    let pairing = device
        .requests()
        .into_iter()
        .find(|r| r.path == PASSWORD_OPEN_PATH)
        .unwrap();
    let body: BTreeMap<String, String> = serde_cbor::from_slice(&pairing.payload).unwrap();
    assert_eq!(body["Username"], "alice");
}

#[tokio_timeout_test(secs = 10)]
async fn password_modes_need_the_right_password() {
    let (_connector, manager, device) = setup();
    serve_details(&device, &["PasswordOpen"], "edge-demo");
    device.respond_once(Method::Get, ME_PATH, DeviceResponse::new(404));
    device.respond_once(Method::Get, ME_PATH, DeviceResponse::new(404));
    device.set_password("open-sesame");

    assert_eq!(
        pair_device(&manager, identity(), &request()).await,
        PairingResult::NoPassword
    );

    let wrong = PairingRequest {
        password: Some("guess".into()),
        ..request()
    };
    assert_eq!(
        pair_device(&manager, identity(), &wrong).await,
        PairingResult::WrongPassword
    );
    assert!(device.authenticated().is_empty());
    assert!(!paths(&device).iter().any(|path| path == PASSWORD_OPEN_PATH));
}

#[tokio_timeout_test(secs = 10)]
async fn taken_username_is_reported() {
    let (_connector, manager, device) = setup();
    serve_details(&device, &["LocalOpen"], "edge-demo");
    device.respond(Method::Get, ME_PATH, DeviceResponse::new(404));
    device.respond(Method::Post, LOCAL_OPEN_PATH, DeviceResponse::new(409));

    assert_eq!(
        pair_device(&manager, identity(), &request()).await,
        PairingResult::UsernameExists
    );
}

#[tokio_timeout_test(secs = 10)]
async fn unsupported_modes_and_foreign_apps_are_refused() {
    let (_connector, manager, device) = setup();
    serve_details(&device, &["PasswordInvite"], "edge-demo");
    device.respond(Method::Get, ME_PATH, DeviceResponse::new(404));

    assert_eq!(
        pair_device(&manager, identity(), &request()).await,
        PairingResult::InvalidPairingMode
    );

    let picky = PairingRequest {
        expected_app_name: Some("doorbell".into()),
        ..request()
    };
    assert_eq!(
        pair_device(&manager, identity(), &picky).await,
        PairingResult::IncorrectApp {
            expected: "doorbell".into(),
            found: Some("edge-demo".into()),
        }
    );
}

#[tokio_timeout_test(secs = 10)]
async fn dial_failures_surface_channel_errors() {
    let (connector, manager, _device) = setup();
    let errors = ChannelErrors {
        local: ChannelErrorCode::new(-2, "NOT_FOUND"),
        remote: ChannelErrorCode::new(-11, "DEVICE_OFFLINE"),
        ..ChannelErrors::default()
    };
    connector.fail_device(&identity(), errors.clone());

    assert_eq!(
        pair_device(&manager, identity(), &request()).await,
        PairingResult::ConnectFailed(errors)
    );

    connector.fail_device(&identity(), ChannelErrors::default());
    assert_eq!(
        pair_device(&manager, identity(), &request()).await,
        PairingResult::NoChannels
    );
    assert!(!manager.is_tracked(&identity()));
}

#[tokio_timeout_test(secs = 10)]
async fn invalid_username_never_dials() {
    let (connector, manager, _device) = setup();
    let request = PairingRequest {
        username: "Alice".into(),
        ..request()
    };

    assert_eq!(
        pair_device(&manager, identity(), &request).await,
        PairingResult::InvalidUsername
    );
    assert_eq!(connector.dial_count(), 0);
}

#[tokio_timeout_test(secs = 10)]
async fn pairing_leaves_other_handles_connected() {
    let (connector, manager, device) = setup();
    serve_details(&device, &["LocalInitial"], "edge-demo");
    serve_me(&device);
    let viewer = manager.request_connection(identity());
    manager.wait_connected(&viewer).await.unwrap();

    let result = pair_device(&manager, identity(), &request()).await;

    assert!(result.is_success());
    assert_eq!(manager.refcount(&identity()), 1);
    assert!(manager.get_connection(&viewer).is_ok());
    assert_eq!(connector.dial_count(), 1);
}
