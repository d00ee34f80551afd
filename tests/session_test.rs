mod common;

use blitz_client::config;
use blitz_client::server::{ServerEvent, LOCATOR_IDENTITY};
use blitz_client::transport::Reply;
use blitz_client::{ClientError, ClientState, Properties, RemoteError, TransportError};
use common::*;

#[tokio::test]
async fn test_login_and_close() {
    let server = server();
    let (mut client, connector) = client(&server);

    let sf = client.create_session(Some(USER), Some(PASS)).await.unwrap();
    assert_eq!(client.state(), ClientState::SessionActive);
    assert!(client.session().is_some());
    assert_eq!(server.open_sessions(), 1);
    assert_eq!(connector.connects(), 1);

    // The session is usable.
    sf.get_update_service().await.unwrap();

    client.close_session().await.unwrap();
    assert_eq!(client.state(), ClientState::Closed);
    assert!(client.session().is_none());
    assert_eq!(server.open_sessions(), 0);

    let events = server.events();
    assert!(matches!(events[0], ServerEvent::SessionCreated { ref username, .. } if username == USER));
    assert!(matches!(events[1], ServerEvent::SessionClosed { .. }));
    assert_eq!(events[2], ServerEvent::SessionDestroyed);
    assert_eq!(
        connector.op_names(),
        vec!["is_a", "create_session", "is_a", "get_update_service", "close", "destroy_session"]
    );
}

#[tokio::test]
async fn test_credentials_from_properties() {
    let server = server();
    let connector = ScriptedConnector::new(server.clone());
    let mut props = router_properties("blitz/router");
    props.set_property(config::USERNAME, USER);
    props.set_property(config::PASSWORD, PASS);
    let mut client = client_for(&connector, props);

    client.create_session(None, None).await.unwrap();
    assert_eq!(client.state(), ClientState::SessionActive);
}

#[tokio::test]
async fn test_missing_username_fails_before_network() {
    let server = server();
    let (mut client, connector) = client(&server);

    let err = client.create_session(Some(""), Some(PASS)).await.unwrap_err();
    assert!(matches!(err, ClientError::Configuration(ref m) if m == "No username specified"));
    assert_eq!(err.to_string(), "No username specified");
    assert_eq!(connector.connects(), 0);
    assert!(connector.calls().is_empty());
    assert_eq!(client.state(), ClientState::Connected);
}

#[tokio::test]
async fn test_missing_password_fails_before_network() {
    let server = server();
    let (mut client, connector) = client(&server);

    let err = client.create_session(Some(USER), None).await.unwrap_err();
    assert!(matches!(err, ClientError::Configuration(ref m) if m == "No password specified"));
    assert!(connector.calls().is_empty());
}

#[tokio::test]
async fn test_no_default_router() {
    let server = server();
    let connector = ScriptedConnector::new(server.clone());
    let mut client = client_for(&connector, Properties::new());

    let err = client.create_session(Some(USER), Some(PASS)).await.unwrap_err();
    assert!(matches!(err, ClientError::Routing(ref m) if m == "No default router found"));
    assert_eq!(connector.connects(), 0);
}

#[tokio::test]
async fn test_router_of_wrong_type() {
    let server = server();
    let connector = ScriptedConnector::new(server.clone());
    let mut client = client_for(&connector, router_properties(LOCATOR_IDENTITY));

    let err = client.create_session(Some(USER), Some(PASS)).await.unwrap_err();
    assert!(matches!(err, ClientError::Routing(ref m) if m == "Error obtaining router"));
    assert_eq!(connector.op_names(), vec!["is_a"]);
    assert_eq!(client.state(), ClientState::Connected);
}

#[tokio::test]
async fn test_bad_password_is_session_error() {
    let server = server();
    let (mut client, _connector) = client(&server);

    let err = client.create_session(Some(USER), Some("wrong")).await.unwrap_err();
    match err {
        ClientError::Session { message, source } => {
            assert!(message.starts_with("Session creation failed"));
            assert!(matches!(source, Some(RemoteError::PermissionDenied(_))));
        }
        other => panic!("expected session error, got {:?}", other),
    }
    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(server.open_sessions(), 0);

    // A failed attempt does not prevent a correct one.
    client.create_session(Some(USER), Some(PASS)).await.unwrap();
}

#[tokio::test]
async fn test_session_of_wrong_type() {
    let server = server();
    let (mut client, connector) = client(&server);
    // Router check passes, the session check is refused.
    connector.fail_on("is_a", 1, || Ok(Reply::Bool(false)));

    let err = client.create_session(Some(USER), Some(PASS)).await.unwrap_err();
    assert!(matches!(err, ClientError::Session { ref message, source: None } if message == "No session obtained"));
    assert_eq!(client.state(), ClientState::Connected);
}

#[tokio::test]
async fn test_second_session_rejected() {
    let server = server();
    let (mut client, _connector) = logged_in(&server).await;

    let err = client.create_session(Some(USER), Some(PASS)).await.unwrap_err();
    assert!(matches!(err, ClientError::Session { ref message, .. } if message == "Session already active"));
    assert_eq!(server.open_sessions(), 1);
}

#[tokio::test]
async fn test_closed_client_cannot_log_in_again() {
    let server = server();
    let (mut client, _connector) = logged_in(&server).await;
    client.close_session().await.unwrap();

    let err = client.create_session(Some(USER), Some(PASS)).await.unwrap_err();
    assert!(matches!(err, ClientError::Session { ref message, .. } if message == "Client is closed"));
}

#[tokio::test]
async fn test_close_twice_is_noop() {
    let server = server();
    let (mut client, connector) = logged_in(&server).await;

    client.close_session().await.unwrap();
    let calls = connector.calls().len();
    client.close_session().await.unwrap();
    assert_eq!(connector.calls().len(), calls);
    assert_eq!(client.state(), ClientState::Closed);
}

#[tokio::test]
async fn test_close_ignores_session_close_failure() {
    let server = server();
    let (mut client, connector) = logged_in(&server).await;
    connector.fail_on("close", 0, || Err(TransportError::ConnectionLost("reset by peer".into())));

    client.close_session().await.unwrap();
    assert_eq!(client.state(), ClientState::Closed);
    // destroy_session still ran.
    assert_eq!(connector.op_names().last(), Some(&"destroy_session"));
    assert_eq!(server.events().last(), Some(&ServerEvent::SessionDestroyed));
}

#[tokio::test]
async fn test_close_accepts_plain_destroy_reply() {
    let server = server();
    let (mut client, connector) = logged_in(&server).await;
    connector.fail_on("destroy_session", 0, || Ok(Reply::Unit));

    client.close_session().await.unwrap();
    assert_eq!(client.state(), ClientState::Closed);
}

#[tokio::test]
async fn test_close_propagates_unexpected_destroy_error() {
    let server = server();
    let (mut client, connector) = logged_in(&server).await;
    connector.fail_on("destroy_session", 0, || {
        Ok(Reply::Fault(RemoteError::Server("router exploded".into())))
    });

    let err = client.close_session().await.unwrap_err();
    assert!(matches!(err, ClientError::Remote(RemoteError::Server(_))));
    assert_eq!(client.state(), ClientState::Closed);
    assert!(client.session().is_none());
}

#[tokio::test]
async fn test_drop_shuts_connection_down() {
    let server = server();
    let (client, connector) = logged_in(&server).await;
    let communicator = client.communicator().clone();

    drop(client);
    assert!(communicator.is_destroyed());
    assert_eq!(connector.shutdowns(), 1);
}

#[tokio::test]
async fn test_factories_installed_on_construction() {
    let server = server();
    let (client, _connector) = client(&server);

    for type_id in [blitz_client::OriginalFile::TYPE_ID, blitz_client::Format::TYPE_ID] {
        assert!(client.communicator().find_object_factory(type_id).is_some());
    }
    assert!(client
        .communicator()
        .find_object_factory("::blitz::model::Image")
        .is_none());
}

#[tokio::test]
async fn test_logout_leaves_other_clients_alone() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("b.txt");
    std::fs::write(&path, b"client b keeps working").unwrap();

    let server = server();
    let (mut a, _) = logged_in(&server).await;
    let (mut b, _) = logged_in(&server).await;
    assert_eq!(server.open_sessions(), 2);

    a.close_session().await.unwrap();
    assert_eq!(server.open_sessions(), 1);
    assert_eq!(b.state(), ClientState::SessionActive);

    let record = b
        .upload(&path, blitz_client::UploadOptions::format("text/plain"))
        .await
        .unwrap();
    assert_eq!(record.size, Some(22));

    b.close_session().await.unwrap();
    assert_eq!(server.open_sessions(), 0);
    assert_eq!(server.servant_count(), 0);
}
