mod common;

use std::fs;

use blitz_client::checksum;
use blitz_client::server::ServerEvent;
use blitz_client::transport::Reply;
use blitz_client::{ClientError, Format, RemoteError, TransportError, UploadOptions};
use common::*;
use tempfile::TempDir;

fn fixture(dir: &TempDir, name: &str, len: usize) -> (std::path::PathBuf, Vec<u8>) {
    let content: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
    let path = dir.path().join(name);
    fs::write(&path, &content).unwrap();
    (path, content)
}

#[tokio::test]
async fn test_upload_streams_in_blocks() {
    let tmp = TempDir::new().unwrap();
    let (path, content) = fixture(&tmp, "image.raw", 10 * 1024);
    let server = server();
    let (client, connector) = logged_in(&server).await;
    let before = connector.calls().len();

    let record = client
        .upload(&path, UploadOptions::format("application/octet-stream"))
        .await
        .unwrap();

    let id = record.id.unwrap();
    assert_eq!(record.size, Some(10240));
    assert_eq!(record.checksum.as_deref(), Some(checksum::digest(&content).as_str()));
    assert_eq!(record.name.as_deref(), Some("image.raw"));
    assert_eq!(record.format, Some(Format::new("application/octet-stream")));

    let expected: Vec<(u64, usize)> = (0..10).map(|i| (i * 1024, 1024)).collect();
    assert_eq!(connector.writes(), expected);

    let mut ops = connector.op_names();
    let ops = ops.split_off(before);
    assert_eq!(&ops[..4], &["get_update_service", "save_and_return_object", "create_raw_file_store", "set_file_id"]);
    assert_eq!(ops.last(), Some(&"close"));

    assert_eq!(server.file_content(id).unwrap(), content);
    let stored = server.object(id).unwrap();
    assert_eq!(stored.string_field("name"), Some("image.raw"));
    assert_eq!(stored.string_field("checksum"), record.checksum.as_deref());
    assert!(server
        .events()
        .iter()
        .any(|e| matches!(e, ServerEvent::StoreClosed { id: Some(closed), .. } if *closed == id)));
}

#[tokio::test]
async fn test_upload_partial_last_block() {
    let tmp = TempDir::new().unwrap();
    let (path, content) = fixture(&tmp, "notes.txt", 2500);
    let server = server();
    let (client, connector) = logged_in(&server).await;

    let record = client.upload(&path, UploadOptions::format("text/plain")).await.unwrap();

    assert_eq!(connector.writes(), vec![(0, 1024), (1024, 1024), (2048, 452)]);
    assert_eq!(server.file_content(record.id.unwrap()).unwrap(), content);
}

#[tokio::test]
async fn test_upload_empty_file() {
    let tmp = TempDir::new().unwrap();
    let (path, _) = fixture(&tmp, "empty", 0);
    let server = server();
    let (client, connector) = logged_in(&server).await;

    let record = client.upload(&path, UploadOptions::format("text/plain")).await.unwrap();

    assert_eq!(record.size, Some(0));
    assert_eq!(record.checksum.as_deref(), Some(checksum::digest(b"").as_str()));
    assert!(connector.writes().is_empty());
    // The store is still opened and closed.
    let ops = connector.op_names();
    assert!(ops.contains(&"set_file_id"));
    assert_eq!(ops.last(), Some(&"close"));
}

#[tokio::test]
async fn test_upload_without_format_makes_no_remote_calls() {
    let tmp = TempDir::new().unwrap();
    let (path, _) = fixture(&tmp, "data.bin", 100);
    let server = server();
    let (client, connector) = logged_in(&server).await;
    let before = connector.calls().len();

    let err = client.upload(&path, UploadOptions::default()).await.unwrap_err();
    assert!(matches!(err, ClientError::Configuration(ref m) if m == "no format given"));
    assert_eq!(connector.calls().len(), before);
}

#[tokio::test]
async fn test_upload_missing_file() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.txt");
    let server = server();
    let (client, connector) = logged_in(&server).await;
    let before = connector.calls().len();

    let err = client.upload(&missing, UploadOptions::format("text/plain")).await.unwrap_err();
    assert!(matches!(err, ClientError::NotFound(ref p) if *p == missing));
    assert!(err.to_string().starts_with("File does not exist"));
    assert_eq!(connector.calls().len(), before);
}

#[tokio::test]
async fn test_upload_requires_session() {
    let tmp = TempDir::new().unwrap();
    let (path, _) = fixture(&tmp, "data.bin", 10);
    let server = server();
    let (client, connector) = client(&server);

    let err = client.upload(&path, UploadOptions::format("text/plain")).await.unwrap_err();
    assert!(matches!(err, ClientError::Session { ref message, .. } if message == "No session. Use create_session first."));
    assert!(connector.calls().is_empty());
}

#[tokio::test]
async fn test_write_failure_still_closes_store() {
    let tmp = TempDir::new().unwrap();
    let (path, _) = fixture(&tmp, "big.bin", 4096);
    let server = server();
    let (client, connector) = logged_in(&server).await;
    connector.fail_on("write", 2, || Err(TransportError::ConnectionLost("reset by peer".into())));

    let err = client.upload(&path, UploadOptions::format("bin")).await.unwrap_err();
    assert!(err.is_connection_lost(), "unexpected error {:?}", err);

    // Two writes got through, the third failed, then the store was closed.
    let ops = connector.op_names();
    let tail = &ops[ops.len() - 5..];
    assert_eq!(tail, &["set_file_id", "write", "write", "write", "close"]);
    assert!(server
        .events()
        .iter()
        .any(|e| matches!(e, ServerEvent::StoreClosed { .. })));
}

#[tokio::test]
async fn test_checksum_rejected_on_close() {
    let tmp = TempDir::new().unwrap();
    let (path, _) = fixture(&tmp, "lost.bin", 3000);
    let server = server();
    let (client, connector) = logged_in(&server).await;
    // Writes are acknowledged but never reach the store.
    connector.fail_on("write", 0, || Ok(Reply::Unit));

    let err = client.upload(&path, UploadOptions::format("bin")).await.unwrap_err();
    assert!(matches!(err, ClientError::Remote(RemoteError::ChecksumMismatch(_))));
}

#[tokio::test]
async fn test_upload_updates_existing_record() {
    let tmp = TempDir::new().unwrap();
    let (path, _) = fixture(&tmp, "doc.txt", 1500);
    let server = server();
    let (client, _connector) = logged_in(&server).await;

    let first = client
        .upload(&path, UploadOptions::format("text/plain").with_name("doc"))
        .await
        .unwrap();

    fs::write(&path, b"rewritten").unwrap();
    let second = client
        .upload(&path, UploadOptions::default().with_file(first.clone()))
        .await
        .unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.name.as_deref(), Some("doc"));
    assert_eq!(second.size, Some(9));
    assert_eq!(second.format, first.format);
    assert_eq!(server.file_content(second.id.unwrap()).unwrap(), b"rewritten");
}
