mod common;

use common::{config_in, free_port};
use mailmesh_rs::log::LogHandle;
use mailmesh_rs::runtime::{ShutdownOutcome, Signal};
use mailmesh_rs::{MeshError, Server, StartOptions};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;

fn server_config(port: u16, maildir: &Path, extra: &str) -> String {
    format!(
        "hostname mx.test\n\
         storage.maildir local_mailboxes {{\n    path \"{}\"\n}}\n\
         table.static aliases {{\n    entry postmaster@example.org admin@example.org\n}}\n\
         smtp tcp://127.0.0.1:{} {{\n    deliver_to &local_mailboxes\n    rcpt_rewrite &aliases\n}}\n\
         {}",
        maildir.display(),
        port,
        extra
    )
}

async fn start(dir: &TempDir, body: &str) -> mailmesh_rs::Result<Server> {
    Server::start(
        config_in(dir.path(), body),
        mailmesh_rs::builtin::factories()?,
        &LogHandle::default(),
        StartOptions::default(),
    )
    .await
}

async fn read_reply(reader: &mut BufReader<tokio::net::tcp::ReadHalf<'_>>) -> String {
    let mut reply = String::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        reply.push_str(&line);
        // Multi-line replies use a dash after the code
        if line.len() < 4 || line.as_bytes()[3] != b'-' {
            return reply;
        }
    }
}

async fn send(
    reader: &mut BufReader<tokio::net::tcp::ReadHalf<'_>>,
    writer: &mut tokio::net::tcp::WriteHalf<'_>,
    line: &str,
) -> String {
    writer.write_all(format!("{}\r\n", line).as_bytes()).await.unwrap();
    read_reply(reader).await
}

fn delivered(maildir: &Path, mailbox: &str) -> Vec<String> {
    fs::read_dir(maildir.join(mailbox).join("new"))
        .map(|entries| {
            entries
                .flatten()
                .map(|e| fs::read_to_string(e.path()).unwrap())
                .collect()
        })
        .unwrap_or_default()
}

async fn port_released(port: u16) -> bool {
    for _ in 0..50 {
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_smtp_delivery_and_graceful_shutdown() {
    let dir = TempDir::new().unwrap();
    let maildir = dir.path().join("mail");
    let port = free_port();
    let server = start(&dir, &server_config(port, &maildir, "")).await.unwrap();

    let storage = server
        .resolver()
        .registry()
        .get("local_mailboxes")
        .unwrap()
        .instance
        .as_storage()
        .unwrap();
    let initialized: Vec<String> = server.resolver().registry().initialized().into_iter().collect();
    assert_eq!(initialized, vec!["aliases", "local_mailboxes", "smtp"]);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);

    assert!(read_reply(&mut reader).await.starts_with("220 mx.test"));
    assert!(send(&mut reader, &mut writer, "EHLO client.test").await.starts_with("250-mx.test"));
    assert!(send(&mut reader, &mut writer, "MAIL FROM:<sender@example.net>").await.starts_with("250"));
    assert!(send(&mut reader, &mut writer, "RCPT TO:<user@example.org>").await.starts_with("250"));
    assert!(send(&mut reader, &mut writer, "RCPT TO:<postmaster@example.org>").await.starts_with("250"));
    assert!(send(&mut reader, &mut writer, "DATA").await.starts_with("354"));
    writer
        .write_all(b"Subject: hello\r\n\r\nHi there\r\n.\r\n")
        .await
        .unwrap();
    assert!(read_reply(&mut reader).await.starts_with("250 OK: Message accepted"));
    assert!(send(&mut reader, &mut writer, "QUIT").await.starts_with("221"));
    drop(reader);

    let user = delivered(&maildir, "user@example.org");
    assert_eq!(user.len(), 1);
    assert!(user[0].contains("Hi there"));
    assert_eq!(delivered(&maildir, "admin@example.org").len(), 1);
    assert!(delivered(&maildir, "postmaster@example.org").is_empty());

    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(Signal::Terminate).unwrap();
    let outcome = server.serve(rx).await;
    assert_eq!(outcome, ShutdownOutcome::Graceful);
    assert_eq!(outcome.exit_code(), 0);

    // Storage close hook ran
    let err = storage.deliver("user@example.org", b"late").await.unwrap_err();
    assert!(err.to_string().contains("closed"));
    // Endpoint close hook ran
    assert!(port_released(port).await);
}

#[tokio::test]
async fn test_orphan_block_fails_startup_and_releases_listener() {
    let dir = TempDir::new().unwrap();
    let maildir = dir.path().join("mail");
    let port = free_port();
    let body = server_config(port, &maildir, "table.static orphan {\n    entry a b\n}\n");

    let err = start(&dir, &body).await.err().unwrap();
    match &err {
        MeshError::UnusedBlock {
            instance, module, ..
        } => {
            assert_eq!(instance, "orphan");
            assert_eq!(module, "table.static");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(err.to_string().starts_with("Unused configuration block at test.conf:"));
    assert!(port_released(port).await);
}

#[tokio::test]
async fn test_deliver_to_non_storage_rejected() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let body = format!(
        "table.static aliases\nsmtp tcp://127.0.0.1:{} {{\n    deliver_to &aliases\n}}\n",
        port
    );
    let err = start(&dir, &body).await.err().unwrap();
    assert!(
        err.to_string().contains("table.static (aliases) is not a storage"),
        "unexpected error: {}",
        err
    );
}

#[tokio::test]
async fn test_inline_storage_definition() {
    let dir = TempDir::new().unwrap();
    let maildir = dir.path().join("inline");
    let port = free_port();
    let body = format!(
        "smtp tcp://127.0.0.1:{} {{\n    deliver_to storage.maildir {{\n        path \"{}\"\n    }}\n}}\n",
        port,
        maildir.display()
    );
    let server = start(&dir, &body).await.unwrap();
    assert!(maildir.is_dir());
    server.finish();
}

#[tokio::test]
async fn test_relative_maildir_resolves_against_state_dir() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let body = format!(
        "storage.maildir local {{\n    path boxes\n}}\nsmtp tcp://127.0.0.1:{} {{\n    deliver_to &local\n}}\n",
        port
    );
    let server = start(&dir, &body).await.unwrap();
    assert!(dir.path().join("state").join("boxes").is_dir());
    server.finish();
}

#[tokio::test]
async fn test_auth_map_table_counts_as_used() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let body = format!(
        "auth_map &credentials\n\
         table.static credentials {{\n    entry alice@example.org alice\n}}\n\
         storage.maildir local\n\
         smtp tcp://127.0.0.1:{} {{\n    deliver_to &local\n}}\n",
        port
    );
    let server = start(&dir, &body).await.unwrap();

    let auth_map = server.resolver().auth_map().unwrap();
    assert_eq!(auth_map.lookup("alice@example.org").as_deref(), Some("alice"));
    assert!(server.resolver().registry().initialized().contains("credentials"));
    server.finish();
}

#[tokio::test]
async fn test_auth_map_must_be_a_table() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let body = format!(
        "auth_map &local\nstorage.maildir local\nsmtp tcp://127.0.0.1:{} {{\n    deliver_to &local\n}}\n",
        port
    );
    let err = start(&dir, &body).await.err().unwrap();
    assert!(
        err.to_string().contains("auth_map: storage.maildir (local) is not a table"),
        "unexpected error: {}",
        err
    );
}
