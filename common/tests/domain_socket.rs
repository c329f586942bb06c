//! End-to-end behaviour of the handle over real Unix domain sockets
#![cfg(unix)]

use std::{
    fs,
    os::unix::{fs::PermissionsExt, net::UnixListener},
    path::Path,
    thread,
    time::{Duration, Instant},
};

use linkpipe_common::{config, ConnectionState, ErrorKind, IpcHandle, ReadOutcome};
use tempfile::TempDir;

fn channel(dir: &TempDir, simple: &str) -> String {
    config::make_name_in(dir.path(), simple).unwrap()
}

/// Server bound in `dir` plus a client that is already accepted
fn connected_pair(dir: &TempDir) -> (IpcHandle, IpcHandle) {
    let name = channel(dir, "pair");
    let mut server: IpcHandle = IpcHandle::create_server(&name).unwrap();
    let client: IpcHandle = IpcHandle::connect_client(&name).unwrap();
    server
        .wait_for_connection(Some(Duration::from_secs(5)))
        .unwrap();
    (server, client)
}

#[test]
fn ping_pong_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let name = channel(&dir, "pingpong");
    let mut server: IpcHandle = IpcHandle::create_server(&name).unwrap();
    assert!(server.is_server());
    assert_eq!(server.state(), ConnectionState::Listening);

    let client_name = name.clone();
    let client = thread::spawn(move || {
        let mut client: IpcHandle = IpcHandle::connect_client(&client_name).unwrap();
        client.write_line("PING").unwrap();
        client.read_line(256).unwrap().into_data()
    });

    server.wait_for_connection(None).unwrap();
    assert!(server.is_connected());
    let request = server.read_line(256).unwrap();
    assert_eq!(request, ReadOutcome::Data("PING".to_string()));
    server.write_line("PONG").unwrap();

    assert_eq!(client.join().unwrap().as_deref(), Some("PONG"));
    assert_eq!(server.get_error(), None);
}

#[test]
fn large_payloads_arrive_intact() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, mut client) = connected_pair(&dir);

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let writer = thread::spawn(move || {
        assert_eq!(client.write(&payload).unwrap(), payload.len());
        client
    });

    let mut received = Vec::new();
    while received.len() < expected.len() {
        match server.read(8192).unwrap() {
            ReadOutcome::Data(chunk) => received.extend_from_slice(&chunk),
            ReadOutcome::Eof => break,
        }
    }
    drop(writer.join().unwrap());
    assert_eq!(received, expected);
}

#[test]
fn several_lines_in_one_write_are_all_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, mut client) = connected_pair(&dir);

    client.write_string("hello\nworld\n").unwrap();
    assert_eq!(server.read_line(64).unwrap().into_data().as_deref(), Some("hello"));
    assert_eq!(server.read_line(64).unwrap().into_data().as_deref(), Some("world"));
}

#[test]
fn read_line_reports_eof_after_the_client_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, mut client) = connected_pair(&dir);

    client.write_string("last words").unwrap();
    client.close();

    assert_eq!(
        server.read_line(64).unwrap().into_data().as_deref(),
        Some("last words")
    );
    assert!(server.read_line(64).unwrap().is_eof());
    assert_eq!(server.state(), ConnectionState::Disconnected);
}

#[test]
fn data_available_does_not_consume() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, mut client) = connected_pair(&dir);

    assert!(!server.data_available().unwrap());
    client.write_line("queued").unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !server.data_available().unwrap() {
        assert!(Instant::now() < deadline, "data never became available");
        thread::sleep(Duration::from_millis(5));
    }
    assert!(server.data_available().unwrap());
    assert_eq!(server.read_line(64).unwrap().into_data().as_deref(), Some("queued"));
}

#[test]
fn server_rearms_after_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let name = channel(&dir, "rearm");
    let mut server: IpcHandle = IpcHandle::create_server(&name).unwrap();

    // Nothing attached yet
    server.disconnect().unwrap();
    assert_eq!(server.state(), ConnectionState::Listening);

    for round in 0..3 {
        let mut client: IpcHandle = IpcHandle::connect_client(&name).unwrap();
        server
            .wait_for_connection(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_line(&format!("round {round}")).unwrap();
        let line = server.read_line(64).unwrap().into_data().unwrap();
        assert_eq!(line, format!("round {round}"));
        server.disconnect().unwrap();
        assert_eq!(server.state(), ConnectionState::Listening);
    }
}

#[test]
fn disconnect_detaches_a_live_client() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, mut client) = connected_pair(&dir);

    server.disconnect().unwrap();
    assert_eq!(server.state(), ConnectionState::Listening);

    // The detached client sees the stream end, not a hang
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    assert!(client.read_line(64).unwrap().is_eof());
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[test]
fn socket_file_is_private_to_its_owner() {
    let dir = tempfile::tempdir().unwrap();
    let name = channel(&dir, "private");
    let _server: IpcHandle = IpcHandle::create_server(&name).unwrap();

    let mode = fs::metadata(&name).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn accept_times_out_without_a_client() {
    let dir = tempfile::tempdir().unwrap();
    let mut server: IpcHandle = IpcHandle::create_server(&channel(&dir, "lonely")).unwrap();

    let started = Instant::now();
    let err = server
        .wait_for_connection(Some(Duration::from_millis(50)))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(server.state(), ConnectionState::Listening);
    assert!(server.get_error().is_some());
}

#[test]
fn read_timeout_keeps_the_partial_line() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, mut client) = connected_pair(&dir);
    server
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();

    client.write_string("half").unwrap();
    let err = server.read_line(64).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(server.is_connected());

    client.write_line(" done").unwrap();
    assert_eq!(
        server.read_line(64).unwrap().into_data().as_deref(),
        Some("half done")
    );
}

#[test]
fn operations_after_close_fail() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, mut client) = connected_pair(&dir);

    client.close();
    client.close();
    assert_eq!(client.write(b"x").unwrap_err().kind(), ErrorKind::UseAfterClose);
    assert_eq!(client.read(4).unwrap_err().kind(), ErrorKind::UseAfterClose);
    assert!(client.get_error().unwrap().contains("closed"));

    server.close();
    assert_eq!(
        server.wait_for_connection(None).unwrap_err().kind(),
        ErrorKind::UseAfterClose
    );
}

#[test]
fn second_server_on_a_live_name_fails() {
    let dir = tempfile::tempdir().unwrap();
    let name = channel(&dir, "taken");
    let _first: IpcHandle = IpcHandle::create_server(&name).unwrap();

    let err = IpcHandle::<linkpipe_common::NativeTransport>::create_server(&name).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Creation);
    assert!(err.to_string().contains("already listening"));
}

#[test]
fn stale_socket_file_is_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let name = channel(&dir, "stale");

    // A listener that dies without unlinking leaves the file behind
    drop(UnixListener::bind(&name).unwrap());
    assert!(Path::new(&name).exists());

    let mut server: IpcHandle = IpcHandle::create_server(&name).unwrap();
    let _client: IpcHandle = IpcHandle::connect_client(&name).unwrap();
    server
        .wait_for_connection(Some(Duration::from_secs(5)))
        .unwrap();
}

#[test]
fn closing_the_server_removes_its_socket_file() {
    let dir = tempfile::tempdir().unwrap();
    let name = channel(&dir, "cleanup");
    let mut server: IpcHandle = IpcHandle::create_server(&name).unwrap();
    assert!(Path::new(&name).exists());
    server.close();
    assert!(!Path::new(&name).exists());
}

#[test]
fn connecting_without_a_server_fails() {
    let dir = tempfile::tempdir().unwrap();
    let err = IpcHandle::<linkpipe_common::NativeTransport>::connect_client(&channel(&dir, "nobody"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}

#[test]
fn peer_credentials_name_this_process() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, mut client) = connected_pair(&dir);

    let creds = server.peer_credentials().unwrap();
    assert_eq!(creds.pid, std::process::id());
    assert!(client.peer_credentials().is_ok());
}

#[cfg(target_os = "linux")]
#[test]
fn abstract_names_work_without_a_file() {
    let name = format!("@linkpipe-test-{}", std::process::id());
    let mut server: IpcHandle = IpcHandle::create_server(&name).unwrap();
    let mut client: IpcHandle = IpcHandle::connect_client(&name).unwrap();
    server
        .wait_for_connection(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_line("abstract").unwrap();
    assert_eq!(
        server.read_line(64).unwrap().into_data().as_deref(),
        Some("abstract")
    );
}
