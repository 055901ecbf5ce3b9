mod common;

use bytes::Bytes;
use common::{bulk, connect, error_message, eventually, history, simple};
use rand::Rng;
use redis_protocol::resp2::types::BytesFrame;
use redis_stub::codec::is_null_bulk;
use redis_stub::{harness, Command, StubConfig, StubServer};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

#[tokio::test]
async fn ping_without_args_replies_pong() {
    let server = harness::run().await;
    let mut client = connect(&server).await;

    assert_eq!(client.send(&["PING"]).await, simple("PONG"));
    assert_eq!(server.handled_commands(), 1);
    assert_eq!(server.commands(), history(&[&["PING"]]));
}

#[tokio::test]
async fn ping_with_argument_echoes_bulk_string() {
    let server = harness::run().await;
    let mut client = connect(&server).await;

    assert_eq!(client.send(&["ping", "hello"]).await, bulk("hello"));
    assert_eq!(server.commands(), history(&[&["PING", "hello"]]));
}

#[tokio::test]
async fn command_replies_with_array() {
    let server = harness::run().await;
    let mut client = connect(&server).await;

    assert_eq!(
        client.send(&["COMMAND"]).await,
        BytesFrame::Array(vec![bulk("OK")])
    );
}

#[tokio::test]
async fn unknown_command_keeps_connection_usable() {
    let server = harness::run().await;
    let mut client = connect(&server).await;

    let reply = client.send(&["FOOBAR", "x"]).await;
    assert_eq!(error_message(&reply), "ERR unknown command 'FOOBAR'");

    assert_eq!(client.send(&["PING"]).await, simple("PONG"));
    assert_eq!(server.handled_commands(), 1);
    assert_eq!(
        server.commands(),
        history(&[&["FOOBAR", "x"], &["PING"]])
    );
}

#[tokio::test]
async fn truncated_frame_closes_connection_without_dispatch() {
    let server = harness::run().await;
    let mut client = connect(&server).await;

    client.write_raw(b"*2\r\n$3\r\nfoo").await.unwrap();
    client.stream.shutdown().await.unwrap();

    let reply = client.read_frame().await.expect("protocol error frame");
    assert_eq!(error_message(&reply), "ERR invalid RESP protocol syntax");
    assert!(client.read_frame().await.is_none());

    assert_eq!(server.handled_commands(), 0);
    assert!(server.commands().is_empty());
}

#[tokio::test]
async fn inline_command_is_a_protocol_error() {
    let server = harness::run().await;
    let mut client = connect(&server).await;

    client.write_raw(b"PING\r\n").await.unwrap();

    let reply = client.read_frame().await.expect("protocol error frame");
    assert_eq!(error_message(&reply), "ERR invalid RESP protocol syntax");
    assert!(client.read_frame().await.is_none());
    assert!(eventually(|| server.open_connections() == 0).await);
}

#[tokio::test]
async fn binary_arguments_are_echoed_and_recorded_verbatim() {
    let server = harness::run().await;
    server.register("ECHO", |conn, args| conn.write_bulk_string(&args[0]));
    let mut client = connect(&server).await;

    client
        .write_raw(b"*2\r\n$4\r\nECHO\r\n$2\r\n\xff\xfe\r\n")
        .await
        .unwrap();
    assert_eq!(
        client.read_frame().await,
        Some(BytesFrame::BulkString(Bytes::from_static(b"\xff\xfe")))
    );
    assert_eq!(
        server.commands(),
        vec![Command::new("ECHO", [&b"\xff\xfe"[..]])]
    );
}

#[tokio::test]
async fn unterminated_header_line_is_rejected() {
    let server = harness::run().await;
    let mut client = connect(&server).await;

    let mut raw = vec![b'*'];
    raw.extend(std::iter::repeat(b'9').take(200));
    client.write_raw(&raw).await.unwrap();

    let reply = client.read_frame().await.expect("protocol error frame");
    assert_eq!(error_message(&reply), "ERR invalid RESP protocol syntax");
    assert!(client.read_frame().await.is_none());
    assert!(eventually(|| server.open_connections() == 0).await);
}

#[tokio::test]
async fn panicking_handler_closes_connection_and_is_untracked() {
    let server = harness::run().await;
    server.register("BOOM", |conn, args| conn.write_bulk_string(&args[5]));
    let mut client = connect(&server).await;

    let reply = client.send(&["BOOM"]).await;
    assert_eq!(error_message(&reply), "ERR handler for 'BOOM' panicked");
    assert!(client.read_frame().await.is_none());
    assert!(eventually(|| server.open_connections() == 0).await);

    let panics = server.handler_panics();
    assert_eq!(panics.len(), 1);
    assert!(panics[0].starts_with("handler for 'BOOM' panicked"));

    // Other clients are unaffected.
    let mut other = connect(&server).await;
    assert_eq!(other.send(&["PING"]).await, simple("PONG"));
}

#[tokio::test]
#[should_panic(expected = "handler for 'CHECK' panicked")]
async fn stop_reraises_handler_panics() {
    let server = harness::run().await;
    server.register("CHECK", |_, args| assert!(args.is_empty(), "unexpected args"));
    let mut client = connect(&server).await;

    error_message(&client.send(&["CHECK", "x"]).await);
    server.stop().await;
}

#[tokio::test]
async fn oversized_bulk_string_is_rejected() {
    let mut config = StubConfig::default();
    config.server.max_bulk_len = 8;
    let server = StubServer::start(&config).await.unwrap();
    let mut client = connect(&server).await;

    assert_eq!(client.send(&["PING", "12345678"]).await, bulk("12345678"));

    // The length header alone is enough to reject the request.
    client
        .write_raw(b"*2\r\n$4\r\nPING\r\n$16\r\n")
        .await
        .unwrap();
    let reply = client.read_frame().await.expect("protocol error frame");
    assert!(error_message(&reply).starts_with("ERR"));
    assert!(client.read_frame().await.is_none());
    assert_eq!(server.commands().len(), 1);
}

#[tokio::test]
async fn history_preserves_send_order() {
    let server = harness::run().await;
    server.register("SET", |conn, _| conn.write_ok());
    let mut client = connect(&server).await;

    let mut expected = Vec::new();
    for i in 0..50 {
        let key = format!("key-{i}");
        let value = format!("value-{i}");
        assert_eq!(client.send(&["set", &key, &value]).await, simple("OK"));
        expected.push(Command::new("SET", [key, value]));
    }

    assert_eq!(server.commands(), expected);
    assert_eq!(server.handled_commands(), 50);
}

#[tokio::test]
async fn pipelined_requests_are_answered_in_order() {
    let server = harness::run().await;
    server.register("ECHO", |conn, args| conn.write_bulk_string(&args[0]));
    let mut client = connect(&server).await;

    for i in 0..20 {
        client
            .write_command(&["ECHO", &i.to_string()])
            .await
            .unwrap();
    }
    for i in 0..20 {
        assert_eq!(client.read_frame().await, Some(bulk(&i.to_string())));
    }
}

#[tokio::test]
async fn dispatched_count_excludes_unknown_commands() {
    let server = harness::run().await;
    server.register("GET", |conn, _| conn.write_null());
    let mut client = connect(&server).await;

    assert_eq!(client.send(&["GET", "a"]).await, BytesFrame::Null);
    error_message(&client.send(&["BOGUS"]).await);
    assert_eq!(client.send(&["get", "b"]).await, BytesFrame::Null);
    error_message(&client.send(&["ALSO_BOGUS", "1", "2"]).await);

    assert_eq!(server.handled_commands(), 2);
    assert_eq!(server.commands().len(), 4);
}

#[tokio::test]
async fn handlers_can_be_registered_and_replaced_while_serving() {
    let server = harness::run().await;
    let mut client = connect(&server).await;

    error_message(&client.send(&["VERSION"]).await);

    server.register("version", |conn, _| conn.write_integer(1));
    assert_eq!(client.send(&["VERSION"]).await, BytesFrame::Integer(1));

    server.register("VERSION", |conn, _| conn.write_integer(2));
    assert_eq!(client.send(&["Version"]).await, BytesFrame::Integer(2));

    assert_eq!(server.handled_commands(), 2);
}

#[tokio::test]
async fn handler_response_shapes() {
    let server = harness::run().await;
    server.register("INT", |conn, _| conn.write_integer(-42));
    server.register("FAIL", |conn, _| {
        conn.write_error("WRONGTYPE Operation against a key holding the wrong kind of value")
    });
    server.register("NIL", |conn, _| conn.write_null());
    server.register("LIST", |conn, _| conn.write_array(&["a", "", "nil", "b"]));
    server.register("STATUS", |conn, _| conn.write_simple_string("multi\nline"));
    let mut client = connect(&server).await;

    assert_eq!(client.send(&["INT"]).await, BytesFrame::Integer(-42));
    assert!(error_message(&client.send(&["FAIL"]).await).starts_with("WRONGTYPE"));
    assert_eq!(client.send(&["NIL"]).await, BytesFrame::Null);
    assert_eq!(
        client.send(&["LIST"]).await,
        BytesFrame::Array(vec![bulk("a"), BytesFrame::Null, BytesFrame::Null, bulk("b")])
    );
    assert_eq!(client.send(&["STATUS"]).await, simple("multi line"));
}

#[tokio::test]
async fn null_request_element_reaches_handler_as_sentinel() {
    let server = harness::run().await;
    server.register("ECHO", |conn, args| match args {
        [arg] if is_null_bulk(arg) => conn.write_null(),
        [arg] => conn.write_bulk_string(arg),
        _ => conn.write_error("ERR wrong number of arguments for 'echo' command"),
    });
    let mut client = connect(&server).await;

    client
        .write_raw(b"*2\r\n$4\r\nECHO\r\n$-1\r\n")
        .await
        .unwrap();
    assert_eq!(client.read_frame().await, Some(BytesFrame::Null));
    assert_eq!(client.send(&["ECHO", "x"]).await, bulk("x"));
}

#[tokio::test]
async fn quit_replies_ok_then_closes() {
    let server = harness::run().await;
    let mut client = connect(&server).await;

    assert_eq!(client.send(&["QUIT"]).await, simple("OK"));
    assert!(client.read_frame().await.is_none());
    assert!(eventually(|| server.open_connections() == 0).await);
}

#[tokio::test]
async fn connections_are_counted_and_untracked() {
    let server = harness::run().await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = connect(&server).await;
        assert_eq!(client.send(&["PING"]).await, simple("PONG"));
        clients.push(client);
    }
    assert_eq!(server.handled_connections(), 3);
    assert_eq!(server.open_connections(), 3);

    drop(clients);
    assert!(eventually(|| server.open_connections() == 0).await);
    assert_eq!(server.handled_connections(), 3);
}

#[tokio::test]
async fn stop_closes_open_connections_and_waits() {
    let server = harness::run().await;
    let mut client = connect(&server).await;
    assert_eq!(client.send(&["PING"]).await, simple("PONG"));

    server.stop().await;

    assert_eq!(server.open_connections(), 0);
    assert!(client.read_frame().await.is_none());
    assert!(tokio::net::TcpStream::connect(server.local_addr())
        .await
        .is_err());

    server.stop().await;
}

#[tokio::test]
async fn concurrent_connections_never_corrupt_each_other() {
    let server = Arc::new(harness::run().await);
    // BLOB <byte> <len>: a bulk string of `len` copies of `byte`.
    server.register("BLOB", |conn, args| {
        let byte = args[0][0];
        let len: usize = std::str::from_utf8(&args[1])
            .ok()
            .and_then(|len| len.parse().ok())
            .unwrap_or(0);
        conn.write_bulk_string(vec![byte; len]);
    });

    let mut tasks = Vec::new();
    for client_id in 0..8u8 {
        let server = Arc::clone(&server);
        tasks.push(tokio::spawn(async move {
            let mut client = connect(&server).await;
            let fill = ((b'a' + client_id) as char).to_string();
            for _ in 0..50 {
                let len = rand::thread_rng().gen_range(0..8192usize);
                let reply = client.send(&["BLOB", &fill, &len.to_string()]).await;
                let BytesFrame::BulkString(data) = reply else {
                    panic!("client {client_id} got a non-bulk reply");
                };
                assert_eq!(data.len(), len);
                assert!(data.iter().all(|b| *b == fill.as_bytes()[0]));
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(server.handled_connections(), 8);
    assert_eq!(server.handled_commands(), 400);
    assert_eq!(server.commands().len(), 400);
}
