//! Integration tests for the WebSocket transport.
//!
//! These spin up a real listener on an OS-assigned port and drive it with
//! a `tokio-tungstenite` client, checking that frames, close codes and
//! peer metadata make it across the socket.

#[cfg(feature = "websocket")]
mod websocket {
    use futures_util::{SinkExt, StreamExt};
    use tether_transport::{
        CloseInfo, Connection, Incoming, Transport, WebSocketConnection,
        WebSocketTransport,
    };
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    type ClientWs = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    /// Binds a transport, connects one client to it, and returns both ends.
    async fn pair() -> (WebSocketConnection, ClientWs) {
        let mut transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("should have addr");

        let server_handle = tokio::spawn(async move {
            transport.accept().await.expect("should accept")
        });

        let mut request = format!("ws://{addr}")
            .into_client_request()
            .expect("valid request");
        request
            .headers_mut()
            .insert("user-agent", "tether-test/1.0".parse().unwrap());
        let (client, _) = tokio_tungstenite::connect_async(request)
            .await
            .expect("client should connect");

        let server = server_handle.await.expect("task should complete");
        (server, client)
    }

    #[tokio::test]
    async fn test_websocket_send_and_receive_text_frames() {
        let (server, mut client) = pair().await;
        assert!(server.id().into_inner() > 0);

        server
            .send(br#"{"type":"sync"}"#)
            .await
            .expect("send should succeed");
        let msg = client.next().await.unwrap().unwrap();
        assert!(msg.is_text(), "frames go out as text");
        assert_eq!(msg.into_text().unwrap().as_str(), r#"{"type":"sync"}"#);

        client
            .send(Message::Text(r#"{"type":"open"}"#.into()))
            .await
            .unwrap();
        let received = server.recv().await.expect("recv should succeed");
        assert_eq!(received, Incoming::Data(br#"{"type":"open"}"#.to_vec()));
    }

    #[tokio::test]
    async fn test_websocket_records_peer_info() {
        let (server, _client) = pair().await;

        let peer = server.peer();
        assert!(peer.addr.is_some());
        assert_eq!(peer.user_agent.as_deref(), Some("tether-test/1.0"));
    }

    #[tokio::test]
    async fn test_websocket_recv_reports_peer_close_code() {
        let (server, mut client) = pair().await;

        client
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "reload".into(),
            })))
            .await
            .unwrap();

        let result = server.recv().await.expect("recv should not error");
        assert_eq!(
            result,
            Incoming::Closed(Some(CloseInfo::new(1001, "reload")))
        );
    }

    #[tokio::test]
    async fn test_websocket_close_sends_code_to_peer() {
        let (server, mut client) = pair().await;

        server.close(4000, "replaced").await.expect("close should succeed");

        let msg = client.next().await.unwrap().unwrap();
        match msg {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 4000);
                assert_eq!(frame.reason.as_str(), "replaced");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}
