use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tether::prelude::*;
use tracing::info;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// `authorize` data.
#[derive(Debug, Deserialize)]
struct Login {
    name: String,
}

/// `chat` event data as clients send it.
#[derive(Debug, Deserialize)]
struct ChatMessage {
    text: String,
}

/// `chat` event data as members receive it.
#[derive(Debug, Serialize, PartialEq)]
struct ChatLine {
    from: String,
    text: String,
}

const MAX_NAME_LEN: usize = 32;
const MAX_TEXT_LEN: usize = 500;

fn parse<T: for<'de> Deserialize<'de>>(data: Value) -> Result<T, ServiceError> {
    serde_json::from_value(data)
        .map_err(|e| ServiceError::new(ErrorCode::SchemaViolation.as_u16(), e.to_string()))
}

fn validate_name(login: Login) -> Result<String, ServiceError> {
    let name = login.name.trim();
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(ServiceError::precondition_failed(format!(
            "name must be 1-{MAX_NAME_LEN} characters"
        )));
    }
    Ok(name.to_owned())
}

fn chat_line(from: &str, message: ChatMessage) -> Result<ChatLine, ServiceError> {
    let text = message.text.trim();
    if text.is_empty() {
        return Err(ServiceError::precondition_failed("empty message"));
    }
    if text.len() > MAX_TEXT_LEN {
        return Err(ServiceError::precondition_failed(format!(
            "message longer than {MAX_TEXT_LEN} bytes"
        )));
    }
    Ok(ChatLine {
        from: from.to_owned(),
        text: text.to_owned(),
    })
}

fn string_arg(args: &[Value], index: usize, name: &str) -> Result<String, ServiceError> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| {
            ServiceError::new(
                ErrorCode::SchemaViolation.as_u16(),
                format!("argument {index} (`{name}`) must be a string"),
            )
        })
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Chat rooms: log in with a name, join rooms, talk.
fn lobby() -> Service {
    Service::builder("lobby")
        .on_authorize(|ctx, data| async move {
            let name = validate_name(parse(data)?)?;
            info!(session_id = %ctx.session_id(), name, "logged in");
            Ok::<_, ServiceError>(Authorization {
                data: json!({ "name": name }),
                user: name,
            })
        })
        .on_join(|ctx, room, _params| async move {
            let name = ctx.require_user()?.to_owned();
            info!(room, name, "joining room");
            Ok::<_, ServiceError>(name)
        })
        .on_leave(|ctx, room| async move {
            info!(room, name = ?ctx.user(), "left room");
            Ok(())
        })
        .event("chat", |ctx, room, data| async move {
            let line = chat_line(ctx.require_user()?, parse(data)?)?;
            let data = serde_json::to_value(line).map_err(|_| ServiceError::internal())?;
            ctx.handle().send_event(&room, Recipient::All, "chat", data)?;
            Ok::<_, ServiceError>(())
        })
        .event("typing", |ctx, room, _data| async move {
            let name = ctx.require_user()?.to_owned();
            let others = Recipient::AllExcept(ctx.session_id().clone());
            ctx.handle()
                .send_event(&room, others, "typing", json!({ "from": name }))?;
            Ok::<_, ServiceError>(())
        })
        .request("ping", |_ctx, _args| async { Ok(json!("pong")) })
        .request("whisper", |ctx, args| async move {
            let from = ctx.require_user()?.to_owned();
            let room = string_arg(&args, 0, "room")?;
            let to = string_arg(&args, 1, "to")?;
            let text = string_arg(&args, 2, "text")?;
            let line = chat_line(&from, ChatMessage { text })?;
            let data = serde_json::to_value(line).map_err(|_| ServiceError::internal())?;
            ctx.handle()
                .send_event(&room, Recipient::User(to), "whisper", data)?;
            Ok::<_, ServiceError>(Value::Null)
        })
        .request("close", |ctx, args| async move {
            ctx.require_user()?;
            let room = string_arg(&args, 0, "room")?;
            ctx.handle().close_group(&room)?;
            Ok::<_, ServiceError>(Value::Null)
        })
        .request("logout", |ctx, _args| async move {
            ctx.handle().logout(ctx.session_id())?;
            Ok::<_, ServiceError>(Value::Null)
        })
        .build()
}

// ---------------------------------------------------------------------------
// Server bootstrap
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let addr = std::env::var("TETHER_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    info!(%addr, "starting lobby server");

    let server = TetherServer::builder()
        .bind(&addr)
        .service(lobby())
        .build()
        .await?;

    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
            handle.shutdown();
        }
    });

    server.run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;

    type Ws = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn start() -> String {
        let server = TetherServer::builder()
            .bind("127.0.0.1:0")
            .service(lobby())
            .build()
            .await
            .unwrap();
        let addr = server.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        addr
    }

    async fn ws(addr: &str) -> Ws {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        ws
    }

    async fn send(ws: &mut Ws, frame: Value) {
        ws.send(Message::Text(frame.to_string().into())).await.unwrap();
    }

    async fn recv(ws: &mut Ws) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timeout")
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    /// Connected, logged in as `name` and inside room `main`.
    async fn member(addr: &str, name: &str) -> Ws {
        let mut ws = ws(addr).await;
        send(&mut ws, json!({"type": "open", "body": {"version": 1}})).await;
        assert_eq!(recv(&mut ws).await["type"], "session");

        send(
            &mut ws,
            json!({
                "type": "authorize",
                "id": 1,
                "body": {"service": "lobby", "data": {"name": name}}
            }),
        )
        .await;
        let reply = recv(&mut ws).await;
        assert_eq!(reply["body"]["data"]["name"], name);

        send(
            &mut ws,
            json!({"type": "join", "id": 2, "body": {"service": "lobby", "group": "main"}}),
        )
        .await;
        assert_eq!(recv(&mut ws).await["type"], "join");
        ws
    }

    #[tokio::test]
    async fn test_chat_reaches_every_member() {
        let addr = start().await;
        let mut alice = member(&addr, "alice").await;
        let mut bob = member(&addr, "bob").await;
        assert_eq!(recv(&mut alice).await["type"], "enter");

        send(
            &mut bob,
            json!({"type": "event", "id": 3, "body": {
                "service": "lobby", "group": "main", "type": "chat", "data": {"text": " hi "}
            }}),
        )
        .await;

        for ws in [&mut alice, &mut bob] {
            let event = recv(ws).await;
            assert_eq!(event["type"], "event");
            assert_eq!(event["body"]["data"], json!({"from": "bob", "text": "hi"}));
        }
    }

    #[tokio::test]
    async fn test_whisper_reaches_only_its_target() {
        let addr = start().await;
        let mut alice = member(&addr, "alice").await;
        let mut bob = member(&addr, "bob").await;
        assert_eq!(recv(&mut alice).await["type"], "enter");

        send(
            &mut bob,
            json!({"type": "request", "id": 3, "body": {
                "service": "lobby", "method": "whisper", "args": ["main", "alice", "psst"]
            }}),
        )
        .await;

        let whisper = recv(&mut alice).await;
        assert_eq!(whisper["body"]["type"], "whisper");
        assert_eq!(whisper["body"]["data"]["text"], "psst");
        assert_eq!(recv(&mut bob).await["type"], "response");
    }

    #[tokio::test]
    async fn test_close_room_removes_everyone() {
        let addr = start().await;
        let mut alice = member(&addr, "alice").await;

        send(
            &mut alice,
            json!({"type": "request", "id": 3, "body": {
                "service": "lobby", "method": "close", "args": ["main"]
            }}),
        )
        .await;

        let mut kinds = vec![
            recv(&mut alice).await["type"].clone(),
            recv(&mut alice).await["type"].clone(),
        ];
        kinds.sort_by_key(|v| v.to_string());
        assert_eq!(kinds, vec![json!("leave"), json!("response")]);
    }

    #[test]
    fn test_validate_name_trims_and_bounds() {
        let name = validate_name(Login {
            name: "  ada ".into(),
        });
        assert_eq!(name, Ok("ada".to_string()));

        let err = validate_name(Login { name: "   ".into() }).unwrap_err();
        assert_eq!(err.code, 412);

        let err = validate_name(Login {
            name: "x".repeat(MAX_NAME_LEN + 1),
        })
        .unwrap_err();
        assert_eq!(err.code, 412);
    }

    #[test]
    fn test_chat_line_rejects_empty_and_long_text() {
        assert!(chat_line("a", ChatMessage { text: " ".into() }).is_err());
        assert!(
            chat_line(
                "a",
                ChatMessage {
                    text: "x".repeat(MAX_TEXT_LEN + 1)
                }
            )
            .is_err()
        );
        assert_eq!(
            chat_line("a", ChatMessage { text: "hey".into() }),
            Ok(ChatLine {
                from: "a".into(),
                text: "hey".into()
            })
        );
    }

    #[test]
    fn test_parse_reports_schema_violation() {
        let err = parse::<Login>(json!({"nickname": "x"})).unwrap_err();
        assert_eq!(err.code, 422);
        assert!(err.message.contains("name"));
    }

    #[test]
    fn test_string_arg() {
        let args = vec![json!("main"), json!(3)];
        assert_eq!(string_arg(&args, 0, "room"), Ok("main".to_string()));
        assert_eq!(string_arg(&args, 1, "to").unwrap_err().code, 422);
        assert_eq!(string_arg(&args, 2, "text").unwrap_err().code, 422);
    }
}
